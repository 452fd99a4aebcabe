//! Metadata download and upload handlers

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{info, warn};

use super::{HandlerContext, HandlerError};
use crate::dhis::{with_inline_retry, DhisClient, UpstreamError};
use crate::jobs::{JobEnvelope, JobKind, MetadataSource};
use crate::queues::QueueKind;

/// Collections pulled into the transitive dependency closure of the
/// selected dashboards, visualizations and maps.
const CLOSURE_COLLECTIONS: [(&str, &str); 3] = [
    ("dataElement", "dataElements"),
    ("indicator", "indicators"),
    ("legendSet", "legendSets"),
];

/// Reads metadata objects either directly from the source instance or
/// through the destination's route proxy.
struct MetadataReader {
    client: DhisClient,
    route: Option<String>,
}

impl MetadataReader {
    fn path(&self, path: &str) -> String {
        match &self.route {
            Some(route) => DhisClient::routed_path(route, path),
            None => path.to_string(),
        }
    }

    async fn object(&self, path: &str, fields: &str) -> Result<Value, UpstreamError> {
        let path = self.path(path);
        with_inline_retry(|| self.client.metadata_object(&path, fields)).await
    }

    async fn by_ids(
        &self,
        collection: &str,
        ids: &[String],
        fields: &str,
    ) -> Result<Vec<Value>, UpstreamError> {
        let path = self.path(&format!("api/{collection}.json"));
        with_inline_retry(|| self.client.metadata_by_ids(&path, collection, ids, fields)).await
    }
}

pub(super) async fn download(
    ctx: &HandlerContext,
    envelope: &JobEnvelope,
    metadata_source: MetadataSource,
    selected_dashboards: &[String],
    selected_visualizations: &[String],
    selected_maps: &[String],
) -> Result<(), HandlerError> {
    let config = ctx.config(&envelope.config_id)?;
    let total_items =
        selected_dashboards.len() + selected_visualizations.len() + selected_maps.len();

    if total_items == 0 {
        info!(
            config_id = %envelope.config_id,
            job_id = %envelope.job_id,
            "metadata download with empty selection, nothing to do"
        );
        return Ok(());
    }

    let bundle = match metadata_source {
        MetadataSource::PortalConfig => config.portal_metadata.clone().ok_or_else(|| {
            HandlerError::PayloadInvalid(format!(
                "config {} carries no portal metadata",
                envelope.config_id
            ))
        })?,
        MetadataSource::Source => {
            // reads go through the destination's route proxy when the
            // source declares one
            let reader = match &config.source.route_id {
                Some(route) => MetadataReader {
                    client: ctx.destination_client(&config),
                    route: Some(route.clone()),
                },
                None => MetadataReader {
                    client: ctx.source_client(&config),
                    route: None,
                },
            };
            build_bundle(
                &reader,
                selected_dashboards,
                selected_visualizations,
                selected_maps,
            )
            .await?
        }
    };

    let upload = JobEnvelope::new(
        envelope.config_id.clone(),
        JobKind::MetadataUpload {
            payload: Some(bundle),
            scratch_path: None,
        },
    );
    ctx.publish_job(QueueKind::MetadataUpload, &upload).await?;

    info!(
        config_id = %envelope.config_id,
        job_id = %envelope.job_id,
        total_items,
        upload_job_id = %upload.job_id,
        "metadata bundle queued for upload"
    );
    Ok(())
}

async fn build_bundle(
    reader: &MetadataReader,
    selected_dashboards: &[String],
    selected_visualizations: &[String],
    selected_maps: &[String],
) -> Result<Value, HandlerError> {
    let mut dashboards = Vec::new();
    for id in selected_dashboards {
        dashboards.push(
            reader
                .object(
                    &format!("api/dashboards/{id}.json"),
                    ":owner,dashboardItems[type,visualization[id],map[id]]",
                )
                .await?,
        );
    }

    // dashboard items widen the visualization and map selections
    let mut visualization_ids: BTreeSet<String> =
        selected_visualizations.iter().cloned().collect();
    let mut map_ids: BTreeSet<String> = selected_maps.iter().cloned().collect();
    for dashboard in &dashboards {
        collect_refs(dashboard, "visualization", &mut visualization_ids);
        collect_refs(dashboard, "map", &mut map_ids);
    }

    let mut visualizations = Vec::new();
    for id in &visualization_ids {
        visualizations.push(
            reader
                .object(&format!("api/visualizations/{id}.json"), ":owner")
                .await?,
        );
    }
    let mut maps = Vec::new();
    for id in &map_ids {
        maps.push(
            reader
                .object(&format!("api/maps/{id}.json"), ":owner")
                .await?,
        );
    }

    let mut bundle = serde_json::Map::new();
    bundle.insert("dashboards".to_string(), Value::Array(dashboards));
    bundle.insert("visualizations".to_string(), Value::Array(visualizations));
    bundle.insert("maps".to_string(), Value::Array(maps));

    // resolve the dependency closure referenced anywhere in the bundle
    let snapshot = Value::Object(bundle.clone());
    for (ref_key, collection) in CLOSURE_COLLECTIONS {
        let mut ids = BTreeSet::new();
        collect_refs(&snapshot, ref_key, &mut ids);
        collect_refs(&snapshot, collection, &mut ids);
        if ids.is_empty() {
            continue;
        }
        let ids: Vec<String> = ids.into_iter().collect();
        let objects = reader.by_ids(collection, &ids, ":owner").await?;
        bundle.insert(collection.to_string(), Value::Array(objects));
    }

    Ok(Value::Object(bundle))
}

/// Collect `{ "id": ... }` references found under `key` anywhere in the
/// tree, whether the key holds a single reference or an array of them.
fn collect_refs(value: &Value, key: &str, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(reference) = map.get(key) {
                match reference {
                    Value::Object(obj) => {
                        if let Some(id) = obj.get("id").and_then(Value::as_str) {
                            out.insert(id.to_string());
                        }
                    }
                    Value::Array(items) => {
                        for item in items {
                            if let Some(id) = item.get("id").and_then(Value::as_str) {
                                out.insert(id.to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
            for nested in map.values() {
                collect_refs(nested, key, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs(item, key, out);
            }
        }
        _ => {}
    }
}

pub(super) async fn upload(
    ctx: &HandlerContext,
    envelope: &JobEnvelope,
    payload: Option<&Value>,
    scratch_path: Option<&str>,
) -> Result<(), HandlerError> {
    let config = ctx.config(&envelope.config_id)?;

    let bundle: Value = match (payload, scratch_path) {
        (Some(payload), _) => payload.clone(),
        (None, Some(path)) => ctx.scratch.read_json(path).await?,
        (None, None) => {
            return Err(HandlerError::PayloadInvalid(
                "metadata upload carries neither payload nor scratch path".to_string(),
            ))
        }
    };

    let destination = ctx.destination_client(&config);
    let result = with_inline_retry(|| destination.post_metadata(&bundle)).await;

    match result {
        Ok(summary) => {
            let counts = summary.counts().unwrap_or_default();
            info!(
                config_id = %envelope.config_id,
                job_id = %envelope.job_id,
                imported = counts.imported,
                updated = counts.updated,
                ignored = counts.ignored,
                "metadata imported"
            );
            if let Some(path) = scratch_path {
                ctx.scratch.remove(path).await?;
            }
            Ok(())
        }
        // 409 on metadata import is a partial success, not a failure
        Err(UpstreamError::Conflict {
            imported, ignored, ..
        }) => {
            warn!(
                config_id = %envelope.config_id,
                job_id = %envelope.job_id,
                imported,
                ignored,
                "metadata import reported conflicts, continuing"
            );
            ctx.metrics.upload_conflicted();
            if let Some(path) = scratch_path {
                ctx.scratch.remove(path).await?;
            }
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
