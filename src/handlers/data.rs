//! Data download, upload and deletion handlers

use tracing::{debug, info, warn};

use super::{HandlerContext, HandlerError};
use crate::dhis::models::{DataValueSet, ImportStrategy};
use crate::dhis::{with_inline_retry, UpstreamError};
use crate::jobs::{JobEnvelope, JobKind, RuntimeOverrides, UploadSource};
use crate::mapping::{attribute_fan_out, MappingEngine, TranslationTable};
use crate::queues::QueueKind;

/// Fetch one `(dataItemConfig, period)` slice from the source, translate
/// identifiers, persist the payload to a scratch file and queue the
/// upload (or deletion).
pub(super) async fn download(
    ctx: &HandlerContext,
    envelope: &JobEnvelope,
    data_item_config_id: &str,
    period_id: &str,
    overrides: &RuntimeOverrides,
    is_delete: bool,
) -> Result<(), HandlerError> {
    let config = ctx.config(&envelope.config_id)?;
    let item = config.data_item(data_item_config_id).ok_or_else(|| {
        HandlerError::PayloadInvalid(format!(
            "config {} has no data item {data_item_config_id}",
            envelope.config_id
        ))
    })?;

    let source = ctx.source_client(&config);
    let destination = ctx.destination_client(&config);

    let engine = MappingEngine::new(&source, &destination);
    let expanded = engine.expand(&item.mappings).await?;
    let table = TranslationTable::build(&item.mappings, &expanded);
    let data_elements = TranslationTable::source_data_elements(&item.mappings);

    // request overrides win over the mapping's own org-unit settings
    let level = overrides.org_unit_level.unwrap_or(item.org_unit_level);
    let parent = overrides
        .parent_org_unit
        .as_deref()
        .unwrap_or(&item.parent_org_unit);
    let org_unit_dimension = format!("LEVEL-{level};{parent}");

    let timeout = ctx.data_timeout(overrides.timeout_ms);
    let periods = [period_id.to_string()];

    let element_chunks: Vec<&[String]> = if overrides.paginate_by_data {
        let chunk_size = overrides.page_size.filter(|size| *size > 0).unwrap_or(50);
        data_elements.chunks(chunk_size).collect()
    } else {
        vec![data_elements.as_slice()]
    };

    let mut fetched = Vec::new();
    for chunk in element_chunks {
        let set = with_inline_retry(|| {
            source.analytics_data_values(chunk, &periods, &org_unit_dimension, timeout)
        })
        .await?;
        fetched.extend(set.data_values);
    }

    let total_fetched = fetched.len();
    let mut values = Vec::with_capacity(total_fetched);
    for mut value in fetched {
        if !value.is_numeric() {
            debug!(
                data_element = %value.data_element,
                value = %value.value,
                "dropping non-numeric value"
            );
            continue;
        }
        if !table.rewrite(&mut value) {
            debug!(
                data_element = %value.data_element,
                "dropping value with no destination mapping"
            );
            continue;
        }
        values.push(value);
    }

    let values = match &item.attribute_combo {
        Some(selector) => attribute_fan_out(&destination, selector, values).await?,
        None => values,
    };

    if values.is_empty() {
        info!(
            config_id = %envelope.config_id,
            job_id = %envelope.job_id,
            data_item_config_id,
            period_id,
            total_fetched,
            "no uploadable values for this slice"
        );
        return Ok(());
    }

    let set = DataValueSet {
        data_values: values,
    };
    let scratch_path = ctx.scratch.write(&envelope.config_id, &set).await?;

    let (queue_kind, job_kind) = if is_delete {
        (
            QueueKind::DataDeletion,
            JobKind::DataDeletion {
                source: UploadSource::File {
                    scratch_path: scratch_path.clone(),
                },
                is_delete: true,
            },
        )
    } else {
        (
            QueueKind::DataUpload,
            JobKind::DataUpload {
                source: UploadSource::File {
                    scratch_path: scratch_path.clone(),
                },
                is_delete: false,
            },
        )
    };

    let upload = JobEnvelope::new(envelope.config_id.clone(), job_kind);
    ctx.publish_job(queue_kind, &upload).await?;

    info!(
        config_id = %envelope.config_id,
        job_id = %envelope.job_id,
        data_item_config_id,
        period_id,
        values = set.data_values.len(),
        scratch_path = %scratch_path,
        upload_job_id = %upload.job_id,
        "data slice staged for upload"
    );
    Ok(())
}

/// Upload (or delete) a value set at the destination. The payload comes
/// either inline or from a scratch file; both converge on the same
/// import call and the same cleanup.
pub(super) async fn upload(
    ctx: &HandlerContext,
    envelope: &JobEnvelope,
    source: &UploadSource,
    is_delete: bool,
) -> Result<(), HandlerError> {
    let config = ctx.config(&envelope.config_id)?;

    let (set, scratch_path) = match source {
        UploadSource::File { scratch_path } => {
            let set = ctx.scratch.read(scratch_path).await?;
            (set, Some(scratch_path.as_str()))
        }
        UploadSource::Inline { payload } => (payload.clone(), None),
    };

    if set.data_values.is_empty() {
        return Err(HandlerError::PayloadInvalid(
            "upload payload has no data values".to_string(),
        ));
    }

    let strategy = if is_delete {
        ImportStrategy::Delete
    } else {
        ImportStrategy::CreateAndUpdate
    };

    let destination = ctx.destination_client(&config);
    let result = with_inline_retry(|| destination.post_data_values(&set, strategy)).await;

    match result {
        Ok(summary) => {
            let counts = summary.counts().unwrap_or_default();
            info!(
                config_id = %envelope.config_id,
                job_id = %envelope.job_id,
                strategy = strategy.as_str(),
                imported = counts.imported,
                updated = counts.updated,
                ignored = counts.ignored,
                deleted = counts.deleted,
                "data values imported"
            );
            ctx.metrics
                .values_migrated(counts.imported + counts.updated + counts.deleted);
            finalize_scratch(ctx, scratch_path).await?;
            Ok(())
        }
        // partial success: clean the scratch file so it is not orphaned,
        // then surface the conflict for the retry machinery to record
        Err(UpstreamError::Conflict {
            imported,
            ignored,
            url,
        }) => {
            warn!(
                config_id = %envelope.config_id,
                job_id = %envelope.job_id,
                imported,
                ignored,
                "destination reported import conflict"
            );
            ctx.metrics.upload_conflicted();
            finalize_scratch(ctx, scratch_path).await?;
            Err(HandlerError::Upstream(UpstreamError::Conflict {
                imported,
                ignored,
                url,
            }))
        }
        Err(err) => Err(err.into()),
    }
}

/// Shared cleanup for both payload variants.
async fn finalize_scratch(
    ctx: &HandlerContext,
    scratch_path: Option<&str>,
) -> Result<(), HandlerError> {
    if let Some(path) = scratch_path {
        ctx.scratch.remove(path).await?;
    }
    Ok(())
}
