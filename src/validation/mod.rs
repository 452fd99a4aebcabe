//! Source↔destination validation
//!
//! A validation run fetches source and destination values in parallel,
//! joins them on normalized keys and classifies the differences. Runs
//! execute off-thread; the requester gets a session ID immediately and
//! observes progress through the session store.

pub mod diff;
pub mod session;

pub use diff::{key_map, Discrepancy, DiscrepancyKind, Severity, ValueKey};
pub use session::{SessionStatus, ValidationProgress, ValidationSession, ValidationSessionStore};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigStore, DataItemConfig, MigrationConfig, UpstreamSettings};
use crate::dhis::models::DataValue;
use crate::dhis::{DhisClient, UpstreamError};
use crate::mapping::{MappingEngine, TranslationTable};
use crate::observability::Metrics;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("configuration not found: {0}")]
    ConfigNotFound(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    #[serde(default)]
    pub data_item_config_ids: Vec<String>,
    #[serde(default)]
    pub periods: Vec<String>,
    #[serde(default)]
    pub org_units: Vec<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub skip_destination: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone)]
pub struct ValidationEngine {
    store: Arc<ConfigStore>,
    sessions: Arc<ValidationSessionStore>,
    http: reqwest::Client,
    upstream: UpstreamSettings,
    metrics: Arc<Metrics>,
}

impl ValidationEngine {
    pub fn new(
        store: Arc<ConfigStore>,
        sessions: Arc<ValidationSessionStore>,
        http: reqwest::Client,
        upstream: UpstreamSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            sessions,
            http,
            upstream,
            metrics,
        }
    }

    /// Start a run and return its session ID. The work itself proceeds
    /// on a background task.
    pub async fn start(
        &self,
        config_id: &str,
        request: ValidationRequest,
    ) -> Result<String, ValidationError> {
        let config = self
            .store
            .get(config_id)
            .ok_or_else(|| ValidationError::ConfigNotFound(config_id.to_string()))?;

        let session_id = self.sessions.create(config_id).await;
        if let Ok(params) = serde_json::to_value(&request) {
            self.sessions.remember_params(config_id, params).await;
        }

        let engine = self.clone();
        let task_session = session_id.clone();
        tokio::spawn(async move {
            engine.run_session(config, request, task_session).await;
        });

        Ok(session_id)
    }

    async fn run_session(
        &self,
        config: Arc<MigrationConfig>,
        request: ValidationRequest,
        session_id: String,
    ) {
        let items: Vec<&DataItemConfig> = if request.data_item_config_ids.is_empty() {
            config.data_items.iter().collect()
        } else {
            let wanted: HashSet<&str> = request
                .data_item_config_ids
                .iter()
                .map(String::as_str)
                .collect();
            config
                .data_items
                .iter()
                .filter(|item| wanted.contains(item.id.as_str()))
                .collect()
        };

        if request.periods.is_empty() || items.is_empty() {
            info!(
                config_id = %config.config_id,
                session_id = %session_id,
                "validation has nothing to compare"
            );
            self.sessions.complete(&session_id, Vec::new()).await;
            return;
        }

        let source = DhisClient::new(
            self.http.clone(),
            &config.source,
            self.upstream.source_timeout(),
        );
        let destination = DhisClient::new(
            self.http.clone(),
            &config.destination,
            self.upstream.dest_timeout(),
        );
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.upstream.data_timeout());

        let mut source_values: Vec<DataValue> = Vec::new();
        let mut destination_values: Vec<DataValue> = Vec::new();

        for item in items {
            let engine = MappingEngine::new(&source, &destination);
            let expanded = match engine.expand(&item.mappings).await {
                Ok(expanded) => expanded,
                Err(err) => {
                    self.sessions
                        .fail(&session_id, format!("mapping expansion failed: {err}"))
                        .await;
                    return;
                }
            };
            let table = TranslationTable::build(&item.mappings, &expanded);

            let source_elements = TranslationTable::source_data_elements(&item.mappings);
            let destination_elements = destination_data_elements(item);
            if source_elements.is_empty() {
                continue;
            }

            let org_unit_dimension = if request.org_units.is_empty() {
                format!("LEVEL-{};{}", item.org_unit_level, item.parent_org_unit)
            } else {
                request.org_units.join(";")
            };

            let source_fetch = fetch_values(
                &source,
                &source_elements,
                &request.periods,
                &org_unit_dimension,
                request.page_size,
                timeout,
            );
            let destination_fetch = async {
                if request.skip_destination {
                    Ok(Vec::new())
                } else {
                    fetch_values(
                        &destination,
                        &destination_elements,
                        &request.periods,
                        &org_unit_dimension,
                        request.page_size,
                        timeout,
                    )
                    .await
                }
            };

            let (source_result, destination_result) =
                tokio::join!(source_fetch, destination_fetch);

            let mut fetched_source = match source_result {
                Ok(values) => values,
                Err(err) => {
                    self.sessions
                        .fail(&session_id, format!("source fetch failed: {err}"))
                        .await;
                    return;
                }
            };

            // a destination fetch failure must not masquerade as
            // "everything missing in destination" without a trace
            match destination_result {
                Ok(values) => destination_values.extend(values),
                Err(err) => {
                    warn!(
                        config_id = %config.config_id,
                        session_id = %session_id,
                        data_item = %item.id,
                        error = %err,
                        "destination fetch failed during validation"
                    );
                    self.sessions
                        .warn(
                            &session_id,
                            format!("destination fetch failed for {}: {err}", item.id),
                        )
                        .await;
                }
            }

            // compare in destination identifier space
            for value in &mut fetched_source {
                table.rewrite(value);
            }
            source_values.append(&mut fetched_source);

            info!(
                config_id = %config.config_id,
                session_id = %session_id,
                data_item = %item.id,
                source_values = source_values.len(),
                destination_values = destination_values.len(),
                "validation slice fetched"
            );
        }

        let total = (source_values.len() + destination_values.len()) as u64;
        self.sessions.set_total(&session_id, total).await;

        let source_map = key_map(&source_values);
        let destination_map = key_map(&destination_values);
        let discrepancies = diff::diff(&source_map, &destination_map);

        self.sessions.advance(&session_id, total, discrepancies.len() as u64).await;
        self.metrics.discrepancies_found(discrepancies.len() as u64);

        info!(
            config_id = %config.config_id,
            session_id = %session_id,
            records = total,
            discrepancies = discrepancies.len(),
            "validation completed"
        );
        self.sessions.complete(&session_id, discrepancies).await;
    }
}

fn destination_data_elements(item: &DataItemConfig) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for mapping in &item.mappings {
        let (data_element, _) = crate::mapping::split_compound(&mapping.destination_id);
        if seen.insert(data_element.to_string()) {
            out.push(data_element.to_string());
        }
    }
    out
}

/// Fetch a value set, optionally split into data-element chunks of
/// `page_size`.
async fn fetch_values(
    client: &DhisClient,
    data_elements: &[String],
    periods: &[String],
    org_unit_dimension: &str,
    page_size: Option<usize>,
    timeout: Duration,
) -> Result<Vec<DataValue>, UpstreamError> {
    if data_elements.is_empty() {
        return Ok(Vec::new());
    }

    let chunks: Vec<&[String]> = match page_size {
        Some(size) if size > 0 => data_elements.chunks(size).collect(),
        _ => vec![data_elements],
    };

    let mut values = Vec::new();
    for chunk in chunks {
        let set = client
            .analytics_data_values(chunk, periods, org_unit_dimension, timeout)
            .await?;
        values.extend(set.data_values);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdMapping;
    use crate::planner::periods::PeriodType;

    fn item(mappings: Vec<IdMapping>) -> DataItemConfig {
        DataItemConfig {
            id: "item-1".to_string(),
            period_type: PeriodType::Monthly,
            parent_org_unit: "OU_ROOT".to_string(),
            org_unit_level: 3,
            mappings,
            attribute_combo: None,
        }
    }

    #[test]
    fn destination_elements_deduplicate() {
        let item = item(vec![
            IdMapping {
                source_id: "DE_A.C1".to_string(),
                destination_id: "DE_B.D1".to_string(),
            },
            IdMapping {
                source_id: "DE_A.C2".to_string(),
                destination_id: "DE_B.D2".to_string(),
            },
        ]);
        assert_eq!(destination_data_elements(&item), vec!["DE_B".to_string()]);
    }

    #[test]
    fn request_defaults_deserialize() {
        let request: ValidationRequest = serde_json::from_str("{}").unwrap();
        assert!(request.periods.is_empty());
        assert!(!request.skip_destination);
        assert!(request.page_size.is_none());
    }
}
