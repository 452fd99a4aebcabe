//! Expansion of operator requests into queued jobs

pub mod periods;

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::broker::{BrokerError, MessageHeaders, MessageQueue};
use crate::config::ConfigStore;
use crate::jobs::{JobEnvelope, JobKind, MetadataSource, RuntimeOverrides};
use crate::observability::Metrics;
use crate::queues::{QueueKind, QueueManager, QueueManagerError};
use periods::PeriodError;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("configuration not found: {0}")]
    ConfigNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Period(#[from] PeriodError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("cannot encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<QueueManagerError> for PlannerError {
    fn from(err: QueueManagerError) -> Self {
        match err {
            QueueManagerError::ConfigNotFound(id) => PlannerError::ConfigNotFound(id),
            QueueManagerError::Broker(err) => PlannerError::Broker(err),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDownloadRequest {
    pub metadata_source: MetadataSource,
    #[serde(default)]
    pub selected_dashboards: Vec<String>,
    #[serde(default)]
    pub selected_visualizations: Vec<String>,
    #[serde(default)]
    pub selected_maps: Vec<String>,
}

/// The request's runtime configuration; overrides beat the data-item
/// config where both name the same thing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default)]
    pub periods: Vec<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub paginate_by_data: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub org_unit_level_id: Option<u32>,
    #[serde(default)]
    pub parent_org_unit_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    #[serde(default)]
    pub data_items_config_ids: Vec<String>,
    #[serde(default)]
    pub runtime_config: RuntimeConfig,
    #[serde(default)]
    pub is_delete: bool,
}

/// What a plan produced, echoed to the requester
#[derive(Debug, Clone)]
pub struct PlanSummary {
    pub config_id: String,
    pub total_items: usize,
    pub job_ids: Vec<String>,
}

pub struct Planner {
    store: Arc<ConfigStore>,
    broker: Arc<dyn MessageQueue>,
    manager: QueueManager,
    metrics: Arc<Metrics>,
}

impl Planner {
    pub fn new(
        store: Arc<ConfigStore>,
        broker: Arc<dyn MessageQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            manager: QueueManager::new(broker.clone(), store.clone()),
            store,
            broker,
            metrics,
        }
    }

    /// A single metadata-download job; fan-out happens at handler time.
    pub async fn plan_metadata_download(
        &self,
        config_id: &str,
        request: MetadataDownloadRequest,
    ) -> Result<PlanSummary, PlannerError> {
        // every published job targets an existing queue family
        self.manager.create_family(config_id).await?;

        let total_items = request.selected_dashboards.len()
            + request.selected_visualizations.len()
            + request.selected_maps.len();

        let envelope = JobEnvelope::new(
            config_id,
            JobKind::MetadataDownload {
                metadata_source: request.metadata_source,
                selected_dashboards: request.selected_dashboards,
                selected_visualizations: request.selected_visualizations,
                selected_maps: request.selected_maps,
            },
        );
        self.publish(QueueKind::MetadataDownload, &envelope).await?;

        info!(
            config_id,
            job_id = %envelope.job_id,
            total_items,
            "metadata download planned"
        );
        Ok(PlanSummary {
            config_id: config_id.to_string(),
            total_items,
            job_ids: vec![envelope.job_id],
        })
    }

    /// One download job per `(dataItemConfig, period)` pair, in request
    /// order with periods ascending. Deletion threads `isDelete` through
    /// the same shape.
    pub async fn plan_data(
        &self,
        config_id: &str,
        request: DataRequest,
        is_delete: bool,
    ) -> Result<PlanSummary, PlannerError> {
        self.manager.create_family(config_id).await?;
        let config = self
            .store
            .get(config_id)
            .ok_or_else(|| PlannerError::ConfigNotFound(config_id.to_string()))?;

        if request.data_items_config_ids.is_empty() {
            return Err(PlannerError::InvalidRequest(
                "dataItemsConfigIds must not be empty".to_string(),
            ));
        }
        if request.runtime_config.periods.is_empty() {
            return Err(PlannerError::InvalidRequest(
                "runtimeConfig.periods must not be empty".to_string(),
            ));
        }

        let overrides = RuntimeOverrides {
            org_unit_level: request.runtime_config.org_unit_level_id,
            parent_org_unit: request.runtime_config.parent_org_unit_id.clone(),
            timeout_ms: request.runtime_config.timeout,
            page_size: request.runtime_config.page_size,
            paginate_by_data: request.runtime_config.paginate_by_data,
        };

        let mut job_ids = Vec::new();
        for item_id in &request.data_items_config_ids {
            let item = config.data_item(item_id).ok_or_else(|| {
                PlannerError::InvalidRequest(format!(
                    "config {config_id} has no data item {item_id}"
                ))
            })?;

            let period_ids =
                periods::expand(item.period_type, &request.runtime_config.periods)?;

            for period_id in period_ids {
                let envelope = JobEnvelope::new(
                    config_id,
                    JobKind::DataDownload {
                        data_item_config_id: item_id.clone(),
                        period_id,
                        overrides: overrides.clone(),
                        is_delete,
                    },
                );
                self.publish(QueueKind::DataDownload, &envelope).await?;
                job_ids.push(envelope.job_id);
            }
        }

        info!(
            config_id,
            jobs = job_ids.len(),
            is_delete,
            "data plan published"
        );
        Ok(PlanSummary {
            config_id: config_id.to_string(),
            total_items: job_ids.len(),
            job_ids,
        })
    }

    async fn publish(
        &self,
        kind: QueueKind,
        envelope: &JobEnvelope,
    ) -> Result<(), PlannerError> {
        let queue = kind.queue_name(&envelope.config_id);
        let mut headers = MessageHeaders::new();
        headers.set_int("x-retry-count", 0);
        self.broker
            .publish(&queue, envelope.to_bytes()?, headers)
            .await?;
        self.metrics.job_planned();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::{
        ConfigStore, DataItemConfig, IdMapping, InstanceConfig, MigrationConfig,
    };
    use crate::jobs::JobEnvelope;
    use periods::PeriodType;

    fn store_with(config_id: &str, period_type: PeriodType) -> Arc<ConfigStore> {
        Arc::new(ConfigStore::from_configs(vec![MigrationConfig {
            config_id: config_id.to_string(),
            source: InstanceConfig {
                base_url: "https://source.example.org".to_string(),
                username: "sync".to_string(),
                password: "secret".to_string(),
                route_id: None,
            },
            destination: InstanceConfig {
                base_url: "https://dest.example.org".to_string(),
                username: "sync".to_string(),
                password: "secret".to_string(),
                route_id: None,
            },
            data_items: vec![DataItemConfig {
                id: "item-1".to_string(),
                period_type,
                parent_org_unit: "OU_ROOT".to_string(),
                org_unit_level: 3,
                mappings: vec![IdMapping {
                    source_id: "DE_A".to_string(),
                    destination_id: "DE_B".to_string(),
                }],
                attribute_combo: None,
            }],
            portal_metadata: None,
        }]))
    }

    fn planner(store: Arc<ConfigStore>, broker: Arc<MemoryBroker>) -> Planner {
        Planner::new(store, broker, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn one_download_job_per_item_period_pair() {
        let broker = Arc::new(MemoryBroker::new());
        let planner = planner(store_with("cfg1", PeriodType::Monthly), broker.clone());

        let request = DataRequest {
            data_items_config_ids: vec!["item-1".to_string()],
            runtime_config: RuntimeConfig {
                periods: vec!["202401".to_string()],
                ..Default::default()
            },
            is_delete: false,
        };
        let summary = planner.plan_data("cfg1", request, false).await.unwrap();
        assert_eq!(summary.total_items, 1);
        assert_eq!(broker.ready_len("data.download.cfg1").await, 1);

        let headers = broker.peek_headers("data.download.cfg1", 0).await.unwrap();
        assert_eq!(headers.int("x-retry-count"), Some(0));
    }

    #[tokio::test]
    async fn period_expansion_drives_fan_out() {
        let broker = Arc::new(MemoryBroker::new());
        let planner = planner(store_with("cfg1", PeriodType::Monthly), broker.clone());

        let request = DataRequest {
            data_items_config_ids: vec!["item-1".to_string()],
            runtime_config: RuntimeConfig {
                periods: vec!["2024Q1".to_string()],
                ..Default::default()
            },
            is_delete: false,
        };
        let summary = planner.plan_data("cfg1", request, false).await.unwrap();
        assert_eq!(summary.total_items, 3);
        assert_eq!(broker.ready_len("data.download.cfg1").await, 3);
    }

    #[tokio::test]
    async fn deletion_threads_the_flag() {
        let broker = Arc::new(MemoryBroker::new());
        let planner = planner(store_with("cfg1", PeriodType::Monthly), broker.clone());

        let request = DataRequest {
            data_items_config_ids: vec!["item-1".to_string()],
            runtime_config: RuntimeConfig {
                periods: vec!["202401".to_string()],
                ..Default::default()
            },
            is_delete: true,
        };
        planner.plan_data("cfg1", request, true).await.unwrap();

        let delivery = broker.fetch("data.download.cfg1").await.unwrap().unwrap();
        let envelope = JobEnvelope::from_bytes(&delivery.body).unwrap();
        match envelope.kind {
            crate::jobs::JobKind::DataDownload { is_delete, .. } => assert!(is_delete),
            other => panic!("unexpected kind: {other:?}"),
        }
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_config_is_rejected() {
        let broker = Arc::new(MemoryBroker::new());
        let planner = planner(store_with("cfg1", PeriodType::Monthly), broker);

        let result = planner
            .plan_metadata_download(
                "unknown",
                MetadataDownloadRequest {
                    metadata_source: MetadataSource::Source,
                    selected_dashboards: Vec::new(),
                    selected_visualizations: Vec::new(),
                    selected_maps: Vec::new(),
                },
            )
            .await;
        assert!(matches!(result, Err(PlannerError::ConfigNotFound(_))));
    }

    #[tokio::test]
    async fn empty_metadata_selection_still_plans_one_job() {
        let broker = Arc::new(MemoryBroker::new());
        let planner = planner(store_with("cfg1", PeriodType::Monthly), broker.clone());

        let summary = planner
            .plan_metadata_download(
                "cfg1",
                MetadataDownloadRequest {
                    metadata_source: MetadataSource::Source,
                    selected_dashboards: Vec::new(),
                    selected_visualizations: Vec::new(),
                    selected_maps: Vec::new(),
                },
            )
            .await
            .unwrap();

        assert_eq!(summary.total_items, 0);
        assert_eq!(broker.ready_len("metadata.download.cfg1").await, 1);
    }

    #[tokio::test]
    async fn planning_is_deterministic() {
        let broker = Arc::new(MemoryBroker::new());
        let planner = planner(store_with("cfg1", PeriodType::Quarterly), broker.clone());

        let request = || DataRequest {
            data_items_config_ids: vec!["item-1".to_string()],
            runtime_config: RuntimeConfig {
                periods: vec!["2024S1".to_string()],
                ..Default::default()
            },
            is_delete: false,
        };

        let first = planner.plan_data("cfg1", request(), false).await.unwrap();
        let second = planner.plan_data("cfg1", request(), false).await.unwrap();
        assert_eq!(first.total_items, second.total_items);

        // same period set in the same order both times
        let mut periods = Vec::new();
        while let Some(delivery) = broker.fetch("data.download.cfg1").await.unwrap() {
            let envelope = JobEnvelope::from_bytes(&delivery.body).unwrap();
            if let crate::jobs::JobKind::DataDownload { period_id, .. } = envelope.kind {
                periods.push(period_id);
            }
            delivery.ack().await.unwrap();
        }
        assert_eq!(periods, vec!["2024Q1", "2024Q2", "2024Q1", "2024Q2"]);
    }
}
