//! Declaration, teardown and introspection of per-configuration queue
//! families

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::names::{failed_queue, QueueKind};
use crate::broker::{BrokerError, MessageQueue, QueueOptions};
use crate::config::ConfigStore;
use crate::worker::ActivityTable;

#[derive(Debug, Error)]
pub enum QueueManagerError {
    #[error("configuration not found: {0}")]
    ConfigNotFound(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Per-queue state derived from broker introspection and the worker's
/// in-flight accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Idle,
    Completed,
    Failed,
    Queued,
    Running,
}

impl QueueStatus {
    /// Aggregate by the operator-facing priority
    /// `RUNNING > QUEUED > FAILED > COMPLETED > IDLE`, which coincides
    /// with the derived ordering.
    pub fn aggregate(statuses: impl IntoIterator<Item = QueueStatus>) -> QueueStatus {
        statuses
            .into_iter()
            .max()
            .unwrap_or(QueueStatus::Idle)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue: String,
    pub process_type: String,
    pub ready: u64,
    pub unacked: u64,
    pub consumers: u64,
    pub completed: u64,
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub healthy: bool,
    pub total_queues: usize,
    pub active_queues: usize,
    pub failed_queues: usize,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyStats {
    pub per_queue: Vec<QueueStats>,
    pub dlq_ready: u64,
    pub status: QueueStatus,
    pub health: HealthSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyDeletion {
    pub deleted_queues: usize,
    pub messages_purged: u64,
}

pub struct QueueManager {
    broker: Arc<dyn MessageQueue>,
    store: Arc<ConfigStore>,
}

impl QueueManager {
    pub fn new(broker: Arc<dyn MessageQueue>, store: Arc<ConfigStore>) -> Self {
        Self { broker, store }
    }

    /// Declare the five work queues and the DLQ for a configuration.
    /// Idempotent; fails when the configuration is unknown.
    pub async fn create_family(&self, config_id: &str) -> Result<Vec<String>, QueueManagerError> {
        if self.store.get(config_id).is_none() {
            return Err(QueueManagerError::ConfigNotFound(config_id.to_string()));
        }

        let dlq = failed_queue(config_id);
        self.broker
            .declare_queue(&dlq, QueueOptions::durable())
            .await?;

        let mut names = Vec::with_capacity(QueueKind::ALL.len());
        for kind in QueueKind::ALL {
            let name = kind.queue_name(config_id);
            self.broker
                .declare_queue(&name, QueueOptions::durable_with_dlq(dlq.clone()))
                .await?;
            names.push(name);
        }

        info!(config_id, queues = names.len(), "queue family declared");
        Ok(names)
    }

    /// Delete the whole family. A no-op for queues that no longer exist.
    pub async fn delete_family(&self, config_id: &str) -> Result<FamilyDeletion, QueueManagerError> {
        let mut deleted_queues = 0usize;
        let mut messages_purged = 0u64;

        for kind in QueueKind::ALL {
            let name = kind.queue_name(config_id);
            messages_purged += self.broker.delete_queue(&name).await?;
            deleted_queues += 1;
        }
        messages_purged += self.broker.delete_queue(&failed_queue(config_id)).await?;
        deleted_queues += 1;

        info!(config_id, deleted_queues, messages_purged, "queue family deleted");
        Ok(FamilyDeletion {
            deleted_queues,
            messages_purged,
        })
    }

    /// Introspect the family. Missing queues are reported as issues
    /// rather than failing the call.
    pub async fn stats_for(
        &self,
        config_id: &str,
        activity: &ActivityTable,
    ) -> Result<FamilyStats, QueueManagerError> {
        if self.store.get(config_id).is_none() {
            return Err(QueueManagerError::ConfigNotFound(config_id.to_string()));
        }

        let mut per_queue = Vec::with_capacity(QueueKind::ALL.len());
        let mut issues = Vec::new();
        let mut active_queues = 0usize;

        for kind in QueueKind::ALL {
            let name = kind.queue_name(config_id);
            let depth = self.broker.queue_depth(&name).await?;
            let snapshot = activity.snapshot(&name);

            match depth {
                Some(depth) => {
                    if depth.consumers > 0 {
                        active_queues += 1;
                    }
                    let status = if snapshot.in_flight > 0 {
                        QueueStatus::Running
                    } else if depth.ready > 0 {
                        QueueStatus::Queued
                    } else if snapshot.completed > 0 {
                        QueueStatus::Completed
                    } else {
                        QueueStatus::Idle
                    };
                    per_queue.push(QueueStats {
                        queue: name,
                        process_type: kind.label().to_string(),
                        ready: depth.ready,
                        unacked: snapshot.in_flight,
                        consumers: depth.consumers,
                        completed: snapshot.completed,
                        status,
                    });
                }
                None => issues.push(format!("queue {name} is not declared")),
            }
        }

        let dlq_name = failed_queue(config_id);
        let dlq_ready = match self.broker.queue_depth(&dlq_name).await? {
            Some(depth) => depth.ready,
            None => {
                issues.push(format!("queue {dlq_name} is not declared"));
                0
            }
        };

        let mut statuses: Vec<QueueStatus> =
            per_queue.iter().map(|stats| stats.status).collect();
        if dlq_ready > 0 {
            statuses.push(QueueStatus::Failed);
            issues.push(format!("{dlq_name} holds {dlq_ready} dead-lettered messages"));
        }
        let status = QueueStatus::aggregate(statuses);

        let failed_queues = usize::from(dlq_ready > 0);
        let health = HealthSummary {
            healthy: issues.is_empty() && self.broker.connected(),
            total_queues: per_queue.len(),
            active_queues,
            failed_queues,
            issues,
        };

        Ok(FamilyStats {
            per_queue,
            dlq_ready,
            status,
            health,
        })
    }
}
