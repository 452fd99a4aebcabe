//! Response shapes of the operator API
//!
//! Every success payload carries `success: true`; failures render
//! through [`super::error::ApiError`] as `{success: false, error,
//! details}`.

use serde::Serialize;

use crate::queues::{FamilyStats, HealthSummary, QueueStats, QueueStatus};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanAcceptedResponse {
    pub success: bool,
    pub message: String,
    pub config_id: String,
    pub total_items: usize,
    pub status: &'static str,
}

impl PlanAcceptedResponse {
    pub fn processing(message: impl Into<String>, config_id: impl Into<String>, total_items: usize) -> Self {
        Self {
            success: true,
            message: message.into(),
            config_id: config_id.into(),
            total_items,
            status: "processing",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationAcceptedResponse {
    pub success: bool,
    pub config_id: String,
    pub session_id: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueFamilyCreatedResponse {
    pub success: bool,
    pub config_id: String,
    pub queues: Vec<String>,
    pub failed_queue: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueFamilyDeletedResponse {
    pub success: bool,
    pub config_id: String,
    pub deleted_queues: usize,
    pub messages_purged: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsResponse {
    pub success: bool,
    pub config_id: String,
    pub per_queue: Vec<QueueStats>,
    pub dlq: u64,
    pub status: QueueStatus,
    pub health: HealthSummary,
}

impl QueueStatsResponse {
    pub fn from_stats(config_id: impl Into<String>, stats: FamilyStats) -> Self {
        Self {
            success: true,
            config_id: config_id.into(),
            per_queue: stats.per_queue,
            dlq: stats.dlq_ready,
            status: stats.status,
            health: stats.health,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub success: bool,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigListResponse {
    pub success: bool,
    pub configs: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub success: bool,
    pub config_id: String,
    pub retried: usize,
}
