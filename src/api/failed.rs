//! Dead-letter queue inspection and replay
//!
//! AMQP offers no non-destructive peek, so listing pulls messages with
//! `basic_get`, reads them, and requeues every one afterwards. Replay
//! republishes to the originating queue with the retry counter reset and
//! acks the DLQ copy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ApiError;
use super::state::AppState;
use crate::broker::{Delivery, MessageQueue, QueueOptions};
use crate::jobs::JobEnvelope;
use crate::queues::{failed_queue, QueueKind};

/// Upper bound on how many DLQ messages one API call will pull.
const MAX_PEEK: usize = 1_000;

/// Default cap for operator-initiated replay; distinct from the worker's
/// immediate-requeue limit.
pub const DEFAULT_REPLAY_LIMIT: usize = 10;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedQueueQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub include_messages: Option<bool>,
    /// Filter by originating process type, e.g. `dataUpload`
    pub queue: Option<String>,
    /// Return only the per-queue counts
    pub only_queues: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedMessage {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_queue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_timestamp: Option<String>,
    pub retry_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

fn describe(delivery: &Delivery) -> FailedMessage {
    let envelope = JobEnvelope::from_bytes(&delivery.body).ok();
    let body: Option<Value> = serde_json::from_slice(&delivery.body).ok();

    FailedMessage {
        message_id: envelope
            .as_ref()
            .map(|envelope| envelope.job_id.clone())
            .unwrap_or_default(),
        queue_type: delivery.headers.text("x-queue-type").map(str::to_string),
        original_queue: delivery
            .headers
            .text("x-original-queue")
            .map(str::to_string),
        error_name: delivery.headers.text("x-error-name").map(str::to_string),
        error_message: delivery
            .headers
            .text("x-error-message")
            .map(str::to_string),
        error_timestamp: delivery
            .headers
            .text("x-error-timestamp")
            .map(str::to_string),
        retry_count: delivery.headers.int("x-retry-count").unwrap_or(0),
        message: body,
    }
}

async fn drain(
    state: &AppState,
    config_id: &str,
) -> Result<Vec<(Delivery, FailedMessage)>, ApiError> {
    let dlq = failed_queue(config_id);
    // declaring the DLQ is idempotent and keeps basic_get from failing
    // on a family that was never created
    state
        .broker
        .declare_queue(&dlq, QueueOptions::durable())
        .await?;

    let mut drained = Vec::new();
    while drained.len() < MAX_PEEK {
        match state.broker.fetch(&dlq).await? {
            Some(delivery) => {
                let described = describe(&delivery);
                drained.push((delivery, described));
            }
            None => break,
        }
    }
    Ok(drained)
}

fn ensure_config(state: &AppState, config_id: &str) -> Result<(), ApiError> {
    if state.store.get(config_id).is_none() {
        return Err(ApiError::NotFound(format!("configuration {config_id}")));
    }
    Ok(())
}

/// `GET /failed-queue/{configId}`
pub async fn list(
    state: &AppState,
    config_id: &str,
    query: FailedQueueQuery,
) -> Result<Value, ApiError> {
    ensure_config(state, config_id)?;

    let drained = drain(state, config_id).await?;
    let mut entries: Vec<FailedMessage> = Vec::with_capacity(drained.len());
    for (delivery, described) in drained {
        entries.push(described);
        delivery.nack(true).await?;
    }

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for entry in &entries {
        let key = entry
            .queue_type
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        *counts.entry(key).or_insert(0) += 1;
    }

    if query.only_queues.unwrap_or(false) {
        return Ok(serde_json::json!({
            "success": true,
            "configId": config_id,
            "queues": counts,
            "total": entries.len(),
        }));
    }

    let filtered: Vec<FailedMessage> = match &query.queue {
        Some(wanted) => entries
            .into_iter()
            .filter(|entry| entry.queue_type.as_deref() == Some(wanted.as_str()))
            .collect(),
        None => entries,
    };

    let total = filtered.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(50);
    let include_messages = query.include_messages.unwrap_or(false);

    let page: Vec<FailedMessage> = filtered
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|mut entry| {
            if !include_messages {
                entry.message = None;
            }
            entry
        })
        .collect();

    Ok(serde_json::json!({
        "success": true,
        "configId": config_id,
        "total": total,
        "offset": offset,
        "limit": limit,
        "queues": counts,
        "messages": page,
    }))
}

/// `DELETE /failed-queue/{configId}`
pub async fn purge(state: &AppState, config_id: &str) -> Result<u64, ApiError> {
    ensure_config(state, config_id)?;
    let dlq = failed_queue(config_id);
    state
        .broker
        .declare_queue(&dlq, QueueOptions::durable())
        .await?;
    Ok(state.broker.purge_queue(&dlq).await?)
}

/// Where a dead-lettered message should be replayed to.
fn replay_target(config_id: &str, entry: &FailedMessage) -> Option<String> {
    if let Some(queue) = &entry.original_queue {
        return Some(queue.clone());
    }
    entry
        .queue_type
        .as_deref()
        .and_then(QueueKind::from_label)
        .map(|kind| kind.queue_name(config_id))
}

async fn replay(
    state: &AppState,
    target: &str,
    delivery: Delivery,
) -> Result<(), ApiError> {
    let mut headers = delivery.headers.clone();
    // a replayed message starts its retry budget over
    headers.set_int("x-retry-count", 0);
    state
        .broker
        .publish(target, delivery.body.clone(), headers)
        .await?;
    delivery.ack().await?;
    Ok(())
}

/// Replay up to `max_retries` DLQ messages of one process type.
pub async fn retry_by_process_type(
    state: &AppState,
    config_id: &str,
    process_type: QueueKind,
    max_retries: usize,
) -> Result<usize, ApiError> {
    ensure_config(state, config_id)?;
    // replay targets must exist before publishing to them
    state.queue_manager().create_family(config_id).await?;

    let drained = drain(state, config_id).await?;
    let mut retried = 0usize;

    for (delivery, entry) in drained {
        let matches = entry.queue_type.as_deref() == Some(process_type.label());
        if retried < max_retries && matches {
            match replay_target(config_id, &entry) {
                Some(target) => {
                    replay(state, &target, delivery).await?;
                    retried += 1;
                    continue;
                }
                None => delivery.nack(true).await?,
            }
        } else {
            delivery.nack(true).await?;
        }
    }

    Ok(retried)
}

/// Replay one DLQ message by its id.
pub async fn retry_single(
    state: &AppState,
    config_id: &str,
    message_id: &str,
) -> Result<bool, ApiError> {
    ensure_config(state, config_id)?;
    state.queue_manager().create_family(config_id).await?;

    let drained = drain(state, config_id).await?;
    let mut found = false;

    for (delivery, entry) in drained {
        if !found && entry.message_id == message_id {
            match replay_target(config_id, &entry) {
                Some(target) => {
                    replay(state, &target, delivery).await?;
                    found = true;
                    continue;
                }
                None => delivery.nack(true).await?,
            }
        } else {
            delivery.nack(true).await?;
        }
    }

    Ok(found)
}
