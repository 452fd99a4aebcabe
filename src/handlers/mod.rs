//! Job handlers for the five process kinds
//!
//! Handlers are plain async functions dispatched by queue kind. Every
//! handler is idempotent from the broker's point of view: a redelivered
//! message either redoes harmless reads or re-posts an import the
//! upstream deduplicates by identifier.

mod data;
mod metadata;
pub mod scratch;

pub use scratch::{ScratchError, ScratchStore};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::broker::{BrokerError, MessageHeaders, MessageQueue};
use crate::config::{ConfigStore, MigrationConfig, UpstreamSettings};
use crate::dhis::{DhisClient, UpstreamError};
use crate::jobs::{JobEnvelope, JobKind};
use crate::mapping::MappingError;
use crate::observability::Metrics;
use crate::queues::QueueKind;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("configuration not found: {0}")]
    ConfigNotFound(String),

    #[error("payload invalid: {0}")]
    PayloadInvalid(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Scratch(#[from] ScratchError),

    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// What the worker runtime does with a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Requeue until the immediate-requeue limit, then dead-letter
    Retry,
    /// Dead-letter on the first occurrence
    DeadLetter,
    /// Partial success: log, ack, no DLQ entry
    CompleteWithWarning,
}

impl HandlerError {
    pub fn disposition(&self) -> Disposition {
        match self {
            HandlerError::ConfigNotFound(_) => Disposition::DeadLetter,
            HandlerError::PayloadInvalid(_) => Disposition::DeadLetter,
            HandlerError::Upstream(UpstreamError::Conflict { .. }) => {
                Disposition::CompleteWithWarning
            }
            HandlerError::Upstream(err) if err.is_retryable() => Disposition::Retry,
            HandlerError::Upstream(_) => Disposition::DeadLetter,
            HandlerError::Broker(_) => Disposition::Retry,
            HandlerError::Scratch(err) if err.is_payload_defect() => Disposition::DeadLetter,
            HandlerError::Scratch(_) => Disposition::Retry,
            HandlerError::Mapping(err) if err.is_retryable() => Disposition::Retry,
            HandlerError::Mapping(_) => Disposition::DeadLetter,
        }
    }

    /// Short error-kind name for the `x-error-name` header.
    pub fn name(&self) -> &'static str {
        match self {
            HandlerError::ConfigNotFound(_) => "ConfigNotFound",
            HandlerError::PayloadInvalid(_) => "PayloadInvalid",
            HandlerError::Upstream(UpstreamError::Conflict { .. }) => "UpstreamConflict",
            HandlerError::Upstream(UpstreamError::Transient { .. }) => "UpstreamTransient",
            HandlerError::Upstream(UpstreamError::Fatal { .. }) => "UpstreamFatal",
            HandlerError::Upstream(UpstreamError::Decode { .. }) => "UpstreamDecode",
            HandlerError::Broker(_) => "BrokerUnavailable",
            HandlerError::Scratch(_) => "ScratchFile",
            HandlerError::Mapping(_) => "Mapping",
        }
    }

    /// Transport details for the failure headers, when the underlying
    /// fault is an HTTP error.
    pub fn upstream(&self) -> Option<&UpstreamError> {
        match self {
            HandlerError::Upstream(err) => Some(err),
            HandlerError::Mapping(MappingError::Upstream(err)) => Some(err),
            _ => None,
        }
    }
}

/// Shared dependencies of every handler invocation
#[derive(Clone)]
pub struct HandlerContext {
    pub store: Arc<ConfigStore>,
    pub broker: Arc<dyn MessageQueue>,
    pub http: reqwest::Client,
    pub scratch: Arc<ScratchStore>,
    pub upstream: UpstreamSettings,
    pub metrics: Arc<Metrics>,
}

impl HandlerContext {
    pub fn config(&self, config_id: &str) -> Result<Arc<MigrationConfig>, HandlerError> {
        self.store
            .get(config_id)
            .ok_or_else(|| HandlerError::ConfigNotFound(config_id.to_string()))
    }

    pub fn source_client(&self, config: &MigrationConfig) -> DhisClient {
        DhisClient::new(
            self.http.clone(),
            &config.source,
            self.upstream.source_timeout(),
        )
    }

    pub fn destination_client(&self, config: &MigrationConfig) -> DhisClient {
        DhisClient::new(
            self.http.clone(),
            &config.destination,
            self.upstream.dest_timeout(),
        )
    }

    /// Effective analytics timeout: request override, else the data
    /// fetch default.
    pub fn data_timeout(&self, override_ms: Option<u64>) -> Duration {
        override_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.upstream.data_timeout())
    }

    /// Publish a follow-up job produced by a handler. Uses the dedicated
    /// worker-publish channel, so consumer flow control cannot stall it.
    pub async fn publish_job(
        &self,
        kind: QueueKind,
        envelope: &JobEnvelope,
    ) -> Result<(), HandlerError> {
        let queue = kind.queue_name(&envelope.config_id);
        let body = envelope
            .to_bytes()
            .map_err(|err| HandlerError::PayloadInvalid(err.to_string()))?;
        let mut headers = MessageHeaders::new();
        headers.set_int("x-retry-count", 0);
        self.broker.publish(&queue, body, headers).await?;
        Ok(())
    }
}

/// Execute the handler for a job delivered on a queue of `kind`.
/// The caller has already checked that the envelope's kind matches.
pub async fn handle(
    ctx: &HandlerContext,
    kind: QueueKind,
    envelope: &JobEnvelope,
) -> Result<(), HandlerError> {
    match (&envelope.kind, kind) {
        (
            JobKind::MetadataDownload {
                metadata_source,
                selected_dashboards,
                selected_visualizations,
                selected_maps,
            },
            QueueKind::MetadataDownload,
        ) => {
            metadata::download(
                ctx,
                envelope,
                *metadata_source,
                selected_dashboards,
                selected_visualizations,
                selected_maps,
            )
            .await
        }
        (
            JobKind::MetadataUpload {
                payload,
                scratch_path,
            },
            QueueKind::MetadataUpload,
        ) => metadata::upload(ctx, envelope, payload.as_ref(), scratch_path.as_deref()).await,
        (
            JobKind::DataDownload {
                data_item_config_id,
                period_id,
                overrides,
                is_delete,
            },
            QueueKind::DataDownload,
        ) => {
            data::download(
                ctx,
                envelope,
                data_item_config_id,
                period_id,
                overrides,
                *is_delete,
            )
            .await
        }
        (JobKind::DataUpload { source, is_delete }, QueueKind::DataUpload) => {
            data::upload(ctx, envelope, source, *is_delete).await
        }
        (JobKind::DataDeletion { source, .. }, QueueKind::DataDeletion) => {
            data::upload(ctx, envelope, source, true).await
        }
        (job, queue) => Err(HandlerError::PayloadInvalid(format!(
            "job kind {} does not belong on a {} queue",
            job.label(),
            queue.label()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispositions_follow_the_taxonomy() {
        assert_eq!(
            HandlerError::PayloadInvalid("x".into()).disposition(),
            Disposition::DeadLetter
        );
        assert_eq!(
            HandlerError::ConfigNotFound("cfg".into()).disposition(),
            Disposition::DeadLetter
        );

        let transient = HandlerError::Upstream(UpstreamError::Transient {
            url: "https://x".into(),
            reason: "503".into(),
            status: Some(503),
            code: None,
        });
        assert_eq!(transient.disposition(), Disposition::Retry);

        let fatal = HandlerError::Upstream(UpstreamError::Fatal {
            url: "https://x".into(),
            status: 403,
            body: String::new(),
        });
        assert_eq!(fatal.disposition(), Disposition::DeadLetter);

        let conflict = HandlerError::Upstream(UpstreamError::Conflict {
            url: "https://x".into(),
            imported: 0,
            ignored: 1,
        });
        assert_eq!(conflict.disposition(), Disposition::CompleteWithWarning);
        assert_eq!(conflict.name(), "UpstreamConflict");
    }
}
