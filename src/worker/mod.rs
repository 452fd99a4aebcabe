//! Long-lived queue consumers
//!
//! The runtime enumerates every configuration, declares its queue family
//! (idempotent) and binds one consumer per `(configId, queueKind)` pair.
//! Download and upload kinds consume on separate channels so head-of-line
//! blocking stays within a kind. Failed handlers are retried with
//! immediate requeues up to a limit, then dead-lettered with the failure
//! recorded in message headers.

mod activity;
mod retry;

pub use activity::{ActivityTable, QueueActivity};
pub use retry::{RetryTable, IMMEDIATE_REQUEUE_LIMIT};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_lite::StreamExt;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::{BrokerError, ChannelRole, Delivery, MessageHeaders};
use crate::handlers::{self, Disposition, HandlerContext, HandlerError};
use crate::jobs::JobEnvelope;
use crate::queues::{failed_queue, QueueKind, QueueManager};

pub struct WorkerRuntime {
    ctx: HandlerContext,
    retries: RetryTable,
    activity: Arc<ActivityTable>,
    reconnect_delay: Duration,
}

impl WorkerRuntime {
    pub fn new(
        ctx: HandlerContext,
        activity: Arc<ActivityTable>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            ctx,
            retries: RetryTable::new(),
            activity,
            reconnect_delay,
        }
    }

    /// Declare all families and spawn the consumer tasks. Returns once
    /// everything is bound; consumers run until shutdown flips.
    pub async fn start(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        let manager = QueueManager::new(self.ctx.broker.clone(), self.ctx.store.clone());

        for config_id in self.ctx.store.ids() {
            if let Err(err) = manager.create_family(&config_id).await {
                error!(config_id, error = %err, "cannot declare queue family");
                continue;
            }
            for kind in QueueKind::ALL {
                let runtime = self.clone();
                let consumer_config = config_id.clone();
                let consumer_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    runtime
                        .consume_loop(consumer_config, kind, consumer_shutdown)
                        .await;
                });
            }
            info!(config_id, "worker consumers bound");
        }
        Ok(())
    }

    async fn consume_loop(
        self: Arc<Self>,
        config_id: String,
        kind: QueueKind,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let queue = kind.queue_name(&config_id);
        let role = match kind {
            QueueKind::MetadataUpload | QueueKind::DataUpload | QueueKind::DataDeletion => {
                ChannelRole::Upload
            }
            QueueKind::MetadataDownload | QueueKind::DataDownload => ChannelRole::Download,
        };

        loop {
            if *shutdown.borrow() {
                return;
            }

            let mut stream = match self.ctx.broker.consume(&queue, role).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(queue, error = %err, "cannot bind consumer, retrying");
                    tokio::time::sleep(self.reconnect_delay).await;
                    continue;
                }
            };

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    next = stream.next() => match next {
                        Some(Ok(delivery)) => self.process(kind, delivery).await,
                        Some(Err(err)) => {
                            warn!(queue, error = %err, "consumer faulted, rebinding");
                            break;
                        }
                        None => {
                            warn!(queue, "consumer stream ended, rebinding");
                            break;
                        }
                    }
                }
            }

            // restart with a fixed delay; declarations are idempotent
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn process(&self, kind: QueueKind, delivery: Delivery) {
        let queue = delivery.queue.clone();
        self.activity.started(&queue);

        let envelope = match JobEnvelope::from_bytes(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(queue, error = %err, "undecodable message, dead-lettering");
                let fault = HandlerError::PayloadInvalid(format!("undecodable job body: {err}"));
                self.dead_letter(kind, delivery, None, &fault).await;
                return;
            }
        };

        // poison-message hygiene: a kind that does not belong on this
        // queue is discarded, not retried
        if envelope.kind.label() != kind.label() {
            warn!(
                queue,
                job_id = %envelope.job_id,
                job_kind = envelope.kind.label(),
                "job kind does not match queue, discarding"
            );
            self.activity.finished(&queue);
            if let Err(err) = delivery.ack().await {
                warn!(queue, error = %err, "cannot ack discarded message");
            }
            return;
        }

        match handlers::handle(&self.ctx, kind, &envelope).await {
            Ok(()) => {
                self.retries.clear(&envelope.job_id);
                self.ctx.metrics.job_completed();
                self.activity.finished(&queue);
                if let Err(err) = delivery.ack().await {
                    warn!(queue, job_id = %envelope.job_id, error = %err, "ack failed");
                }
            }
            Err(fault) => {
                self.handle_failure(kind, delivery, envelope, fault).await;
            }
        }
    }

    async fn handle_failure(
        &self,
        kind: QueueKind,
        delivery: Delivery,
        envelope: JobEnvelope,
        fault: HandlerError,
    ) {
        let queue = delivery.queue.clone();
        match fault.disposition() {
            Disposition::CompleteWithWarning => {
                warn!(
                    queue,
                    job_id = %envelope.job_id,
                    error = %fault,
                    "job completed with warning"
                );
                self.retries.clear(&envelope.job_id);
                self.ctx.metrics.job_completed();
                self.activity.finished(&queue);
                if let Err(err) = delivery.ack().await {
                    warn!(queue, error = %err, "ack failed");
                }
            }
            Disposition::Retry => {
                let header_count = delivery
                    .headers
                    .int("x-retry-count")
                    .unwrap_or(0)
                    .max(0) as u32;
                let prior = self.retries.attempts(&envelope.job_id).max(header_count);

                if within_retry_budget(prior) {
                    let attempt = self.retries.record_failure(&envelope.job_id);
                    warn!(
                        queue,
                        job_id = %envelope.job_id,
                        attempt,
                        error = %fault,
                        "transient failure, requeueing"
                    );
                    self.ctx.metrics.job_retried();
                    self.activity.requeued(&queue);
                    if let Err(err) = delivery.nack(true).await {
                        warn!(queue, error = %err, "requeue nack failed");
                    }
                } else {
                    self.dead_letter(kind, delivery, Some(&envelope), &fault).await;
                }
            }
            Disposition::DeadLetter => {
                self.dead_letter(kind, delivery, Some(&envelope), &fault).await;
            }
        }
    }

    /// Route a message to the family DLQ with the failure recorded in
    /// its headers, then settle the original.
    ///
    /// AMQP cannot attach headers on a plain reject, so the copy is
    /// published explicitly and the original acked; the queues' own
    /// dead-letter arguments remain as a backstop for broker-initiated
    /// rejections.
    async fn dead_letter(
        &self,
        kind: QueueKind,
        delivery: Delivery,
        envelope: Option<&JobEnvelope>,
        fault: &HandlerError,
    ) {
        let queue = delivery.queue.clone();
        let config_id = envelope
            .map(|envelope| envelope.config_id.clone())
            .or_else(|| {
                QueueKind::parse_queue_name(&queue)
                    .map(|(_, config_id)| config_id.to_string())
            });

        let Some(config_id) = config_id else {
            error!(queue, "cannot determine config for dead-lettering, rejecting");
            self.activity.dead_lettered(&queue);
            if let Err(err) = delivery.nack(false).await {
                error!(queue, error = %err, "reject failed");
            }
            return;
        };

        let job_id = envelope.map(|envelope| envelope.job_id.as_str()).unwrap_or("");
        let attempts = self.retries.attempts(job_id).max(
            delivery.headers.int("x-retry-count").unwrap_or(0).max(0) as u32,
        );

        let mut headers = failure_headers(&delivery.headers, kind, fault, attempts, job_id);
        headers.set_text("x-original-queue", queue.clone());

        let dlq = failed_queue(&config_id);
        error!(
            queue,
            job_id,
            error = %fault,
            error_name = fault.name(),
            attempts,
            "dead-lettering message"
        );

        match self
            .ctx
            .broker
            .publish(&dlq, delivery.body.clone(), headers)
            .await
        {
            Ok(()) => {
                if let Err(err) = delivery.ack().await {
                    warn!(queue, error = %err, "ack after dead-letter failed");
                }
            }
            Err(err) => {
                // fall back to broker-side routing via the queue's
                // dead-letter arguments; headers are lost
                error!(queue, error = %err, "cannot publish to DLQ, rejecting instead");
                if let Err(err) = delivery.nack(false).await {
                    error!(queue, error = %err, "reject failed");
                }
            }
        }

        if !job_id.is_empty() {
            self.retries.clear(job_id);
        }
        self.ctx.metrics.job_dead_lettered();
        self.activity.dead_lettered(&queue);
    }
}

/// Requeue while prior attempts (local table, or the durable header when
/// larger) stay below the immediate-requeue limit. At the moment of DLQ
/// routing the counter therefore never exceeds the limit.
fn within_retry_budget(prior_attempts: u32) -> bool {
    prior_attempts < IMMEDIATE_REQUEUE_LIMIT
}

/// The header set recorded on every dead-lettered message.
fn failure_headers(
    original: &MessageHeaders,
    kind: QueueKind,
    fault: &HandlerError,
    attempts: u32,
    job_id: &str,
) -> MessageHeaders {
    let mut headers = original.clone();
    headers.set_int("x-retry-count", attempts as i64);
    headers.set_text("x-error-message", fault.to_string());
    headers.set_text("x-error-name", fault.name());
    headers.set_text("x-error-timestamp", Utc::now().to_rfc3339());
    headers.set_text("x-queue-type", kind.label());
    headers.set_text(
        "x-failure-reason",
        json!({
            "jobId": job_id,
            "queueType": kind.label(),
            "errorName": fault.name(),
            "errorMessage": fault.to_string(),
            "attempts": attempts,
        })
        .to_string(),
    );

    if let Some(upstream) = fault.upstream() {
        if let Some(status) = upstream.status() {
            headers.set_text("x-axios-status", status.to_string());
        }
        if let Some(code) = upstream.code() {
            headers.set_text("x-axios-code", code.to_string());
        }
        headers.set_text("x-axios-url", upstream.url().to_string());
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhis::UpstreamError;

    #[test]
    fn requeue_budget_is_two() {
        // two requeues, then the third failure dead-letters
        assert!(within_retry_budget(0));
        assert!(within_retry_budget(1));
        assert!(!within_retry_budget(2));
        assert!(!within_retry_budget(3));
    }

    #[test]
    fn counter_at_dlq_time_never_exceeds_the_limit() {
        let table = RetryTable::new();
        let mut requeues = 0;
        while within_retry_budget(table.attempts("job")) {
            table.record_failure("job");
            requeues += 1;
        }
        assert_eq!(requeues, 2);
        assert_eq!(table.attempts("job"), IMMEDIATE_REQUEUE_LIMIT);
    }

    #[test]
    fn failure_headers_carry_the_full_set() {
        let fault = HandlerError::Upstream(UpstreamError::Transient {
            url: "https://dest.example.org/api/dataValueSets.json".to_string(),
            reason: "HTTP 503".to_string(),
            status: Some(503),
            code: None,
        });

        let headers = failure_headers(
            &MessageHeaders::new(),
            QueueKind::DataUpload,
            &fault,
            3,
            "job-1",
        );

        assert_eq!(headers.int("x-retry-count"), Some(3));
        assert_eq!(headers.text("x-queue-type"), Some("dataUpload"));
        assert_eq!(headers.text("x-error-name"), Some("UpstreamTransient"));
        assert_eq!(headers.text("x-axios-status"), Some("503"));
        assert!(headers.text("x-error-timestamp").is_some());

        let reason: serde_json::Value =
            serde_json::from_str(headers.text("x-failure-reason").unwrap()).unwrap();
        assert_eq!(reason["jobId"], "job-1");
        assert_eq!(reason["attempts"], 3);
    }
}
