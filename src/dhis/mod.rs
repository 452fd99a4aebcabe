//! Client for DHIS2-compatible HTTP APIs

pub mod client;
pub mod models;

pub use client::DhisClient;
pub use models::{DataValue, DataValueSet, ImportCount, ImportStrategy};

use std::time::Duration;
use thiserror::Error;

/// Upstream fault taxonomy
///
/// The variant decides the retry disposition: `Transient` is retryable,
/// `Conflict` is a partial success, everything else dead-letters.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("transient upstream fault on {url}: {reason}")]
    Transient {
        url: String,
        reason: String,
        /// HTTP status when the fault came from a response (408/5xx)
        status: Option<u16>,
        /// transport-level code, e.g. "timeout" or "connect"
        code: Option<String>,
    },

    #[error("upstream conflict on {url}")]
    Conflict {
        url: String,
        imported: u64,
        ignored: u64,
    },

    #[error("upstream rejected request on {url}: HTTP {status}")]
    Fatal {
        url: String,
        status: u16,
        body: String,
    },

    #[error("cannot decode upstream response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Transient { status, .. } => *status,
            UpstreamError::Conflict { .. } => Some(409),
            UpstreamError::Fatal { status, .. } => Some(*status),
            UpstreamError::Decode { .. } => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            UpstreamError::Transient { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            UpstreamError::Transient { url, .. }
            | UpstreamError::Conflict { url, .. }
            | UpstreamError::Fatal { url, .. }
            | UpstreamError::Decode { url, .. } => url,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, UpstreamError::Transient { .. })
    }
}

/// One immediate in-handler retry with a short delay for retryable
/// transport faults, before giving the failure to the broker machinery.
pub async fn with_inline_retry<T, F, Fut>(mut attempt: F) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, UpstreamError>>,
{
    match attempt().await {
        Ok(value) => Ok(value),
        Err(err) if err.is_retryable() => {
            tracing::warn!(error = %err, "retryable upstream fault, retrying once inline");
            tokio::time::sleep(INLINE_RETRY_DELAY).await;
            attempt().await
        }
        Err(err) => Err(err),
    }
}

const INLINE_RETRY_DELAY: Duration = Duration::from_secs(2);
