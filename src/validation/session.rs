//! Validation sessions with explicit lifecycle
//!
//! Sessions are created when a run starts, mutated only by the owning
//! task through this store, and expired after a TTL once finished. The
//! store also remembers the last validation parameters per `configId`
//! so operators can re-run without re-entering them.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::diff::Discrepancy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationProgress {
    pub records_processed: u64,
    pub total_records: u64,
    pub discrepancies_found: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSession {
    pub session_id: String,
    pub config_id: String,
    pub status: SessionStatus,
    pub progress: ValidationProgress,
    pub warnings: Vec<String>,
    pub discrepancies: Vec<Discrepancy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct ValidationSessionStore {
    ttl: Duration,
    sessions: RwLock<HashMap<String, ValidationSession>>,
    last_params: RwLock<HashMap<String, Value>>,
}

impl ValidationSessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
            last_params: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, config_id: &str) -> String {
        let session_id = Uuid::now_v7().to_string();
        let session = ValidationSession {
            session_id: session_id.clone(),
            config_id: config_id.to_string(),
            status: SessionStatus::Running,
            progress: ValidationProgress::default(),
            warnings: Vec::new(),
            discrepancies: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };

        let mut sessions = self.sessions.write().await;
        Self::expire_locked(&mut sessions, self.ttl);
        sessions.insert(session_id.clone(), session);
        session_id
    }

    pub async fn set_total(&self, session_id: &str, total_records: u64) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.progress.total_records = total_records;
        }
    }

    pub async fn advance(&self, session_id: &str, processed: u64, discrepancies_found: u64) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.progress.records_processed += processed;
            session.progress.discrepancies_found = discrepancies_found;
        }
    }

    pub async fn warn(&self, session_id: &str, warning: impl Into<String>) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.warnings.push(warning.into());
        }
    }

    pub async fn complete(&self, session_id: &str, discrepancies: Vec<Discrepancy>) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.progress.discrepancies_found = discrepancies.len() as u64;
            session.discrepancies = discrepancies;
            session.status = SessionStatus::Completed;
            session.finished_at = Some(Utc::now());
        }
    }

    pub async fn fail(&self, session_id: &str, error: impl Into<String>) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.status = SessionStatus::Failed;
            session.error = Some(error.into());
            session.finished_at = Some(Utc::now());
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<ValidationSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Most recently started session for a configuration.
    pub async fn latest_for(&self, config_id: &str) -> Option<ValidationSession> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|session| session.config_id == config_id)
            .max_by_key(|session| session.started_at)
            .cloned()
    }

    pub async fn remember_params(&self, config_id: &str, params: Value) {
        self.last_params
            .write()
            .await
            .insert(config_id.to_string(), params);
    }

    pub async fn last_params(&self, config_id: &str) -> Option<Value> {
        self.last_params.read().await.get(config_id).cloned()
    }

    /// Drop finished sessions past the TTL. Running sessions are never
    /// expired.
    fn expire_locked(sessions: &mut HashMap<String, ValidationSession>, ttl: Duration) {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return;
        };
        let cutoff = Utc::now() - ttl;
        sessions.retain(|_, session| match session.finished_at {
            Some(finished_at) => finished_at > cutoff,
            None => true,
        });
    }
}
