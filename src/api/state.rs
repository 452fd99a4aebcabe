use std::sync::Arc;

use crate::broker::MessageQueue;
use crate::config::{ConfigStore, ServiceConfig};
use crate::handlers::{HandlerContext, ScratchStore};
use crate::observability::Metrics;
use crate::planner::Planner;
use crate::queues::QueueManager;
use crate::validation::{ValidationEngine, ValidationSessionStore};
use crate::worker::ActivityTable;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub store: Arc<ConfigStore>,
    pub broker: Arc<dyn MessageQueue>,
    pub sessions: Arc<ValidationSessionStore>,
    pub metrics: Arc<Metrics>,
    pub activity: Arc<ActivityTable>,
    pub scratch: Arc<ScratchStore>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(
        config: ServiceConfig,
        store: ConfigStore,
        broker: Arc<dyn MessageQueue>,
        activity: Arc<ActivityTable>,
    ) -> Self {
        let scratch = Arc::new(ScratchStore::new(config.server.outputs_dir.clone()));
        let sessions = Arc::new(ValidationSessionStore::new(config.validation.session_ttl()));
        Self {
            config: Arc::new(config),
            store: Arc::new(store),
            broker,
            sessions,
            metrics: Arc::new(Metrics::new()),
            activity,
            scratch,
            http: reqwest::Client::new(),
        }
    }

    pub fn planner(&self) -> Planner {
        Planner::new(
            self.store.clone(),
            self.broker.clone(),
            self.metrics.clone(),
        )
    }

    pub fn queue_manager(&self) -> QueueManager {
        QueueManager::new(self.broker.clone(), self.store.clone())
    }

    pub fn validation_engine(&self) -> ValidationEngine {
        ValidationEngine::new(
            self.store.clone(),
            self.sessions.clone(),
            self.http.clone(),
            self.config.upstream.clone(),
            self.metrics.clone(),
        )
    }

    pub fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            store: self.store.clone(),
            broker: self.broker.clone(),
            http: self.http.clone(),
            scratch: self.scratch.clone(),
            upstream: self.config.upstream.clone(),
            metrics: self.metrics.clone(),
        }
    }
}
