//! Configuration for the migration service
//!
//! Two distinct things live here:
//!
//! 1. [`ServiceConfig`]: process-level settings (bind address, broker URI,
//!    upstream timeouts), loaded in layers: defaults, then a TOML file,
//!    then recognized environment variables (highest priority).
//! 2. [`ConfigStore`]: the externally-persisted migration configurations,
//!    one JSON document per `configId`, loaded read-only at startup.
//!
//! # Environment Variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `BROKER_URI` | AMQP URI of the broker (default `amqp://localhost`) |
//! | `BROKER_PREFETCH_COUNT` | Per-channel prefetch (default 20) |
//! | `DATA_SERVICE_PORT` | HTTP listen port |
//! | `SOURCE_TIMEOUT_MS` | Default timeout for source instance calls |
//! | `DEST_TIMEOUT_MS` | Default timeout for destination instance calls |
//!
//! The TOML file defaults to `config/flexisync.toml` and can be pointed
//! elsewhere with `FLEXISYNC_CONFIG`.

mod models;
mod sources;
mod store;

pub use models::{
    BrokerSettings, RetentionSettings, ServerSettings, ServiceConfig, UpstreamSettings,
    ValidationSettings,
};
pub use store::{
    AttributeComboSelector, ConfigStore, DataItemConfig, IdMapping, InstanceConfig,
    MigrationConfig, StoreError,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ServiceConfig {
    /// Load configuration from all sources (defaults, file, environment).
    pub fn load() -> Result<Self, ConfigError> {
        sources::load()
    }

    /// Load configuration from a specific TOML file plus the environment.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        sources::load_from_sources(path)
    }
}
