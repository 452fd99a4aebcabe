use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level service configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub validation: ValidationSettings,
}

/// HTTP server and on-disk layout
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Directory of migration configuration documents, one JSON per configId
    #[serde(default = "default_configs_dir")]
    pub configs_dir: PathBuf,
    /// Scratch-file root; payloads land under `{outputs_dir}/{configId}/{uuid}.json`
    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            configs_dir: default_configs_dir(),
            outputs_dir: default_outputs_dir(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:3009".parse().expect("static bind address")
}

fn default_configs_dir() -> PathBuf {
    PathBuf::from("configs")
}

fn default_outputs_dir() -> PathBuf {
    PathBuf::from("outputs")
}

/// Message broker connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerSettings {
    #[serde(default = "default_broker_uri")]
    pub uri: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    /// Delay between reconnect attempts
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Bounded retries for the initial connect
    #[serde(default = "default_connect_max_retries")]
    pub connect_max_retries: u32,
}

impl BrokerSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            uri: default_broker_uri(),
            prefetch_count: default_prefetch_count(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_max_retries: default_connect_max_retries(),
        }
    }
}

fn default_broker_uri() -> String {
    "amqp://localhost".to_string()
}

fn default_prefetch_count() -> u16 {
    20
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_connect_max_retries() -> u32 {
    5
}

/// Timeouts for the two upstream instances
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamSettings {
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,
    #[serde(default = "default_dest_timeout_ms")]
    pub dest_timeout_ms: u64,
    /// Analytics data fetches get a longer budget than metadata lookups
    #[serde(default = "default_data_timeout_ms")]
    pub data_timeout_ms: u64,
}

impl UpstreamSettings {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn dest_timeout(&self) -> Duration {
        Duration::from_millis(self.dest_timeout_ms)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            source_timeout_ms: default_source_timeout_ms(),
            dest_timeout_ms: default_dest_timeout_ms(),
            data_timeout_ms: default_data_timeout_ms(),
        }
    }
}

fn default_source_timeout_ms() -> u64 {
    30_000
}

fn default_dest_timeout_ms() -> u64 {
    30_000
}

fn default_data_timeout_ms() -> u64 {
    120_000
}

/// Scratch-file retention
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionSettings {
    /// Orphaned scratch files older than this are removed by the startup sweep
    #[serde(default = "default_scratch_ttl_hours")]
    pub scratch_ttl_hours: u64,
}

impl RetentionSettings {
    pub fn scratch_ttl(&self) -> Duration {
        Duration::from_secs(self.scratch_ttl_hours * 3_600)
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            scratch_ttl_hours: default_scratch_ttl_hours(),
        }
    }
}

fn default_scratch_ttl_hours() -> u64 {
    24
}

/// Validation session lifecycle
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidationSettings {
    /// Finished sessions expire from the store after this many minutes
    #[serde(default = "default_session_ttl_minutes")]
    pub session_ttl_minutes: u64,
    /// Data-element chunk size when paginating analytics fetches
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl ValidationSettings {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_minutes * 60)
    }
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            session_ttl_minutes: default_session_ttl_minutes(),
            page_size: default_page_size(),
        }
    }
}

fn default_session_ttl_minutes() -> u64 {
    60
}

fn default_page_size() -> usize {
    50
}
