//! Layered loading of [`ServiceConfig`]
//!
//! Priority, lowest to highest: struct defaults, TOML file, recognized
//! environment variables. The environment names are part of the external
//! contract and are applied explicitly rather than through a prefix scheme.

use std::path::PathBuf;

use super::models::ServiceConfig;
use super::ConfigError;

const DEFAULT_CONFIG_PATH: &str = "config/flexisync.toml";

pub fn load() -> Result<ServiceConfig, ConfigError> {
    let path = std::env::var("FLEXISYNC_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    load_from_sources(path)
}

pub fn load_from_sources(path: PathBuf) -> Result<ServiceConfig, ConfigError> {
    let builder = config::Config::builder().add_source(
        config::File::from(path)
            .format(config::FileFormat::Toml)
            .required(false),
    );

    let mut service: ServiceConfig = builder.build()?.try_deserialize()?;
    apply_env_overrides(&mut service)?;
    Ok(service)
}

fn apply_env_overrides(config: &mut ServiceConfig) -> Result<(), ConfigError> {
    if let Ok(uri) = std::env::var("BROKER_URI") {
        if !uri.is_empty() {
            config.broker.uri = uri;
        }
    }

    if let Ok(raw) = std::env::var("BROKER_PREFETCH_COUNT") {
        config.broker.prefetch_count = parse_env("BROKER_PREFETCH_COUNT", &raw)?;
    }

    if let Ok(raw) = std::env::var("DATA_SERVICE_PORT") {
        let port: u16 = parse_env("DATA_SERVICE_PORT", &raw)?;
        config.server.bind_addr.set_port(port);
    }

    if let Ok(raw) = std::env::var("SOURCE_TIMEOUT_MS") {
        config.upstream.source_timeout_ms = parse_env("SOURCE_TIMEOUT_MS", &raw)?;
    }

    if let Ok(raw) = std::env::var("DEST_TIMEOUT_MS") {
        config.upstream.dest_timeout_ms = parse_env("DEST_TIMEOUT_MS", &raw)?;
    }

    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        reason: format!("cannot parse {raw:?}"),
    })
}
