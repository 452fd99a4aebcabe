//! Process wiring: config, broker, worker runtime, HTTP server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use super::state::AppState;
use crate::broker::Broker;
use crate::config::{ConfigStore, ServiceConfig};
use crate::worker::{ActivityTable, WorkerRuntime};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn run(address_override: Option<SocketAddr>) -> Result<(), AnyError> {
    info!("loading configuration");
    let config = ServiceConfig::load().map_err(|err| format!("cannot load config: {err}"))?;
    let address = address_override.unwrap_or(config.server.bind_addr);

    info!(path = %config.server.configs_dir.display(), "loading migration configs");
    let store = ConfigStore::load_dir(&config.server.configs_dir)
        .map_err(|err| format!("cannot load migration configs: {err}"))?;
    info!(configs = store.len(), "migration configs loaded");

    info!("connecting to broker");
    let broker = Broker::connect(config.broker.clone())
        .await
        .map_err(|err| format!("cannot connect to broker: {err}"))?;

    let activity = Arc::new(ActivityTable::new());
    let state = AppState::new(config, store, Arc::new(broker), activity.clone());

    // orphaned scratch files from crashed or dead-lettered runs
    let swept = state
        .scratch
        .sweep_older_than(state.config.retention.scratch_ttl())
        .await
        .unwrap_or_else(|err| {
            warn!(error = %err, "scratch sweep failed");
            0
        });
    if swept > 0 {
        info!(swept, "removed orphaned scratch files");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime = Arc::new(WorkerRuntime::new(
        state.handler_context(),
        activity,
        state.config.broker.reconnect_delay(),
    ));
    runtime.clone().start(shutdown_rx.clone()).await?;

    let app = super::router(state);
    let listener = TcpListener::bind(address).await?;
    info!(%address, "flexisync API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
