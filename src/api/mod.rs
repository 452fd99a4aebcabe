//! HTTP API exposed to the operator UI and CLI

pub mod error;
pub mod failed;
pub mod models;
pub mod server;
pub mod services;
pub mod state;

pub use server::run;
pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use tower_http::decompression::RequestDecompressionLayer;

/// Build the service router; the server and the tests share this.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/metadata-download/{config_id}",
            post(services::metadata_download).get(services::metadata_download_query),
        )
        .route(
            "/data-download/{config_id}",
            post(services::data_download).get(services::data_download_query),
        )
        .route(
            "/data-delete/{config_id}",
            post(services::data_delete).get(services::data_delete_query),
        )
        .route(
            "/data-validation/{config_id}",
            post(services::data_validation).get(services::data_validation_report),
        )
        .route(
            "/queues/{config_id}",
            post(services::create_queues)
                .get(services::queue_stats)
                .delete(services::delete_queues),
        )
        .route("/status/{config_id}", get(services::config_status))
        .route(
            "/failed-queue/{config_id}",
            get(services::failed_queue_list).delete(services::failed_queue_purge),
        )
        .route("/retry/{config_id}", get(services::retry_by_type))
        .route(
            "/retry/{config_id}/message/{message_id}",
            post(services::retry_message),
        )
        .route("/info", get(services::info))
        .route("/configs", get(services::list_configs))
        .route("/metrics-snapshot", get(services::metrics_snapshot))
        .with_state(state)
        .layer(RequestDecompressionLayer::new())
}
