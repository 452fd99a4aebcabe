//! Operator-facing endpoints

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::error::ApiError;
use super::failed::{self, FailedQueueQuery, DEFAULT_REPLAY_LIMIT};
use super::models::{
    ConfigListResponse, InfoResponse, PlanAcceptedResponse, QueueFamilyCreatedResponse,
    QueueFamilyDeletedResponse, QueueStatsResponse, RetryResponse, ValidationAcceptedResponse,
};
use super::state::AppState;
use crate::jobs::MetadataSource;
use crate::planner::{DataRequest, MetadataDownloadRequest, RuntimeConfig};
use crate::queues::QueueKind;
use crate::validation::ValidationRequest;

/// `POST /metadata-download/{configId}`
pub async fn metadata_download(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Json(request): Json<MetadataDownloadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state
        .planner()
        .plan_metadata_download(&config_id, request)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PlanAcceptedResponse::processing(
            "metadata download queued",
            summary.config_id,
            summary.total_items,
        )),
    ))
}

/// `GET /metadata-download/{configId}` with JSON-encoded array params
pub async fn metadata_download_query(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let metadata_source = match params.get("metadataSource").map(String::as_str) {
        None | Some("source") => MetadataSource::Source,
        Some("flexiportal-config") => MetadataSource::PortalConfig,
        Some(other) => {
            return Err(ApiError::Validation(format!(
                "unknown metadataSource: {other}"
            )))
        }
    };

    let request = MetadataDownloadRequest {
        metadata_source,
        selected_dashboards: json_param(&params, "selectedDashboards")?.unwrap_or_default(),
        selected_visualizations: json_param(&params, "selectedVisualizations")?
            .unwrap_or_default(),
        selected_maps: json_param(&params, "selectedMaps")?.unwrap_or_default(),
    };

    let summary = state
        .planner()
        .plan_metadata_download(&config_id, request)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(PlanAcceptedResponse::processing(
            "metadata download queued",
            summary.config_id,
            summary.total_items,
        )),
    ))
}

/// `POST /data-download/{configId}`
pub async fn data_download(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Json(request): Json<DataRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let is_delete = request.is_delete;
    plan_data_response(&state, &config_id, request, is_delete).await
}

/// `GET /data-download/{configId}`
pub async fn data_download_query(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let request = data_request_from_params(&params)?;
    let is_delete = request.is_delete;
    plan_data_response(&state, &config_id, request, is_delete).await
}

/// `POST /data-delete/{configId}`
pub async fn data_delete(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Json(request): Json<DataRequest>,
) -> Result<impl IntoResponse, ApiError> {
    plan_data_response(&state, &config_id, request, true).await
}

/// `GET /data-delete/{configId}`
pub async fn data_delete_query(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let request = data_request_from_params(&params)?;
    plan_data_response(&state, &config_id, request, true).await
}

async fn plan_data_response(
    state: &AppState,
    config_id: &str,
    request: DataRequest,
    is_delete: bool,
) -> Result<(StatusCode, Json<PlanAcceptedResponse>), ApiError> {
    let summary = state.planner().plan_data(config_id, request, is_delete).await?;
    let message = if is_delete {
        "data deletion queued"
    } else {
        "data download queued"
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(PlanAcceptedResponse::processing(
            message,
            summary.config_id,
            summary.total_items,
        )),
    ))
}

fn data_request_from_params(
    params: &HashMap<String, String>,
) -> Result<DataRequest, ApiError> {
    Ok(DataRequest {
        data_items_config_ids: json_param(params, "dataItemsConfigIds")?.unwrap_or_default(),
        runtime_config: json_param::<RuntimeConfig>(params, "runtimeConfig")?.unwrap_or_default(),
        is_delete: params
            .get("isDelete")
            .map(|raw| raw == "true")
            .unwrap_or(false),
    })
}

/// `POST /data-validation/{configId}`
pub async fn data_validation(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Json(request): Json<ValidationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = state
        .validation_engine()
        .start(&config_id, request)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ValidationAcceptedResponse {
            success: true,
            config_id,
            session_id,
            status: "processing",
        }),
    ))
}

/// `GET /data-validation/{configId}`: latest session with its report
pub async fn data_validation_report(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get(&config_id).is_none() {
        return Err(ApiError::NotFound(format!("configuration {config_id}")));
    }
    let session = state
        .sessions
        .latest_for(&config_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("no validation session for {config_id}")))?;
    let last_params = state.sessions.last_params(&config_id).await;

    Ok(Json(json!({
        "success": true,
        "configId": config_id,
        "session": session,
        "lastParams": last_params,
    })))
}

/// `POST /queues/{configId}`
pub async fn create_queues(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let queues = state.queue_manager().create_family(&config_id).await?;
    Ok(Json(QueueFamilyCreatedResponse {
        success: true,
        failed_queue: crate::queues::failed_queue(&config_id),
        config_id,
        queues,
    }))
}

/// `DELETE /queues/{configId}`
pub async fn delete_queues(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deletion = state.queue_manager().delete_family(&config_id).await?;
    Ok(Json(QueueFamilyDeletedResponse {
        success: true,
        config_id,
        deleted_queues: deletion.deleted_queues,
        messages_purged: deletion.messages_purged,
    }))
}

/// `GET /queues/{configId}`
pub async fn queue_stats(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .queue_manager()
        .stats_for(&config_id, &state.activity)
        .await?;
    Ok(Json(QueueStatsResponse::from_stats(config_id, stats)))
}

/// `GET /status/{configId}`: aggregate view for operators
pub async fn config_status(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .queue_manager()
        .stats_for(&config_id, &state.activity)
        .await?;

    let mut queues = serde_json::Map::new();
    for entry in &stats.per_queue {
        queues.insert(
            entry.process_type.clone(),
            serde_json::to_value(entry).map_err(|err| ApiError::Internal(err.to_string()))?,
        );
    }

    let validation = state.sessions.latest_for(&config_id).await;

    Ok(Json(json!({
        "success": true,
        "configId": config_id,
        "status": stats.status,
        "queues": Value::Object(queues),
        "dlq": stats.dlq_ready,
        "health": stats.health,
        "validation": validation,
        "timestamp": Utc::now(),
    })))
}

/// `GET /failed-queue/{configId}`
pub async fn failed_queue_list(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Query(query): Query<FailedQueueQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let body = failed::list(&state, &config_id, query).await?;
    Ok(Json(body))
}

/// `DELETE /failed-queue/{configId}`
pub async fn failed_queue_purge(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let purged = failed::purge(&state, &config_id).await?;
    Ok(Json(json!({
        "success": true,
        "configId": config_id,
        "purged": purged,
    })))
}

/// `GET /retry/{configId}?retryType=process-type&processType=...&maxRetries=...`
pub async fn retry_by_type(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(retry_type) = params.get("retryType") {
        if retry_type != "process-type" {
            return Err(ApiError::Validation(format!(
                "unsupported retryType: {retry_type}"
            )));
        }
    }

    let process_type = params
        .get("processType")
        .ok_or_else(|| ApiError::Validation("processType is required".to_string()))
        .and_then(|label| {
            QueueKind::from_label(label)
                .ok_or_else(|| ApiError::Validation(format!("unknown processType: {label}")))
        })?;

    let max_retries = match params.get("maxRetries") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ApiError::Validation(format!("maxRetries must be a number: {raw}")))?,
        None => DEFAULT_REPLAY_LIMIT,
    };

    let retried =
        failed::retry_by_process_type(&state, &config_id, process_type, max_retries).await?;
    Ok(Json(RetryResponse {
        success: true,
        config_id,
        retried,
    }))
}

/// `POST /retry/{configId}/message/{messageId}`
pub async fn retry_message(
    State(state): State<AppState>,
    Path((config_id, message_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let found = failed::retry_single(&state, &config_id, &message_id).await?;
    if !found {
        return Err(ApiError::NotFound(format!(
            "message {message_id} in failed queue of {config_id}"
        )));
    }
    Ok(Json(RetryResponse {
        success: true,
        config_id,
        retried: 1,
    }))
}

/// `GET /info`
pub async fn info() -> impl IntoResponse {
    Json(InfoResponse {
        success: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `GET /configs`
pub async fn list_configs(State(state): State<AppState>) -> impl IntoResponse {
    Json(ConfigListResponse {
        success: true,
        configs: state.store.ids(),
    })
}

/// `GET /metrics-snapshot`
pub async fn metrics_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "success": true,
        "metrics": state.metrics.snapshot(),
    }))
}

fn json_param<T: DeserializeOwned>(
    params: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ApiError> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => serde_json::from_str(raw)
            .map(Some)
            .map_err(|err| ApiError::Validation(format!("cannot parse {key}: {err}"))),
    }
}
