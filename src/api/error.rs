use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::planner::PlannerError;
use crate::queues::QueueManagerError;
use crate::validation::ValidationError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(String),

    #[error("not found")]
    NotFound(String),

    #[error("message broker unavailable")]
    BrokerUnavailable(String),

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BrokerUnavailable(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn details(&self) -> &str {
        match self {
            ApiError::Validation(details)
            | ApiError::NotFound(details)
            | ApiError::BrokerUnavailable(details)
            | ApiError::Internal(details) => details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "details": self.details(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<PlannerError> for ApiError {
    fn from(err: PlannerError) -> Self {
        match err {
            PlannerError::ConfigNotFound(id) => ApiError::NotFound(format!("configuration {id}")),
            PlannerError::InvalidRequest(reason) => ApiError::Validation(reason),
            PlannerError::Period(err) => ApiError::Validation(err.to_string()),
            PlannerError::Broker(err) => ApiError::BrokerUnavailable(err.to_string()),
            PlannerError::Encode(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<QueueManagerError> for ApiError {
    fn from(err: QueueManagerError) -> Self {
        match err {
            QueueManagerError::ConfigNotFound(id) => {
                ApiError::NotFound(format!("configuration {id}"))
            }
            QueueManagerError::Broker(err) => ApiError::BrokerUnavailable(err.to_string()),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        ApiError::BrokerUnavailable(err.to_string())
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::ConfigNotFound(id) => {
                ApiError::NotFound(format!("configuration {id}"))
            }
        }
    }
}
