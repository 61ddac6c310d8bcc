use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Forbidden: {0}")]
    Forbidden(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Invariant violation: {0}")]
    InvariantViolation(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Bad Gateway: {0}")]
    BadGateway(String),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl AppError {
    /// Machine-readable kind for callers that branch on error class.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) | AppError::BadRequest(_) => "validation",
            AppError::NotFound(_) => "not_found",
            AppError::Forbidden(_) => "forbidden",
            AppError::Conflict(_) => "state_conflict",
            AppError::InvariantViolation(_) => "invariant_violation",
            AppError::BadGateway(_) => "external_dependency",
            AppError::ServiceUnavailable => "service_unavailable",
            AppError::DatabaseError(_) | AppError::InternalError(_) | AppError::ConfigError(_) => {
                "internal"
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            kind: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            correlation_id: Option<String>,
        }

        let kind = self.kind();

        // 4xx responses carry the message; 5xx responses carry only a generic
        // message plus a correlation id for support lookup.
        let (status, error_message, details, correlation_id) = match self {
            AppError::ValidationError(err) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Validation error".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::BadRequest(err) => (StatusCode::BAD_REQUEST, err.to_string(), None, None),
            AppError::NotFound(err) => (StatusCode::NOT_FOUND, err.to_string(), None, None),
            AppError::Forbidden(err) => (StatusCode::FORBIDDEN, err.to_string(), None, None),
            AppError::Conflict(err) => (StatusCode::CONFLICT, err.to_string(), None, None),
            AppError::InvariantViolation(err) => {
                let correlation_id = Uuid::new_v4().to_string();
                tracing::error!(
                    correlation_id = %correlation_id,
                    error = %err,
                    "Invariant violation"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                    Some(correlation_id),
                )
            }
            AppError::BadGateway(msg) => {
                let correlation_id = Uuid::new_v4().to_string();
                tracing::warn!(correlation_id = %correlation_id, error = %msg, "Upstream failure");
                (
                    StatusCode::BAD_GATEWAY,
                    "Upstream dependency failed".to_string(),
                    None,
                    Some(correlation_id),
                )
            }
            AppError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_string(),
                None,
                None,
            ),
            AppError::DatabaseError(err)
            | AppError::InternalError(err)
            | AppError::ConfigError(err) => {
                let correlation_id = Uuid::new_v4().to_string();
                tracing::error!(
                    correlation_id = %correlation_id,
                    error = %err,
                    "Internal error"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                    Some(correlation_id),
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: error_message,
                kind,
                details,
                correlation_id,
            }),
        )
            .into_response()
    }
}
