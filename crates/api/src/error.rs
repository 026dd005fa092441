//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Saga(err) => saga_status(err),
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_status(err: &SagaError) -> StatusCode {
    match err {
        SagaError::UnknownSagaType(_) | SagaError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
        SagaError::AlreadyTerminal { .. } => StatusCode::CONFLICT,
        SagaError::InvalidDefinition(_) => StatusCode::BAD_REQUEST,
        SagaError::DuplicateDefinition(_)
        | SagaError::StaleSignal { .. }
        | SagaError::CorruptHistory(_)
        | SagaError::LogUnavailable { .. }
        | SagaError::Log(_)
        | SagaError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
