use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::controller::ModeError;

/// Error surface of the control API
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Try again later: {0}")]
    TooEarly(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// Error response that gets serialized to JSON
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::TooEarly(_) => StatusCode::CONFLICT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "unknown",
            ApiError::BadRequest(_) => "unknown",
            ApiError::TooEarly(_) => "too_early",
            ApiError::InternalError(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            ApiError::InternalError(_) => {
                tracing::error!(error = %self, "API error occurred");
                "An internal error occurred".to_string()
            }
            _ => {
                tracing::debug!(error = %self, "client error");
                self.to_string()
            }
        };

        let body = ErrorResponse {
            error: self.error_type().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

impl From<ModeError> for ApiError {
    fn from(err: ModeError) -> Self {
        match err {
            ModeError::TooEarly => ApiError::TooEarly(err.to_string()),
            ModeError::UnknownMode(_) => ApiError::NotFound(err.to_string()),
            ModeError::UnknownParam { .. } => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::InternalError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_errors_map_to_the_documented_fault_names() {
        let err: ApiError = ModeError::TooEarly.into();
        assert_eq!(err.error_type(), "too_early");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err: ApiError = ModeError::UnknownMode("warp".into()).into();
        assert_eq!(err.error_type(), "unknown");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: ApiError = ModeError::UnknownParam {
            mode: "p_grid".into(),
            param: "bogus".into(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
