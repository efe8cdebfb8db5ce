use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors from the language-model capability. Callers decide the recovery:
/// the detector treats any of these as "no pattern", the summariser skips
/// its tick, the executor surfaces them through the suggestion lifecycle.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no API key configured")]
    Unconfigured,
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("provider returned status {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("empty response from model")]
    EmptyResponse,
}

impl LlmError {
    /// Timeouts, rate limiting and 5xx responses are worth another try;
    /// a missing key or a 4xx is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout(_) | LlmError::Transport(_) => true,
            LlmError::Provider { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Error surface of the control-plane API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidTransition(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        ApiError::Internal(format!("language model error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(LlmError::Timeout(30).is_retryable());
        assert!(LlmError::Transport("connection reset".into()).is_retryable());
        assert!(LlmError::Provider { status: 429, message: String::new() }.is_retryable());
        assert!(LlmError::Provider { status: 503, message: String::new() }.is_retryable());
        assert!(!LlmError::Provider { status: 400, message: String::new() }.is_retryable());
        assert!(!LlmError::Unconfigured.is_retryable());
    }

    #[test]
    fn api_error_status_codes() {
        assert_eq!(ApiError::NotFound("suggestion".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::InvalidTransition("pending -> executing".into()).status(),
            StatusCode::CONFLICT
        );
    }
}
