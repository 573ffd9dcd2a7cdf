use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the gateway. Each variant maps to exactly one response
/// behavior; only `Handler` is ever built from a caught panic/exception
/// equivalent — every other kind is produced intentionally at a pipeline
/// boundary, never "caught".
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed payload, missing required field, invalid channel name.
    #[error("{0}")]
    Input(String),

    /// Missing, invalid, expired, or IP-mismatched token.
    #[error("{0}")]
    Auth(String),

    /// Disallowed origin, scope mismatch, rate-limit exhaustion, device
    /// mismatch in strict mode. Carries its own status because the spec
    /// assigns different codes (403/429) to different policy failures.
    #[error("{0}")]
    Policy(String, StatusCode),

    /// A shared table (Subscriptions/Auth/RateLimit/Cache) is at capacity.
    #[error("{0}")]
    ResourceExhaustion(String),

    /// Unexpected failure inside a business handler. The message is logged
    /// but never leaked to the client.
    #[error("{0}")]
    Handler(String),

    /// Write to a closed socket, pool bus unreachable. Never surfaced to a
    /// client as a reply — callers treat this as "silent drop, debug log".
    #[error("{0}")]
    Transport(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Input(_) => StatusCode::BAD_REQUEST,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Policy(_, status) => *status,
            AppError::ResourceExhaustion(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Handler(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message a client may see. `Handler` never leaks its internal
    /// detail — the spec requires "no stack traces cross the boundary".
    pub fn public_message(&self) -> String {
        match self {
            AppError::Handler(_) => "Request failed. Check server logs for details.".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Handler(ref msg) = self {
            tracing::error!(error = %msg, "handler failure");
        }
        let status = self.status_code();
        let message = self.public_message();
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
