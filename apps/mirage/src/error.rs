use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::engine::EngineError;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway-level error taxonomy shared by the REST and WebSocket façades.
///
/// Engine failures that occur while executing a request are *not* represented
/// here; they travel as the `error` field of the response payload so the
/// caller can decide what to do with them.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Unknown session or connection.
    #[error("{0}")]
    NotFound(String),

    /// Session ID collision on create.
    #[error("{0}")]
    AlreadyExists(String),

    /// Malformed body, conflicting mutually-exclusive fields, unknown
    /// message type.
    #[error("{0}")]
    InvalidInput(String),

    /// Engine-level failure while acting on a session (proxy rejected,
    /// fingerprint not applicable, IP lookup failed, ...).
    #[error("{0}")]
    Execution(String),

    /// Admission controller saturated.
    #[error("too many concurrent requests")]
    CapacityExceeded,

    /// Unexpected failure. The detail is logged, never surfaced.
    #[error("internal server error")]
    Internal(String),
}

impl GatewayError {
    pub fn session_not_found(id: &str) -> Self {
        Self::NotFound(format!("session with ID {id} not found"))
    }

    pub fn session_exists(id: &str) -> Self {
        Self::AlreadyExists(format!("session with ID {id} already exists"))
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Execution(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::CapacityExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for GatewayError {
    fn from(err: EngineError) -> Self {
        Self::Execution(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            error!("internal error: {detail}");
        }
        let status = self.status();
        let body = json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}
