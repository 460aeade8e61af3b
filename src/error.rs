//! Error taxonomy for the host agent.
//!
//! Handlers return `Result<_, AgentError>`; the axum layer converts each
//! variant to its wire status. Internal errors never leak stack traces or
//! paths; the client sees `{error, correlationId}` only.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Malformed or out-of-contract input. 400.
    #[error("{0}")]
    Validation(String),

    /// Missing, invalid, or expired credential. 401.
    #[error("unauthorized")]
    Unauthorized,

    /// Caller is not allowed to perform this operation. 403.
    #[error("{0}")]
    Forbidden(String),

    /// Unknown session or resource. 404.
    #[error("{0}")]
    NotFound(String),

    /// Command timed out or the handler gave up waiting. 408.
    #[error("{0}")]
    Timeout(String),

    /// A command is already running for this session. 409.
    #[error("busy: a command is already running for this session")]
    Busy,

    /// Session exists but has expired. 410.
    #[error("{0}")]
    Gone(String),

    /// Per-session rate limit exceeded. 429.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Seconds until the oldest window entry expires.
        retry_after_secs: u64,
    },

    /// Child process could not be spawned or crashed. 500.
    #[error("{0}")]
    Child(String),

    /// Anything unanticipated. Logged with correlation id, sanitized on the wire.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AgentError {
    pub fn status(&self) -> StatusCode {
        match self {
            AgentError::Validation(_) => StatusCode::BAD_REQUEST,
            AgentError::Unauthorized => StatusCode::UNAUTHORIZED,
            AgentError::Forbidden(_) => StatusCode::FORBIDDEN,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            AgentError::Busy => StatusCode::CONFLICT,
            AgentError::Gone(_) => StatusCode::GONE,
            AgentError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AgentError::Child(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AgentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            // Internal details stay in the log; the wire body is generic.
            // The correlation-id middleware stamps the header on the way out.
            AgentError::Internal(e) => {
                tracing::error!(err = %format!("{e:#}"), "internal error");
                json!({ "error": "internal error" })
            }
            AgentError::Child(e) => {
                tracing::error!(err = %e, "child process error");
                json!({ "error": "command execution failed" })
            }
            AgentError::RateLimited { retry_after_secs } => json!({
                "error": self.to_string(),
                "retryAfterSecs": retry_after_secs,
            }),
            other => json!({ "error": other.to_string() }),
        };

        let mut response = (status, Json(body)).into_response();
        if let AgentError::RateLimited { retry_after_secs } = self {
            if let Ok(v) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("retry-after", v);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            AgentError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AgentError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AgentError::NotFound("s".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AgentError::Gone("s".into()).status(), StatusCode::GONE);
        assert_eq!(AgentError::Busy.status(), StatusCode::CONFLICT);
        assert_eq!(
            AgentError::RateLimited {
                retry_after_secs: 1
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AgentError::Timeout("t".into()).status(),
            StatusCode::REQUEST_TIMEOUT
        );
    }
}
