//! Core error taxonomy
//!
//! Every failure the connection core can surface to a caller is one of
//! these kinds. Anything else is a programmer error and bubbles to the
//! supervisor.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors returned to command callers and the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Session exists but is not connected; nothing was buffered.
    #[error("printer {0} is not connected")]
    Unavailable(String),

    /// No correlated response arrived in time.
    #[error("command timed out after {0} ms")]
    Timeout(u64),

    /// The connection dropped while an RPC was in flight.
    #[error("printer {0} disconnected mid-command")]
    Disconnected(String),

    /// Caller or shutdown cancelled the operation before it published.
    #[error("command canceled")]
    Canceled,

    /// Unexpected MQTT or JSON shape on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A report frame could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Unknown printer serial or spool id.
    #[error("{0} not found")]
    NotFound(String),

    /// A staged assignment for the slot already existed and was replaced.
    #[error("staged assignment replaced for {0}")]
    Conflict(String),

    /// Persistent connect failure (>10 failures in 5 minutes).
    #[error("printer {0} unreachable")]
    Unreachable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CoreError {
    fn status(&self) -> StatusCode {
        match self {
            CoreError::Unavailable(_) | CoreError::Unreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Disconnected(_) => StatusCode::BAD_GATEWAY,
            CoreError::Canceled => StatusCode::REQUEST_TIMEOUT,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Protocol(_) | CoreError::Parse(_) | CoreError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            CoreError::NotFound("spool s1".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CoreError::Unavailable("X".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(CoreError::Timeout(5000).status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
