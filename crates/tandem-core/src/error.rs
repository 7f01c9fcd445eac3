//! Error types for tandem.
//!
//! Both endpoints share one error enum. Errors are `Clone` so that protocol
//! failures can be published on the event bus as well as returned to callers.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Message a peer sends back when it has no handler for the requested method.
///
/// The caller side compares incoming error text against this constant to tell
/// a missing procedure apart from a handler that failed.
pub const PROCEDURE_NOT_FOUND: &str = "procedure not found";

/// Main error type for tandem.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// No live transport, or the server has no connection for the token.
    #[error("Not connected: {reason}")]
    NotConnected { reason: String },

    /// The remote side has no handler registered under this name.
    #[error("Procedure not found: {method}")]
    ProcedureNotFound { method: String },

    /// Inbound data did not parse as a valid envelope.
    #[error("Invalid JSON-RPC message: {message}")]
    InvalidJsonRpc { message: String },

    /// Remote handler failed, the call timed out, or a reply referenced an
    /// unknown call id.
    #[error("Request error: {message}")]
    Request { message: String },

    /// `init()` was called on a client that already has a live connection.
    #[error("Already connected")]
    AlreadyConnected,

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<Arc<serde_json::Error>>,
    },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for tandem operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl RpcError {
    pub fn not_connected(reason: impl Into<String>) -> Self {
        RpcError::NotConnected {
            reason: reason.into(),
        }
    }

    pub fn request(message: impl Into<String>) -> Self {
        RpcError::Request {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        RpcError::InvalidJsonRpc {
            message: message.into(),
        }
    }

    /// Failure delivered to a caller whose deadline fired before a reply.
    pub fn request_timeout() -> Self {
        Self::request("request timeout")
    }

    /// Failure published when a reply names a call id nobody is waiting on.
    pub fn wrong_request_id() -> Self {
        Self::request("wrong request id")
    }

    /// Classify the text of an inbound `Error` envelope for a call to `method`.
    pub fn from_remote(method: &str, message: String) -> Self {
        if message == PROCEDURE_NOT_FOUND {
            RpcError::ProcedureNotFound {
                method: method.to_string(),
            }
        } else {
            RpcError::Request { message }
        }
    }

    /// Text for a `NotConnected` built from this error, without nesting an
    /// existing `NotConnected` reason.
    pub fn into_reason(self) -> String {
        match self {
            RpcError::NotConnected { reason } => reason,
            other => other.to_string(),
        }
    }

    /// Check if this error should trigger a reconnect attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::NotConnected { .. } | RpcError::Transport { .. } | RpcError::Timeout(_)
        )
    }
}
