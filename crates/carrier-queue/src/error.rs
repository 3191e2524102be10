//! Error types for queue and dispatch operations.
//!
//! Implements the engine error taxonomy: caller-input failures surface
//! to the API; store failures inside a worker trigger a short-backoff
//! requeue instead of dead-lettering, because the fault is the engine's
//! rather than the request's. Transport and HTTP errors feed the retry
//! decision.

use thiserror::Error;

use carrier_core::CoreError;

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors produced by the queue engine and its workers.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// Caller input failed validation.
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// A request with the same id already exists.
    #[error("request {id} already exists")]
    Conflict {
        /// The conflicting request id.
        id: String,
    },

    /// Referenced request does not exist.
    #[error("request {id} not found")]
    NotFound {
        /// The missing request id.
        id: String,
    },

    /// The engine is shutting down and rejects new work.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Durable store unavailable or failed.
    #[error("storage error: {message}")]
    Storage {
        /// Underlying storage failure description.
        message: String,
    },

    /// Index store unavailable or failed.
    #[error("index store error: {message}")]
    Index {
        /// Underlying index failure description.
        message: String,
    },

    /// HTTP request failed before a response was received.
    #[error("transport error: {message}")]
    Transport {
        /// Transport failure description.
        message: String,
    },

    /// Non-2xx HTTP response.
    #[error("HTTP {status}")]
    Http {
        /// HTTP status code of the response.
        status: u16,
    },

    /// Malformed configuration or missing custom function.
    #[error("configuration error: {message}")]
    Config {
        /// Configuration failure description.
        message: String,
    },

    /// Per-request deadline exceeded.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// Workers did not finish within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// How long shutdown waited before giving up.
        timeout: std::time::Duration,
    },
}

impl QueueError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a conflict error for a duplicate id.
    pub fn conflict(id: impl Into<String>) -> Self {
        Self::Conflict { id: id.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates an index store error.
    pub fn index(message: impl Into<String>) -> Self {
        Self::Index { message: message.into() }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates an HTTP response error.
    pub fn http(status: u16) -> Self {
        Self::Http { status }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// HTTP status carried by this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status } => Some(*status),
            _ => None,
        }
    }

    /// Whether this error kind represents an engine fault (store outage)
    /// rather than a request outcome.
    pub fn is_engine_fault(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Index { .. })
    }
}

impl From<CoreError> for QueueError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(message) => Self::NotFound { id: message },
            CoreError::Conflict(message) => Self::Conflict { id: message },
            CoreError::InvalidInput(message) => Self::Validation { message },
            CoreError::Database(message) => Self::Storage { message },
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Index { message: err.to_string() }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Index { message: format!("snapshot serialization failed: {err}") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_faults_identified() {
        assert!(QueueError::storage("connection lost").is_engine_fault());
        assert!(QueueError::index("connection refused").is_engine_fault());
        assert!(!QueueError::http(500).is_engine_fault());
        assert!(!QueueError::timeout(30_000).is_engine_fault());
    }

    #[test]
    fn core_conflict_maps_to_conflict() {
        let err = QueueError::from(CoreError::Conflict("req-1".to_string()));
        assert!(matches!(err, QueueError::Conflict { .. }));
    }

    #[test]
    fn error_display_format() {
        assert_eq!(QueueError::http(503).to_string(), "HTTP 503");
        assert_eq!(
            QueueError::timeout(30_000).to_string(),
            "request timed out after 30000ms"
        );
    }
}
