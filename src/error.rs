//! Error types for the agent core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Persistence-layer error
    #[error("storage error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// API error from the model provider (non-2xx, not retried)
    #[error("provider error: {0}")]
    Api(String),

    /// Provider reported HTTP 429 / `RESOURCE_EXHAUSTED`; carries the wait
    /// parsed from `Retry-After` (numeric seconds or an HTTP-date), or a
    /// default when the header was absent or unparseable.
    #[error("rate limited by provider, retry after {0:?}")]
    RateLimit(Duration),

    /// Streaming protocol error
    #[error("streaming error: {0}")]
    Stream(String),

    /// Tool execution error
    #[error("tool execution error: {0}")]
    Tool(String),

    /// Spreadsheet backend failure
    #[error("spreadsheet backend error: {0}")]
    Backend(String),

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A pending action blocks this operation
    #[error("pending action must be resolved: {0}")]
    PendingAction(String),

    /// Undo journal replay failed
    #[error("undo failed: {0}")]
    Undo(String),

    /// Request timeout
    #[error("request timeout")]
    Timeout,

    /// The request was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error
    pub fn api(msg: impl Into<String>) -> Self {
        Error::Api(msg.into())
    }

    /// Create a new rate-limit error carrying the provider's suggested wait
    pub fn rate_limit(wait: Duration) -> Self {
        Error::RateLimit(wait)
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new spreadsheet backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Error::Backend(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new pending-action-conflict error
    pub fn pending_action(msg: impl Into<String>) -> Self {
        Error::PendingAction(msg.into())
    }

    /// Create a new undo error
    pub fn undo(msg: impl Into<String>) -> Self {
        Error::Undo(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Create a cancellation error
    pub fn cancelled() -> Self {
        Error::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_config() {
        let err = Error::config("missing api key");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "invalid configuration: missing api key");
    }

    #[test]
    fn test_error_pending_action() {
        let err = Error::pending_action("conv-1");
        assert_eq!(err.to_string(), "pending action must be resolved: conv-1");
    }

    #[test]
    fn test_error_backend() {
        let err = Error::backend("sheet not found");
        assert!(matches!(err, Error::Backend(_)));
    }

    #[test]
    fn test_error_cancelled() {
        let err = Error::cancelled();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(err.to_string(), "cancelled");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn _returns_result() -> Result<i32> {
            Ok(42)
        }
        fn _returns_error() -> Result<i32> {
            Err(Error::timeout())
        }
    }
}
