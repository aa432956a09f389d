//! # Sync Error Types
//!
//! Error types for the connection and client layer.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidMessage         │ │
//! │  │  MissingDeploy. │  │  Disconnected   │  │  Protocol / Fatal       │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  DeserializationFailed  │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │     Caller      │  │     Runtime     │  │      Lifecycle          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │ InvalidArgument │  │  Internal       │  │  ShuttingDown           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Auth failures are not errors at this layer. A rejected token is retried
//! once and then the client carries on unauthenticated, reporting the change
//! through the `on_change` callback.
//!
//! Function failures reported by the server are not `SyncError`s; they come
//! back as [`livequery_core::FunctionError`] inside the operation's result.

use livequery_core::{CoreError, ValidationError};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all client-side failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid client configuration.
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),

    /// No deployment URL to connect to.
    #[error("Deployment URL not configured")]
    MissingDeploymentUrl,

    /// Invalid deployment URL.
    #[error("Invalid deployment URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish the WebSocket connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket disconnected unexpectedly.
    #[error("Disconnected from deployment")]
    Disconnected,

    /// Connection timeout.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid message received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize message.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// The server's stream broke protocol rules.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The server reported an unrecoverable error.
    #[error("Fatal server error: {0}")]
    Fatal(String),

    // =========================================================================
    // Caller Errors
    // =========================================================================
    /// Bad function reference, arguments or observer key.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal client error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The client was closed.
    #[error("Sync client is closed")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(_) | CoreError::DuplicateQuery(_) | CoreError::QueryNotFound(_) => {
                SyncError::InvalidArgument(err.to_string())
            }
            CoreError::Decode(reason) => SyncError::DeserializationFailed(reason),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::InvalidArgument(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            WsError::Url(url) => SyncError::InvalidUrl(url.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if a reconnect may fix this error.
    ///
    /// ## Retryable Errors
    /// - Connection failures (network issues)
    /// - Timeouts
    /// - Protocol violations (the session is rebuilt from scratch)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::WebSocketError(_)
                | SyncError::TlsError(_)
                | SyncError::Protocol(_)
                | SyncError::InvalidMessage(_)
                | SyncError::DeserializationFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livequery_core::{ServerMessage, StateVersion};

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("network error".into()).is_retryable());
        assert!(SyncError::Disconnected.is_retryable());
        assert!(SyncError::Timeout(30).is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::MissingDeploymentUrl.is_retryable());
        assert!(!SyncError::ShuttingDown.is_retryable());
    }

    #[test]
    fn test_core_error_conversion() {
        let err: SyncError = CoreError::Validation(ValidationError::Required {
            field: "function".into(),
        })
        .into();
        assert!(matches!(err, SyncError::InvalidArgument(_)));

        let err: SyncError = CoreError::VersionMismatch {
            expected: StateVersion::initial(),
            received: StateVersion {
                query_set: 2,
                identity: 0,
                ts: 9,
            },
        }
        .into();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_undecodable_frame_is_deserialization_error() {
        let err: SyncError = ServerMessage::from_json("{not json").unwrap_err().into();
        assert!(matches!(err, SyncError::DeserializationFailed(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_bad_url_is_not_retryable() {
        use tokio_tungstenite::tungstenite::error::UrlError;
        let err: SyncError = tokio_tungstenite::tungstenite::Error::Url(UrlError::NoHostName).into();
        assert!(matches!(err, SyncError::InvalidUrl(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::Fatal("deployment paused".into());
        assert!(err.to_string().contains("deployment paused"));
        assert_eq!(SyncError::ShuttingDown.to_string(), "Sync client is closed");
    }
}
