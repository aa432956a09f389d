//! # Error Types
//!
//! Domain-specific error types for livequery-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  livequery-core errors (this file)                                     │
//! │  ├── CoreError        - Protocol faults and caller contract violations │
//! │  └── ValidationError  - Malformed function references / arguments      │
//! │                                                                         │
//! │  livequery-sync errors (separate crate)                                │
//! │  └── SyncError        - Transport, config, auth and lifecycle failures │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → caller                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Query failures reported by the server are NOT errors at this level: they
//! are values (`RemoteQueryResult::Error`) that flow to watches unchanged.

use thiserror::Error;

use crate::types::{RequestId, StateVersion};

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised by the pure sync state machine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A Transition did not start where the last one ended.
    ///
    /// ## When This Occurs
    /// - A frame was lost or reordered on the transport
    /// - The server restarted the session without the client reconnecting
    ///
    /// This is fatal to the current connection: nothing from the Transition
    /// is applied and the connection must resync from scratch.
    #[error("Transition start version {received:?} does not match current version {expected:?}")]
    VersionMismatch {
        expected: StateVersion,
        received: StateVersion,
    },

    /// Server answered a request the client has no record of.
    #[error("Server responded to unknown request id {0}")]
    UnknownRequest(RequestId),

    /// An inbound frame could not be decoded.
    #[error("Failed to decode server message: {0}")]
    Decode(String),

    /// Caller tried to add a query under an identifier that is already tracked.
    #[error("Tried to add a new query with identifier {0} when it already exists")]
    DuplicateQuery(String),

    /// Caller tried to remove an identifier that is not tracked.
    #[error("No query found with identifier {0}")]
    QueryNotFound(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Returns true if the error means the current session can no longer be
    /// trusted and must be torn down and resynchronized.
    ///
    /// Unknown query and request ids are not faults: they race with local
    /// unsubscribes and cancellations and are dropped.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            CoreError::VersionMismatch { .. } | CoreError::Decode(_)
        )
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors for caller-supplied references.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Invalid format (e.g., a function path with stray characters).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::DuplicateQuery("messages".to_string());
        assert_eq!(
            err.to_string(),
            "Tried to add a new query with identifier messages when it already exists"
        );

        let err = ValidationError::Required {
            field: "function path".to_string(),
        };
        assert_eq!(err.to_string(), "function path is required");
    }

    #[test]
    fn test_protocol_faults() {
        let mismatch = CoreError::VersionMismatch {
            expected: StateVersion::initial(),
            received: StateVersion {
                query_set: 1,
                identity: 0,
                ts: 5,
            },
        };
        assert!(mismatch.is_protocol_fault());
        assert!(CoreError::Decode("bad json".into()).is_protocol_fault());
        assert!(!CoreError::QueryNotFound("q".into()).is_protocol_fault());
        assert!(!CoreError::UnknownRequest(4).is_protocol_fault());
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "module".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
