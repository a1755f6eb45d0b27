//! Error types for session lifecycle operations

use thiserror::Error;

use crate::session::state::SessionStatus;
use crate::storage::StorageError;

/// Errors surfaced by session lifecycle operations.
///
/// Accounting intake never returns these; activity and token-usage failures
/// are logged and dropped instead.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Malformed arguments to a lifecycle operation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unknown session id or binding key
    #[error("Session not found: {0}")]
    NotFound(String),

    /// The session exists but its status does not permit the requested change
    #[error("Invalid transition for session {id}: session is {status}")]
    InvalidTransition {
        /// Id of the session that rejected the change
        id: String,
        /// Status the session was in at the time
        status: SessionStatus,
    },

    /// The session was disconnected along with its project and no longer
    /// accepts writes
    #[error("Session {0} is disconnected")]
    SessionDisconnected(String),

    /// The durable store failed or is unreachable
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(#[from] StorageError),
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_display() {
        let error = SessionError::InvalidInput("agent_type must not be empty".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid input: agent_type must not be empty"
        );
    }

    #[test]
    fn test_not_found_display() {
        let error = SessionError::NotFound("abc-123".to_string());
        assert_eq!(error.to_string(), "Session not found: abc-123");
    }

    #[test]
    fn test_invalid_transition_names_status() {
        let error = SessionError::InvalidTransition {
            id: "abc-123".to_string(),
            status: SessionStatus::Inactive,
        };
        assert_eq!(
            error.to_string(),
            "Invalid transition for session abc-123: session is inactive"
        );
    }

    #[test]
    fn test_disconnected_display() {
        let error = SessionError::SessionDisconnected("abc-123".to_string());
        assert_eq!(error.to_string(), "Session abc-123 is disconnected");
    }

    #[test]
    fn test_storage_error_converts_to_store_unavailable() {
        let storage = StorageError::InvalidData("corrupt row".to_string());
        let error: SessionError = storage.into();
        assert!(matches!(error, SessionError::StoreUnavailable(_)));
        assert_eq!(
            error.to_string(),
            "Session store unavailable: Invalid data: corrupt row"
        );
    }
}
