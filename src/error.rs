//! Error types for session, shell and upload handling.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::multipart::MultipartError;
use crate::session::SessionId;

/// Errors surfaced by the session subsystem.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session is absent or has already been resolved.
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// No ready shell is attached; retry after `EnsureShell`.
    #[error("Shell not ready")]
    ShellNotReady,

    /// A freshly spawned shell never echoed its readiness marker.
    #[error("Shell initialization timeout after {0:?}")]
    HandshakeTimeout(Duration),

    /// No feedback arrived before the session's deadline or expiry.
    #[error("Session timeout after {0:?}")]
    Timeout(Duration),

    /// The submitted upload could not be decoded.
    #[error("Invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),

    /// The shell program could not be started.
    #[error("Failed to spawn shell {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The feedback form could not be shown to the user.
    #[error("Failed to open feedback form: {0}")]
    Presentation(String),

    /// The service shut down before the session resolved.
    #[error("Session cancelled")]
    Cancelled,
}

/// Wire-level classification of a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    ShellNotReady,
    HandshakeTimeout,
    Timeout,
    InvalidRequest,
    Internal,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::ShellNotReady => ErrorKind::ShellNotReady,
            SessionError::HandshakeTimeout(_) => ErrorKind::HandshakeTimeout,
            SessionError::Timeout(_) => ErrorKind::Timeout,
            SessionError::Multipart(_) => ErrorKind::InvalidRequest,
            SessionError::Spawn { .. } | SessionError::Presentation(_) | SessionError::Cancelled => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::ShellNotReady | SessionError::HandshakeTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            SessionError::NotFound("s".to_string()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            SessionError::Multipart(MultipartError::MissingBoundary).kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(SessionError::Cancelled.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_retryable() {
        assert!(SessionError::ShellNotReady.is_retryable());
        assert!(SessionError::HandshakeTimeout(Duration::from_secs(2)).is_retryable());
        assert!(!SessionError::NotFound("s".to_string()).is_retryable());
        assert!(!SessionError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_messages() {
        assert_eq!(SessionError::ShellNotReady.to_string(), "Shell not ready");
        assert_eq!(
            SessionError::NotFound("abc".to_string()).to_string(),
            "Session not found: abc"
        );
    }
}
