//! IPC protocol between the feedback-shell client and daemon.
//!
//! The daemon owns every session and shell process, so a client can exit
//! and reconnect without losing them.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SessionError};
use crate::session::{FeedbackResult, SessionId, SessionInfo, SessionView, Submission};

/// Request messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Ping to check daemon is alive.
    Ping,

    /// Gracefully shutdown the daemon.
    Shutdown,

    /// Open a session and block until it resolves.
    OpenSession {
        prompt: Option<String>,
        title: Option<String>,
        /// Seconds to wait for feedback; configured default when absent.
        timeout_secs: Option<u64>,
    },

    /// Create a session without waiting on it.
    CreateSession {
        prompt: Option<String>,
        title: Option<String>,
    },

    /// Get a read-only view of a session.
    GetSession { session_id: SessionId },

    /// List all sessions.
    ListSessions,

    /// Start the session's shell if needed.
    EnsureShell { session_id: SessionId },

    /// Run a command in the session's shell.
    ExecuteCommand {
        session_id: SessionId,
        command: String,
    },

    /// Get the session's terminal log.
    GetLogs { session_id: SessionId },

    /// Resolve a session with feedback.
    SubmitSession {
        session_id: SessionId,
        submission: Submission,
    },

    /// Resolve a session from a raw multipart upload.
    SubmitMultipart {
        content_type: Option<String>,
        body: Vec<u8>,
    },
}

/// Response messages sent from daemon to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Ping response.
    Pong,

    /// Shutdown acknowledged.
    ShuttingDown,

    /// Feedback from a resolved `OpenSession`.
    Feedback(FeedbackResult),

    /// Session created successfully.
    SessionCreated { session_id: SessionId, url: String },

    /// Session view.
    Session(SessionView),

    /// List of all sessions.
    SessionList { sessions: Vec<SessionInfo> },

    /// The session's shell answered its handshake.
    ShellReady { session_id: SessionId },

    /// Command written to the shell.
    CommandAccepted { logs: Vec<String> },

    /// Terminal log snapshot.
    Logs { logs: Vec<String> },

    /// Session resolved by a submit.
    Submitted { session_id: SessionId },

    /// Error occurred.
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            kind,
            message: message.into(),
        }
    }
}

impl From<SessionError> for Response {
    fn from(err: SessionError) -> Self {
        Response::error(err.kind(), err.to_string())
    }
}

/// Length-prefixed message framing for the IPC protocol.
pub mod framing {
    use std::io::{self, Read, Write};

    use super::*;

    /// Frames larger than this are rejected.
    pub const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

    /// Write a message with length prefix.
    pub fn write_message<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> io::Result<()> {
        let data =
            serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if data.len() > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Message too large: {} bytes", data.len()),
            ));
        }
        let len = data.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&data)?;
        writer.flush()?;
        Ok(())
    }

    /// Read a length-prefixed message.
    pub fn read_message<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> io::Result<T> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Message too large: {} bytes", len),
            ));
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::framing::{read_message, write_message};
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_carries_request() {
        let mut buf = Vec::new();
        let request = Request::ExecuteCommand {
            session_id: "session_1_abc".to_string(),
            command: "echo hi".to_string(),
        };
        write_message(&mut buf, &request).unwrap();
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);

        let decoded: Request = read_message(&mut Cursor::new(buf)).unwrap();
        match decoded {
            Request::ExecuteCommand { session_id, command } => {
                assert_eq!(session_id, "session_1_abc");
                assert_eq!(command, "echo hi");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let len = framing::MAX_MESSAGE_LEN as u32 + 1;
        let mut buf = len.to_le_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let err = read_message::<_, Request>(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_frame_is_eof() {
        let buf = vec![10, 0, 0, 0, b'{'];
        let err = read_message::<_, Request>(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_error_response_from_session_error() {
        let response = Response::from(SessionError::ShellNotReady);
        match response {
            Response::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::ShellNotReady);
                assert_eq!(message, "Shell not ready");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
