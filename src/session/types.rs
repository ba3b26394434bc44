//! Session identifiers, views and feedback result types.
//!
//! These types cross the daemon boundary and are serialized as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;
use crate::multipart::FilePart;
use crate::shell::ShellState;

/// Unique identifier for a session.
pub type SessionId = String;

/// Outcome delivered to whoever waits on a session.
pub type Resolution = Result<FeedbackResult, SessionError>;

/// Generate a fresh session identifier.
///
/// Millisecond timestamp plus a random suffix, e.g. `session_1718000000000_3f2a9c1b0`.
pub fn generate_session_id() -> SessionId {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("session_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}

/// Read-only view of a session for the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    /// Session ID.
    pub session_id: SessionId,
    /// Prompt shown above the form.
    pub prompt: Option<String>,
    /// Page title.
    pub title: Option<String>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Snapshot of the terminal log.
    pub logs: Vec<String>,
    /// State of the attached shell.
    pub shell: ShellState,
}

/// Summary info about a session (for listing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Unique session ID.
    pub session_id: SessionId,
    /// Page title.
    pub title: Option<String>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// State of the attached shell.
    pub shell: ShellState,
    /// Number of log fragments.
    pub log_len: usize,
}

/// What the browser submits when the user sends feedback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    /// Feedback text.
    pub input: String,
    /// Submission type; `"submit"` when absent.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Terminal log as the browser rendered it.
    #[serde(default)]
    pub command_logs: Option<String>,
    /// Uploaded files.
    #[serde(default)]
    pub attachments: Vec<FilePart>,
}

impl Submission {
    pub fn text(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }
}

/// Result handed back to the caller of `OpenSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackResult {
    pub input: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub command_logs: String,
    pub interactive_feedback: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<FilePart>,
}

impl FeedbackResult {
    /// Build a result from a submission.
    ///
    /// `session_log` is used when the browser did not send its own log.
    pub fn from_submission(submission: Submission, session_log: String) -> Self {
        Self {
            interactive_feedback: submission.input.clone(),
            input: submission.input,
            kind: submission.kind.unwrap_or_else(|| "submit".to_string()),
            timestamp: Utc::now(),
            command_logs: submission.command_logs.unwrap_or(session_log),
            attachments: submission.attachments,
        }
    }
}
