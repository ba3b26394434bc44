//! Interactive shells attached to feedback sessions.

pub mod command;
pub mod filter;
mod process;
pub mod runtime;

use serde::{Deserialize, Serialize};

pub(crate) use runtime::ShellSlot;
pub use runtime::ShellRuntime;

/// Lifecycle state of a session's shell attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellState {
    /// No shell attached.
    Absent,
    /// Spawned, handshake not yet answered.
    Spawning,
    /// Accepting commands.
    Ready,
}
