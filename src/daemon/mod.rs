//! Daemon side of feedback-shell.
//!
//! The daemon owns the session coordinator, so sessions and their shells
//! survive any number of short-lived client invocations.

pub mod handler;
pub mod protocol;

pub use handler::RequestHandler;
pub use protocol::{Request, Response};
