//! feedback-shell library crate.
//!
//! This library provides the core of the feedback-shell daemon, including:
//! - Feedback sessions with single-resolution semantics and expiry
//! - Per-session interactive shells with a readiness handshake
//! - Output cleaning and multipart upload decoding
//! - The daemon protocol and its client

pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod daemon_client;
pub mod error;
pub mod multipart;
pub mod session;
pub mod shell;

pub use coordinator::{LogPresenter, PendingFeedback, Presenter, SessionCoordinator};
pub use error::{ErrorKind, SessionError};
