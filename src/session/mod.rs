//! Feedback sessions: identity, terminal log, store and expiry.
//!
//! This module provides:
//! - `SessionStore` - Owns all live sessions and arbitrates their resolution
//! - `Reaper` - Expires sessions nobody resolved in time
//! - `SessionLog` - The terminal log shown in the browser

pub mod log;
pub mod reaper;
pub mod store;
pub mod types;

pub use log::SessionLog;
pub use reaper::Reaper;
pub(crate) use store::lock;
pub use store::{Session, SessionStore, SharedSession};
pub use types::{
    generate_session_id, FeedbackResult, Resolution, SessionId, SessionInfo, SessionView,
    Submission,
};
