//! Maps daemon requests onto the session coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::protocol::{Request, Response};
use crate::coordinator::SessionCoordinator;

/// Serves requests for one daemon; cloned into each connection thread.
#[derive(Clone)]
pub struct RequestHandler {
    coordinator: Arc<SessionCoordinator>,
    shutdown: Arc<AtomicBool>,
}

impl RequestHandler {
    pub fn new(coordinator: Arc<SessionCoordinator>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            coordinator,
            shutdown,
        }
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Process one request. `OpenSession` blocks until the session resolves.
    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::Shutdown => {
                self.shutdown.store(true, Ordering::SeqCst);
                Response::ShuttingDown
            }

            Request::OpenSession {
                prompt,
                title,
                timeout_secs,
            } => {
                let timeout = timeout_secs.map(Duration::from_secs);
                match self.coordinator.open_session(prompt, title, timeout) {
                    Ok(pending) => {
                        debug!(session_id = pending.session_id(), "Waiting for feedback");
                        match pending.wait() {
                            Ok(result) => Response::Feedback(result),
                            Err(e) => e.into(),
                        }
                    }
                    Err(e) => e.into(),
                }
            }

            Request::CreateSession { prompt, title } => {
                let (session_id, url) = self.coordinator.create_session(prompt, title);
                Response::SessionCreated { session_id, url }
            }

            Request::GetSession { session_id } => match self.coordinator.get_session(&session_id) {
                Some(view) => Response::Session(view),
                None => crate::error::SessionError::NotFound(session_id).into(),
            },

            Request::ListSessions => Response::SessionList {
                sessions: self.coordinator.list_sessions(),
            },

            Request::EnsureShell { session_id } => match self.coordinator.ensure_shell(&session_id) {
                Ok(()) => Response::ShellReady { session_id },
                Err(e) => e.into(),
            },

            Request::ExecuteCommand {
                session_id,
                command,
            } => match self.coordinator.execute_command(&session_id, &command) {
                Ok(logs) => Response::CommandAccepted { logs },
                Err(e) => e.into(),
            },

            Request::GetLogs { session_id } => match self.coordinator.get_logs(&session_id) {
                Ok(logs) => Response::Logs { logs },
                Err(e) => e.into(),
            },

            Request::SubmitSession {
                session_id,
                submission,
            } => match self.coordinator.submit_session(&session_id, submission) {
                Ok(()) => Response::Submitted { session_id },
                Err(e) => e.into(),
            },

            Request::SubmitMultipart { content_type, body } => {
                match self
                    .coordinator
                    .submit_multipart(content_type.as_deref(), &body)
                {
                    Ok(session_id) => Response::Submitted { session_id },
                    Err(e) => e.into(),
                }
            }
        }
    }
}
