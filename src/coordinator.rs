//! Front door of the feedback subsystem.
//!
//! Opens sessions, hands their URL to a presenter, routes browser requests
//! to the shell runtime and resolves each session exactly once.

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::Config;
use crate::error::SessionError;
use crate::multipart;
use crate::session::{
    lock, FeedbackResult, Reaper, Resolution, SessionId, SessionInfo, SessionStore, SessionView,
    SharedSession, Submission,
};
use crate::shell::ShellRuntime;

/// Form fields that may carry the session ID in a multipart submission.
const SESSION_FIELDS: &[&str] = &["session", "sessionId"];

/// Shows the feedback form for a session to the user.
pub trait Presenter: Send + Sync {
    fn present(&self, session_id: &str, url: &str) -> anyhow::Result<()>;
}

/// Presenter that only logs the form URL.
#[derive(Debug, Default)]
pub struct LogPresenter;

impl Presenter for LogPresenter {
    fn present(&self, session_id: &str, url: &str) -> anyhow::Result<()> {
        info!(session_id, url, "Feedback form ready");
        Ok(())
    }
}

/// A session opened with [`SessionCoordinator::open_session`] whose result is still pending.
pub struct PendingFeedback {
    session_id: SessionId,
    url: String,
    receiver: Receiver<Resolution>,
    timeout: Duration,
    /// `None` when the timeout reaches past what `Instant` can represent.
    deadline: Option<Instant>,
    store: SessionStore,
}

impl PendingFeedback {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Block until the session resolves or the timeout elapses.
    ///
    /// On timeout the session is resolved with `Timeout` and removed. If a
    /// submit wins that race its result is returned instead.
    pub fn wait(self) -> Resolution {
        let Some(deadline) = self.deadline else {
            return self.receiver.recv().unwrap_or(Err(SessionError::Cancelled));
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.receiver.recv_timeout(remaining) {
            Ok(resolution) => resolution,
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Cancelled),
            Err(RecvTimeoutError::Timeout) => {
                if self
                    .store
                    .resolve(&self.session_id, Err(SessionError::Timeout(self.timeout)))
                    .is_ok()
                {
                    info!(session_id = %self.session_id, timeout = ?self.timeout, "Feedback timed out");
                }
                // Whoever resolved the session left exactly one result behind.
                self.receiver.recv().unwrap_or(Err(SessionError::Cancelled))
            }
        }
    }

    /// Non-blocking check for a result.
    pub fn try_result(&self) -> Option<Resolution> {
        match self.receiver.try_recv() {
            Ok(resolution) => Some(resolution),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(SessionError::Cancelled)),
        }
    }
}

/// Owns the session store, the reaper and the shell runtime.
pub struct SessionCoordinator {
    config: Config,
    store: SessionStore,
    runtime: ShellRuntime,
    presenter: Box<dyn Presenter>,
    reaper: Mutex<Option<Reaper>>,
}

impl SessionCoordinator {
    /// Create a coordinator that logs form URLs, and start its reaper.
    pub fn new(config: Config) -> Self {
        Self::with_presenter(config, Box::new(LogPresenter))
    }

    pub fn with_presenter(config: Config, presenter: Box<dyn Presenter>) -> Self {
        let store = SessionStore::new();
        let reaper = Reaper::start(
            store.clone(),
            config.session.reaper_interval(),
            config.session.expiry(),
        );
        Self {
            runtime: ShellRuntime::new(config.shell.clone()),
            config,
            store,
            presenter,
            reaper: Mutex::new(Some(reaper)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start a feedback round and present its form.
    ///
    /// `timeout` defaults to the configured feedback timeout.
    pub fn open_session(
        &self,
        prompt: Option<String>,
        title: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<PendingFeedback, SessionError> {
        let timeout = timeout.unwrap_or_else(|| self.config.session.feedback_timeout());
        let deadline = Instant::now().checked_add(timeout);
        let (session_id, receiver) = self.store.create(prompt, title);
        let url = self.config.server.gui_url(&session_id);

        if let Err(err) = self.presenter.present(&session_id, &url) {
            warn!(session_id = %session_id, error = %err, "Failed to present feedback form");
            self.store.remove(&session_id);
            return Err(SessionError::Presentation(format!("{:#}", err)));
        }

        info!(session_id = %session_id, ?timeout, "Opened feedback session");
        Ok(PendingFeedback {
            session_id,
            url,
            receiver,
            timeout,
            deadline,
            store: self.store.clone(),
        })
    }

    /// Create a session nobody waits on. Returns its ID and form URL.
    pub fn create_session(&self, prompt: Option<String>, title: Option<String>) -> (SessionId, String) {
        let (session_id, _receiver) = self.store.create(prompt, title);
        let url = self.config.server.gui_url(&session_id);
        (session_id, url)
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionView> {
        self.store.get(session_id).map(|session| lock(&session).view())
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.store.list()
    }

    /// Resolve a session with the user's feedback.
    pub fn submit_session(&self, session_id: &str, submission: Submission) -> Result<(), SessionError> {
        self.store.resolve_with(session_id, |session| {
            Ok(FeedbackResult::from_submission(
                submission,
                session.log.joined(),
            ))
        })
    }

    /// Resolve a session from a multipart form upload.
    ///
    /// The body is decoded completely before the session is touched.
    pub fn submit_multipart(
        &self,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<SessionId, SessionError> {
        let form = multipart::parse_request(content_type, body)?;

        let session_id = SESSION_FIELDS
            .iter()
            .find_map(|name| form.field(name))
            .map(str::to_string)
            .ok_or_else(|| SessionError::NotFound(String::new()))?;

        let submission = Submission {
            input: form.field("input").unwrap_or_default().to_string(),
            kind: form.field("type").map(str::to_string),
            command_logs: form.field("commandLogs").map(str::to_string),
            attachments: form.files,
        };
        self.submit_session(&session_id, submission)?;
        Ok(session_id)
    }

    /// Start the session's shell if it has none.
    pub fn ensure_shell(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self.session(session_id)?;
        self.runtime.ensure_started(&session)
    }

    /// Run a command in the session's shell and return the log.
    pub fn execute_command(&self, session_id: &str, command: &str) -> Result<Vec<String>, SessionError> {
        let session = self.session(session_id)?;
        self.runtime.execute(&session, command)
    }

    pub fn get_logs(&self, session_id: &str) -> Result<Vec<String>, SessionError> {
        let session = self.session(session_id)?;
        let logs = lock(&session).log.snapshot();
        Ok(logs)
    }

    /// Stop the reaper and cancel every live session.
    pub fn shutdown(&self) {
        if let Some(mut reaper) = lock(&self.reaper).take() {
            reaper.stop();
        }
        let cancelled = self.store.resolve_all_cancelled();
        info!(cancelled, "Coordinator shut down");
    }

    fn session(&self, session_id: &str) -> Result<SharedSession, SessionError> {
        self.store
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.shell.program = Some("/bin/sh".to_string());
        config.shell.working_dir = Some(std::env::temp_dir());
        config.shell.handshake_timeout_ms = 5000;
        config
    }

    struct FailingPresenter;

    impl Presenter for FailingPresenter {
        fn present(&self, _session_id: &str, _url: &str) -> anyhow::Result<()> {
            anyhow::bail!("no browser available")
        }
    }

    fn wait_for_logs(coordinator: &SessionCoordinator, id: &str, needle: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if coordinator.get_logs(id).unwrap().concat().contains(needle) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_full_round_trip() {
        let coordinator = Arc::new(SessionCoordinator::new(test_config()));
        let pending = coordinator
            .open_session(Some("test".into()), None, Some(Duration::from_secs(30)))
            .unwrap();
        let id = pending.session_id().to_string();
        assert!(pending.url().ends_with(&format!("session={}", id)));

        coordinator.ensure_shell(&id).unwrap();
        let logs = coordinator.execute_command(&id, "echo hi").unwrap();
        assert!(logs.concat().contains("$ echo hi\n"));
        assert!(wait_for_logs(&coordinator, &id, "$ echo hi\nhi\n"));

        let submitter = Arc::clone(&coordinator);
        let submit_id = id.clone();
        let handle = thread::spawn(move || {
            submitter.submit_session(&submit_id, Submission::text("looks good"))
        });

        let result = pending.wait().unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(result.input, "looks good");
        assert_eq!(result.kind, "submit");
        assert!(result.command_logs.contains("$ echo hi"));
        assert!(coordinator.get_session(&id).is_none());
    }

    #[test]
    fn test_open_session_times_out() {
        let coordinator = SessionCoordinator::new(test_config());
        let pending = coordinator
            .open_session(None, None, Some(Duration::from_secs(1)))
            .unwrap();
        let id = pending.session_id().to_string();

        let started = Instant::now();
        let result = pending.wait();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(matches!(result, Err(SessionError::Timeout(_))));
        assert!(coordinator.get_session(&id).is_none());
    }

    #[test]
    fn test_open_session_with_unbounded_timeout() {
        let coordinator = SessionCoordinator::new(test_config());
        let pending = coordinator
            .open_session(None, None, Some(Duration::from_secs(u64::MAX)))
            .unwrap();
        assert_eq!(coordinator.list_sessions().len(), 1);

        coordinator
            .submit_session(pending.session_id(), Submission::text("eventually"))
            .unwrap();
        assert_eq!(pending.wait().unwrap().input, "eventually");
        assert!(coordinator.list_sessions().is_empty());
    }

    #[test]
    fn test_presentation_failure_removes_session() {
        let coordinator = SessionCoordinator::with_presenter(test_config(), Box::new(FailingPresenter));
        let result = coordinator.open_session(None, None, None);
        assert!(matches!(result, Err(SessionError::Presentation(_))));
        assert!(coordinator.list_sessions().is_empty());
    }

    #[test]
    fn test_unknown_session_is_not_found() {
        let coordinator = SessionCoordinator::new(test_config());
        assert!(matches!(
            coordinator.execute_command("missing", "ls"),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            coordinator.get_logs("missing"),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            coordinator.submit_session("missing", Submission::text("x")),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_execute_without_shell_is_not_ready() {
        let coordinator = SessionCoordinator::new(test_config());
        let (id, _) = coordinator.create_session(None, None);
        assert!(matches!(
            coordinator.execute_command(&id, "echo hi"),
            Err(SessionError::ShellNotReady)
        ));
    }

    #[test]
    fn test_submit_terminates_shell_and_removes_session() {
        let coordinator = SessionCoordinator::new(test_config());
        let (id, _) = coordinator.create_session(Some("test".into()), None);
        coordinator.ensure_shell(&id).unwrap();

        coordinator.submit_session(&id, Submission::text("done")).unwrap();
        assert!(coordinator.get_session(&id).is_none());
        assert!(matches!(
            coordinator.submit_session(&id, Submission::text("again")),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_submit_multipart_resolves_session() {
        let coordinator = SessionCoordinator::new(test_config());
        let pending = coordinator
            .open_session(None, None, Some(Duration::from_secs(30)))
            .unwrap();
        let id = pending.session_id().to_string();

        let body = format!(
            "--XYZ\r\nContent-Disposition: form-data; name=\"sessionId\"\r\n\r\n{id}\r\n\
             --XYZ\r\nContent-Disposition: form-data; name=\"input\"\r\n\r\nhello\r\n\
             --XYZ\r\nContent-Disposition: form-data; name=\"img\"; filename=\"a.png\"\r\n\
             Content-Type: image/png\r\n\r\n\u{1}\u{2}\r\n--XYZ--\r\n"
        );
        let resolved = coordinator
            .submit_multipart(Some("multipart/form-data; boundary=XYZ"), body.as_bytes())
            .unwrap();
        assert_eq!(resolved, id);

        let result = pending.wait().unwrap();
        assert_eq!(result.input, "hello");
        assert_eq!(result.attachments.len(), 1);
        assert_eq!(result.attachments[0].filename, "a.png");
        assert_eq!(result.attachments[0].data, vec![1, 2]);
    }

    #[test]
    fn test_bad_multipart_leaves_session_untouched() {
        let coordinator = SessionCoordinator::new(test_config());
        let (id, _) = coordinator.create_session(None, None);
        let result = coordinator.submit_multipart(Some("text/plain"), b"session=x");
        assert!(matches!(result, Err(SessionError::Multipart(_))));
        assert!(coordinator.get_session(&id).is_some());
    }

    #[test]
    fn test_shutdown_cancels_pending_sessions() {
        let coordinator = SessionCoordinator::new(test_config());
        let pending = coordinator
            .open_session(None, None, Some(Duration::from_secs(30)))
            .unwrap();
        coordinator.shutdown();
        assert!(matches!(pending.wait(), Err(SessionError::Cancelled)));
        assert!(coordinator.list_sessions().is_empty());
    }

    #[test]
    fn test_try_result_is_empty_until_resolved() {
        let coordinator = SessionCoordinator::new(test_config());
        let pending = coordinator
            .open_session(None, None, Some(Duration::from_secs(30)))
            .unwrap();
        assert!(pending.try_result().is_none());
        coordinator
            .submit_session(pending.session_id(), Submission::text("ok"))
            .unwrap();
        assert_eq!(pending.try_result().unwrap().unwrap().input, "ok");
    }
}
