//! Client for communicating with the feedback-shell daemon.
//!
//! The daemon uses a connection-per-request model: each request creates a new
//! Unix socket connection, sends the request, receives the response, then closes.

use std::io::{BufReader, BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::daemon::protocol::{framing, Request, Response};
use crate::session::{FeedbackResult, SessionId, SessionInfo, SessionView, Submission};

/// Read timeout for requests that do not wait on a person.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra time allowed past an `OpenSession` timeout for the daemon to answer.
const OPEN_SESSION_MARGIN: Duration = Duration::from_secs(30);

/// Name of the daemon binary, expected next to the client executable.
const DAEMON_BIN: &str = "feedback-shell-daemon";

/// Client for communicating with the daemon.
///
/// This client creates a new connection for each request, matching the daemon's
/// connection-per-request model.
pub struct DaemonClient {
    sock_path: PathBuf,
    /// Used to bound `OpenSession` when the caller gives no timeout.
    default_feedback_timeout: Duration,
}

impl DaemonClient {
    /// Connect to the daemon configured in `config`, starting it if necessary.
    pub fn connect(config: &Config) -> Result<Self> {
        let client = Self {
            sock_path: config.server.socket_path(),
            default_feedback_timeout: config.session.feedback_timeout(),
        };

        if Self::try_ping(&client.sock_path).is_ok() {
            return Ok(client);
        }

        Self::spawn_daemon()?;

        // Wait for daemon to start
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(100));
            if Self::try_ping(&client.sock_path).is_ok() {
                return Ok(client);
            }
        }

        anyhow::bail!("Daemon failed to start after 5 seconds");
    }

    /// Try to ping the daemon at the given socket path.
    fn try_ping(sock_path: &Path) -> Result<()> {
        match Self::exchange(sock_path, &Request::Ping, Duration::from_secs(5))? {
            Response::Pong => Ok(()),
            Response::Error { message, .. } => anyhow::bail!("Ping failed: {}", message),
            _ => anyhow::bail!("Unexpected response to ping"),
        }
    }

    /// Spawn the daemon process.
    fn spawn_daemon() -> Result<()> {
        let daemon_path = std::env::current_exe()?
            .parent()
            .context("No parent directory for executable")?
            .join(DAEMON_BIN);

        Command::new(&daemon_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn daemon: {:?}", daemon_path))?;

        Ok(())
    }

    fn exchange(sock_path: &Path, req: &Request, read_timeout: Duration) -> Result<Response> {
        let stream = UnixStream::connect(sock_path)
            .context("Failed to connect to daemon - it may have stopped")?;
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;

        let mut writer = BufWriter::new(&stream);
        framing::write_message(&mut writer, req)?;
        writer.flush()?;
        drop(writer);

        let mut reader = BufReader::new(&stream);
        let response: Response = framing::read_message(&mut reader)?;
        Ok(response)
    }

    /// Send a request and receive a response (creates a new connection).
    fn request(&self, req: Request) -> Result<Response> {
        Self::exchange(&self.sock_path, &req, REQUEST_TIMEOUT)
    }

    /// Ping the daemon.
    pub fn ping(&self) -> Result<()> {
        Self::try_ping(&self.sock_path)
    }

    /// Open a session and wait for the user's feedback.
    pub fn open_session(
        &self,
        prompt: Option<&str>,
        title: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<FeedbackResult> {
        let wait = timeout.unwrap_or(self.default_feedback_timeout);
        let req = Request::OpenSession {
            prompt: prompt.map(str::to_string),
            title: title.map(str::to_string),
            timeout_secs: timeout.map(|t| t.as_secs().max(1)),
        };

        let read_timeout = wait.saturating_add(OPEN_SESSION_MARGIN);
        match Self::exchange(&self.sock_path, &req, read_timeout)? {
            Response::Feedback(result) => Ok(result),
            Response::Error { message, .. } => anyhow::bail!("Open session failed: {}", message),
            _ => anyhow::bail!("Unexpected response to open session"),
        }
    }

    /// Create a session nobody waits on. Returns its ID and form URL.
    pub fn create_session(
        &self,
        prompt: Option<&str>,
        title: Option<&str>,
    ) -> Result<(SessionId, String)> {
        let req = Request::CreateSession {
            prompt: prompt.map(str::to_string),
            title: title.map(str::to_string),
        };

        match self.request(req)? {
            Response::SessionCreated { session_id, url } => Ok((session_id, url)),
            Response::Error { message, .. } => anyhow::bail!("Create session failed: {}", message),
            _ => anyhow::bail!("Unexpected response to create session"),
        }
    }

    /// Get a session view.
    pub fn get_session(&self, session_id: &str) -> Result<SessionView> {
        let req = Request::GetSession {
            session_id: session_id.to_string(),
        };

        match self.request(req)? {
            Response::Session(view) => Ok(view),
            Response::Error { message, .. } => anyhow::bail!("Get session failed: {}", message),
            _ => anyhow::bail!("Unexpected response to get session"),
        }
    }

    /// List all sessions.
    pub fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        match self.request(Request::ListSessions)? {
            Response::SessionList { sessions } => Ok(sessions),
            Response::Error { message, .. } => anyhow::bail!("List sessions failed: {}", message),
            _ => anyhow::bail!("Unexpected response to list sessions"),
        }
    }

    /// Start a session's shell.
    pub fn ensure_shell(&self, session_id: &str) -> Result<()> {
        let req = Request::EnsureShell {
            session_id: session_id.to_string(),
        };

        match self.request(req)? {
            Response::ShellReady { .. } => Ok(()),
            Response::Error { message, .. } => anyhow::bail!("Start shell failed: {}", message),
            _ => anyhow::bail!("Unexpected response to start shell"),
        }
    }

    /// Run a command in a session's shell.
    pub fn execute_command(&self, session_id: &str, command: &str) -> Result<Vec<String>> {
        let req = Request::ExecuteCommand {
            session_id: session_id.to_string(),
            command: command.to_string(),
        };

        match self.request(req)? {
            Response::CommandAccepted { logs } => Ok(logs),
            Response::Error { message, .. } => anyhow::bail!("Execute failed: {}", message),
            _ => anyhow::bail!("Unexpected response to execute"),
        }
    }

    /// Get a session's terminal log.
    pub fn get_logs(&self, session_id: &str) -> Result<Vec<String>> {
        let req = Request::GetLogs {
            session_id: session_id.to_string(),
        };

        match self.request(req)? {
            Response::Logs { logs } => Ok(logs),
            Response::Error { message, .. } => anyhow::bail!("Get logs failed: {}", message),
            _ => anyhow::bail!("Unexpected response to get logs"),
        }
    }

    /// Resolve a session with feedback.
    pub fn submit_session(&self, session_id: &str, submission: Submission) -> Result<()> {
        let req = Request::SubmitSession {
            session_id: session_id.to_string(),
            submission,
        };

        match self.request(req)? {
            Response::Submitted { .. } => Ok(()),
            Response::Error { message, .. } => anyhow::bail!("Submit failed: {}", message),
            _ => anyhow::bail!("Unexpected response to submit"),
        }
    }

    /// Resolve a session from a raw multipart upload.
    pub fn submit_multipart(&self, content_type: Option<&str>, body: Vec<u8>) -> Result<SessionId> {
        let req = Request::SubmitMultipart {
            content_type: content_type.map(str::to_string),
            body,
        };

        match self.request(req)? {
            Response::Submitted { session_id } => Ok(session_id),
            Response::Error { message, .. } => anyhow::bail!("Submit failed: {}", message),
            _ => anyhow::bail!("Unexpected response to submit"),
        }
    }

    /// Shutdown the daemon.
    pub fn shutdown(&self) -> Result<()> {
        match self.request(Request::Shutdown)? {
            Response::ShuttingDown => Ok(()),
            Response::Error { message, .. } => anyhow::bail!("Shutdown failed: {}", message),
            _ => anyhow::bail!("Unexpected response to shutdown"),
        }
    }
}
