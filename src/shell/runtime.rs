//! Per-session shell lifecycle: spawn, readiness handshake, command dispatch.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::command;
use super::filter::HANDSHAKE_MARKER_PREFIX;
use super::process::ShellProcess;
use super::ShellState;
use crate::config::ShellConfig;
use crate::error::SessionError;
use crate::session::{lock, SharedSession};

/// Pending readiness proof for one spawned shell.
#[derive(Debug)]
struct Handshake {
    generation: u64,
    marker: String,
    /// Tail of stdout seen so far, long enough to catch a marker split across reads.
    seen: String,
    waiters: Vec<Sender<()>>,
}

impl Handshake {
    fn observe(&mut self, text: &str) -> bool {
        self.seen.push_str(text);
        if self.seen.contains(&self.marker) {
            return true;
        }
        let keep = self.marker.len();
        if self.seen.len() > keep {
            let mut cut = self.seen.len() - keep;
            while !self.seen.is_char_boundary(cut) {
                cut -= 1;
            }
            self.seen.drain(..cut);
        }
        false
    }

    fn join(&mut self) -> Receiver<()> {
        let (tx, rx) = mpsc::channel();
        self.waiters.push(tx);
        rx
    }
}

/// The shell attachment of a session.
///
/// Each spawn gets a new generation so events from a shell that was
/// already replaced or detached are ignored.
#[derive(Debug, Default)]
pub(crate) struct ShellSlot {
    process: Option<ShellProcess>,
    ready: bool,
    next_generation: u64,
    /// Highest generation detached on purpose; its output is dropped.
    retired: u64,
    handshake: Option<Handshake>,
}

impl ShellSlot {
    pub(crate) fn state(&self) -> ShellState {
        match (&self.process, self.ready) {
            (None, _) => ShellState::Absent,
            (Some(_), false) => ShellState::Spawning,
            (Some(_), true) => ShellState::Ready,
        }
    }

    fn is_ready(&self, generation: u64) -> bool {
        self.ready
            && self
                .process
                .as_ref()
                .is_some_and(|process| process.generation() == generation)
    }

    fn allocate_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn attach(&mut self, process: ShellProcess, marker: String) -> Receiver<()> {
        let mut handshake = Handshake {
            generation: process.generation(),
            marker,
            seen: String::new(),
            waiters: Vec::new(),
        };
        let rx = handshake.join();
        self.process = Some(process);
        self.ready = false;
        self.handshake = Some(handshake);
        rx
    }

    /// Feed stdout from shell `generation` to a pending handshake.
    pub(crate) fn observe_output(&mut self, generation: u64, text: &str) {
        let Some(handshake) = self.handshake.as_mut() else {
            return;
        };
        if handshake.generation != generation || !handshake.observe(text) {
            return;
        }
        if let Some(handshake) = self.handshake.take() {
            self.ready = true;
            for waiter in handshake.waiters {
                let _ = waiter.send(());
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.process.as_ref().map(ShellProcess::generation) == Some(generation)
    }

    pub(crate) fn is_retired(&self, generation: u64) -> bool {
        generation <= self.retired
    }

    fn retire(&mut self, generation: u64) {
        self.retired = self.retired.max(generation);
    }

    /// Detach the shell if it is still generation `generation`.
    pub(crate) fn detach(&mut self, generation: u64) -> Option<ShellProcess> {
        if !self.is_current(generation) {
            return None;
        }
        self.take()
    }

    /// Detach whatever shell is attached and drop its further output.
    ///
    /// Dropping the handshake wakes any caller still waiting on it.
    pub(crate) fn take(&mut self) -> Option<ShellProcess> {
        self.ready = false;
        self.handshake = None;
        let process = self.process.take();
        if let Some(process) = &process {
            self.retire(process.generation());
        }
        process
    }

    /// Record that shell `generation` exited on its own.
    ///
    /// Returns false when that shell was no longer attached. Output it
    /// flushed while exiting is still kept.
    pub(crate) fn exited(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.ready = false;
        self.handshake = None;
        self.process = None;
        true
    }

    fn ready_process(&self) -> Option<&ShellProcess> {
        if self.ready {
            self.process.as_ref()
        } else {
            None
        }
    }
}

/// Starts shells for sessions and runs commands in them.
#[derive(Debug, Clone)]
pub struct ShellRuntime {
    config: ShellConfig,
}

impl ShellRuntime {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Make sure `session` has a shell that answered the readiness handshake.
    ///
    /// Returns immediately when a ready shell is attached. A call that
    /// arrives while another caller's handshake is in flight waits on that
    /// same handshake instead of spawning a second shell.
    pub fn ensure_started(&self, session: &SharedSession) -> Result<(), SessionError> {
        let (generation, ready_rx) = {
            let mut guard = lock(session);
            match guard.shell.state() {
                ShellState::Ready => return Ok(()),
                ShellState::Spawning => match guard.shell.handshake.as_mut() {
                    Some(handshake) => (handshake.generation, handshake.join()),
                    None => return Err(SessionError::ShellNotReady),
                },
                ShellState::Absent => {
                    let generation = guard.shell.allocate_generation();
                    let program = self.config.program();
                    let dir = self.config.working_dir();

                    let process =
                        match ShellProcess::spawn(&program, &dir, generation, Arc::downgrade(session)) {
                            Ok(process) => process,
                            Err(source) => {
                                warn!(session_id = %guard.id, program = %program, %source, "Failed to spawn shell");
                                guard.log.push_notice(&format!("Error: {}", source));
                                return Err(SessionError::Spawn { program, source });
                            }
                        };
                    guard.log.mark_started();

                    let marker = format!("{}{}__", HANDSHAKE_MARKER_PREFIX, Uuid::new_v4().simple());
                    // A fresh pipe has room for the marker line, so this write cannot block.
                    if let Err(err) = process.input().write_line(&format!("echo '{}'", marker)) {
                        warn!(session_id = %guard.id, %err, "Failed to write handshake");
                        guard.log.push_notice(&format!("Error: {}", err));
                        guard.shell.retire(generation);
                        process.terminate();
                        return Err(SessionError::ShellNotReady);
                    }

                    info!(session_id = %guard.id, program = %program, dir = %dir.display(), "Started shell");
                    (generation, guard.shell.attach(process, marker))
                }
            }
        };

        let timeout = self.config.handshake_timeout();
        let outcome = ready_rx.recv_timeout(timeout);

        let mut guard = lock(session);
        if guard.shell.is_ready(generation) {
            debug!(session_id = %guard.id, generation, "Shell ready");
            return Ok(());
        }
        match outcome {
            Err(RecvTimeoutError::Timeout) => {
                warn!(session_id = %guard.id, ?timeout, "Shell handshake timed out");
                if let Some(process) = guard.shell.detach(generation) {
                    process.terminate();
                }
                Err(SessionError::HandshakeTimeout(timeout))
            }
            // The shell went away or was replaced while we waited.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Err(SessionError::ShellNotReady),
        }
    }

    /// Run `raw` in the session's shell and return the log afterwards.
    ///
    /// The returned snapshot holds the command echo; its output shows up in
    /// later snapshots as the shell produces it. The write to the shell
    /// happens without the session lock, so a shell that stops reading its
    /// input only stalls this caller.
    pub fn execute(&self, session: &SharedSession, raw: &str) -> Result<Vec<String>, SessionError> {
        let normalized = command::normalize(raw);
        let (generation, input) = {
            let mut guard = lock(session);
            let Some(process) = guard.shell.ready_process() else {
                return Err(SessionError::ShellNotReady);
            };
            let target = (process.generation(), process.input());

            if command::is_clear(&normalized) {
                guard.log.clear();
                return Ok(guard.log.snapshot());
            }
            guard.log.push_command_echo(&normalized);
            target
        };

        let line = command::rewrite_remote_fetch(&normalized);
        let write = input.write_line(&line);

        let mut guard = lock(session);
        if let Err(err) = write {
            warn!(session_id = %guard.id, %err, "Failed to write command to shell");
            if let Some(process) = guard.shell.detach(generation) {
                guard.log.push_notice(&format!("Error: {}", err));
                process.terminate();
            }
            return Err(SessionError::ShellNotReady);
        }

        debug!(
            session_id = %guard.id,
            command = %normalized,
            remote_fetch = command::is_remote_fetch(&normalized),
            "Dispatched command"
        );
        Ok(guard.log.snapshot())
    }

    /// Terminate the session's shell, if any. Idempotent.
    pub fn terminate(&self, session: &SharedSession) {
        let process = lock(session).shell.take();
        if let Some(process) = process {
            process.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    fn sh_config() -> ShellConfig {
        ShellConfig {
            program: Some("/bin/sh".to_string()),
            working_dir: Some(std::env::temp_dir()),
            handshake_timeout_ms: 5000,
        }
    }

    fn new_session() -> SharedSession {
        Arc::new(Mutex::new(Session::new(
            "session_test".to_string(),
            Some("test".to_string()),
            None,
        )))
    }

    fn wait_for_log(session: &SharedSession, needle: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if lock(session).log.joined().contains(needle) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_handshake_marker_split_across_reads() {
        let mut handshake = Handshake {
            generation: 1,
            marker: "__shell_ready_abc__".to_string(),
            seen: String::new(),
            waiters: Vec::new(),
        };
        assert!(!handshake.observe("noise noise __shell_re"));
        assert!(handshake.observe("ady_abc__\n"));
    }

    #[test]
    fn test_execute_before_start_is_not_ready() {
        let runtime = ShellRuntime::new(sh_config());
        let session = new_session();
        let result = runtime.execute(&session, "echo hi");
        assert!(matches!(result, Err(SessionError::ShellNotReady)));
        assert!(lock(&session).log.is_empty());
    }

    #[test]
    fn test_ensure_started_then_echo() {
        let runtime = ShellRuntime::new(sh_config());
        let session = new_session();

        runtime.ensure_started(&session).unwrap();
        assert_eq!(lock(&session).shell.state(), ShellState::Ready);

        let logs = runtime.execute(&session, "echo hi").unwrap();
        assert!(logs.iter().any(|fragment| fragment.contains("$ echo hi\n")));
        assert!(wait_for_log(&session, "$ echo hi\nhi\n"));

        // The marker never reaches the visible log.
        assert!(!lock(&session).log.joined().contains(HANDSHAKE_MARKER_PREFIX));

        runtime.terminate(&session);
    }

    #[test]
    fn test_ensure_started_is_idempotent() {
        let runtime = ShellRuntime::new(sh_config());
        let session = new_session();
        runtime.ensure_started(&session).unwrap();
        let generation = lock(&session).shell.next_generation;
        runtime.ensure_started(&session).unwrap();
        assert_eq!(lock(&session).shell.next_generation, generation);
        runtime.terminate(&session);
    }

    #[test]
    fn test_clear_skips_shell() {
        let runtime = ShellRuntime::new(sh_config());
        let session = new_session();
        runtime.ensure_started(&session).unwrap();
        runtime.execute(&session, "echo one").unwrap();
        let logs = runtime.execute(&session, "  CLEAR \n").unwrap();
        assert_eq!(logs, vec![String::new()]);
        runtime.terminate(&session);
    }

    #[test]
    fn test_multiline_command_runs_as_one_line() {
        let runtime = ShellRuntime::new(sh_config());
        let session = new_session();
        runtime.ensure_started(&session).unwrap();
        runtime.execute(&session, "echo \\\n  joined \\\n  line").unwrap();
        assert!(wait_for_log(&session, "$ echo joined line\njoined line\n"));
        runtime.terminate(&session);
    }

    #[test]
    fn test_exit_records_notice_and_detaches() {
        let runtime = ShellRuntime::new(sh_config());
        let session = new_session();
        runtime.ensure_started(&session).unwrap();
        runtime.execute(&session, "exit").unwrap();
        assert!(wait_for_log(&session, "[Shell session ended]"));
        assert_eq!(lock(&session).shell.state(), ShellState::Absent);
        assert!(matches!(
            runtime.execute(&session, "echo again"),
            Err(SessionError::ShellNotReady)
        ));

        // A later start spawns a fresh shell.
        runtime.ensure_started(&session).unwrap();
        assert_eq!(lock(&session).shell.state(), ShellState::Ready);
        runtime.terminate(&session);
    }

    #[test]
    fn test_handshake_timeout_terminates_shell() {
        let runtime = ShellRuntime::new(ShellConfig {
            handshake_timeout_ms: 0,
            ..sh_config()
        });
        let session = new_session();

        let result = runtime.ensure_started(&session);
        assert!(matches!(result, Err(SessionError::HandshakeTimeout(_))));
        assert_eq!(lock(&session).shell.state(), ShellState::Absent);

        // A retry with a realistic budget succeeds.
        let runtime = ShellRuntime::new(sh_config());
        runtime.ensure_started(&session).unwrap();
        assert_eq!(lock(&session).shell.state(), ShellState::Ready);

        // The timed-out shell's exit never lands in the new shell's log.
        runtime.execute(&session, "echo alive").unwrap();
        assert!(wait_for_log(&session, "$ echo alive\nalive\n"));
        thread::sleep(Duration::from_millis(200));
        assert!(!lock(&session).log.joined().contains("Shell session ended"));
        assert_eq!(lock(&session).shell.state(), ShellState::Ready);
        runtime.terminate(&session);
    }

    #[test]
    fn test_terminated_shell_leaves_no_exit_notice() {
        let runtime = ShellRuntime::new(sh_config());
        let session = new_session();
        runtime.ensure_started(&session).unwrap();
        runtime.terminate(&session);
        thread::sleep(Duration::from_millis(300));
        assert!(!lock(&session).log.joined().contains("Shell session ended"));
    }

    #[test]
    fn test_stderr_is_logged_verbatim() {
        let runtime = ShellRuntime::new(sh_config());
        let session = new_session();
        runtime.ensure_started(&session).unwrap();
        runtime.execute(&session, "echo err-text 1>&2").unwrap();
        assert!(wait_for_log(&session, "err-text\n"));
        runtime.terminate(&session);
    }

    #[test]
    fn test_write_failure_detaches_shell() {
        let runtime = ShellRuntime::new(sh_config());
        let session = new_session();
        runtime.ensure_started(&session).unwrap();

        // The shell closes its own input but stays alive for a while.
        runtime.execute(&session, "exec 0<&-; sleep 3").unwrap();
        thread::sleep(Duration::from_millis(500));
        assert_eq!(lock(&session).shell.state(), ShellState::Ready);

        let result = runtime.execute(&session, "echo lost");
        assert!(matches!(result, Err(SessionError::ShellNotReady)));
        assert!(lock(&session).log.joined().contains("\n[Error: "));
        assert_eq!(lock(&session).shell.state(), ShellState::Absent);
    }

    #[test]
    fn test_blocked_write_does_not_hold_session() {
        let runtime = ShellRuntime::new(sh_config());
        let session = new_session();
        runtime.ensure_started(&session).unwrap();
        runtime.execute(&session, "sleep 2").unwrap();

        // Far more than a pipe buffer, written while the shell is not reading.
        let big = format!("echo {}", "x".repeat(200_000));
        let writer = {
            let runtime = runtime.clone();
            let session = Arc::clone(&session);
            thread::spawn(move || runtime.execute(&session, &big))
        };
        thread::sleep(Duration::from_millis(300));

        let started = Instant::now();
        let snapshot = lock(&session).log.snapshot();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!snapshot.is_empty());

        runtime.terminate(&session);
        let _ = writer.join().unwrap();
    }

    #[test]
    fn test_spawn_failure_is_logged() {
        let runtime = ShellRuntime::new(ShellConfig {
            program: Some("/nonexistent/shell".to_string()),
            working_dir: None,
            handshake_timeout_ms: 500,
        });
        let session = new_session();
        let result = runtime.ensure_started(&session);
        assert!(matches!(result, Err(SessionError::Spawn { .. })));
        assert!(lock(&session).log.joined().starts_with("\n[Error: "));
        assert_eq!(lock(&session).shell.state(), ShellState::Absent);
    }
}
