//! Spawning of shell processes and draining of their output.
//!
//! Each shell gets one reader thread per output pipe, a waiter thread that
//! reaps the child, and a pump thread that feeds everything through the
//! output filter into the owning session's log.

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::filter;
use crate::session::{lock, Session};

/// Which pipe a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

/// Events delivered to a shell's pump thread.
#[derive(Debug)]
enum ShellEvent {
    Output { stream: OutputStream, text: String },
    ReadFailed { stream: OutputStream, error: io::Error },
    Exited { code: Option<i32> },
}

/// Write side of a shell's stdin.
///
/// Cloned out of the session so a write that blocks on a full pipe only
/// holds this handle, never the session lock.
#[derive(Debug, Clone)]
pub(crate) struct ShellInput {
    stdin: Arc<Mutex<ChildStdin>>,
}

impl ShellInput {
    /// Write one line of input to the shell.
    pub(crate) fn write_line(&self, line: &str) -> io::Result<()> {
        let mut stdin = lock(&self.stdin);
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()
    }
}

/// A live shell process owned by one session.
#[derive(Debug)]
pub(crate) struct ShellProcess {
    pid: Pid,
    input: ShellInput,
    generation: u64,
}

impl ShellProcess {
    /// Spawn `program` in `working_dir` with piped stdio.
    ///
    /// Output is appended to `session`'s log until the process exits or the
    /// session is dropped.
    pub(crate) fn spawn(
        program: &str,
        working_dir: &Path,
        generation: u64,
        session: Weak<Mutex<Session>>,
    ) -> io::Result<Self> {
        let mut child = Command::new(program)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = Pid::from_raw(child.id() as i32);
        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::other("shell stdio was not captured"));
            }
        };

        let (event_tx, event_rx) = mpsc::channel();
        spawn_reader(stdout, OutputStream::Stdout, event_tx.clone());
        spawn_reader(stderr, OutputStream::Stderr, event_tx.clone());
        spawn_waiter(child, event_tx);

        thread::spawn(move || {
            for event in event_rx {
                let Some(shared) = session.upgrade() else {
                    break; // Session dropped
                };
                let mut session = lock(&shared);
                match event {
                    ShellEvent::Output { .. } if session.shell.is_retired(generation) => {}
                    ShellEvent::Output { stream, text } => {
                        if stream == OutputStream::Stdout {
                            session.shell.observe_output(generation, &text);
                        }
                        if let Some(cleaned) = filter::clean_output(&text) {
                            session.log.push_output(cleaned);
                        }
                    }
                    ShellEvent::ReadFailed { stream, error } => {
                        warn!(session_id = %session.id, ?stream, %error, "Shell output read failed");
                        if let Some(process) = session.shell.detach(generation) {
                            session.log.push_notice(&format!("Error: {}", error));
                            process.terminate();
                        }
                    }
                    ShellEvent::Exited { code } => {
                        debug!(session_id = %session.id, ?code, generation, "Shell exited");
                        // Shells we stopped ourselves leave no notice behind.
                        if session.shell.exited(generation) {
                            session.log.push_notice("Shell session ended");
                        }
                    }
                }
            }
        });

        debug!(pid = %pid, generation, program = %program, "Spawned shell");
        Ok(Self {
            pid,
            input: ShellInput {
                stdin: Arc::new(Mutex::new(stdin)),
            },
            generation,
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn input(&self) -> ShellInput {
        self.input.clone()
    }

    /// Ask the shell to exit with SIGTERM.
    ///
    /// Never escalates to SIGKILL. The waiter thread reaps the child.
    pub(crate) fn terminate(self) {
        match signal::kill(self.pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(pid = %self.pid, %err, "Failed to signal shell"),
        }
        debug!(pid = %self.pid, generation = self.generation, "Terminated shell");
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut reader: R,
    stream: OutputStream,
    events: Sender<ShellEvent>,
) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut decoder = Utf8Decoder::default();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break, // EOF
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if text.is_empty() {
                        continue;
                    }
                    if events.send(ShellEvent::Output { stream, text }).is_err() {
                        break; // Pump gone
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    let _ = events.send(ShellEvent::ReadFailed { stream, error });
                    break;
                }
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() {
            let _ = events.send(ShellEvent::Output { stream, text: rest });
        }
    });
}

fn spawn_waiter(mut child: Child, events: Sender<ShellEvent>) {
    thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => status.code(),
            Err(err) => {
                warn!(%err, "Failed to wait for shell");
                None
            }
        };
        let _ = events.send(ShellEvent::Exited { code });
    });
}

/// Decodes UTF-8 across read boundaries.
///
/// A multi-byte character split between two reads is held back until the
/// rest arrives. Invalid sequences are replaced with U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete character at the end; wait for more.
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
