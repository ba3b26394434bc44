//! feedback-shell-daemon: Background process that owns feedback sessions.
//!
//! Sessions, their shells and the expiry reaper live here, so clients can
//! come and go without losing them.
//!
//! Usage:
//!   feedback-shell-daemon          # Run daemon (normally started by the client)
//!   feedback-shell-daemon --status # Show live sessions
//!   feedback-shell-daemon --stop   # Graceful shutdown

use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use feedback_shell::config::Config;
use feedback_shell::coordinator::SessionCoordinator;
use feedback_shell::daemon::protocol::{framing, Request, Response};
use feedback_shell::daemon::RequestHandler;
use feedback_shell::error::ErrorKind;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = Config::load().context("Failed to load configuration")?;

    // Handle command-line flags
    if args.len() > 1 {
        match args[1].as_str() {
            "--status" => return show_status(&config),
            "--stop" => return stop_daemon(&config),
            "--help" | "-h" => {
                println!("feedback-shell-daemon: Background process for feedback sessions");
                println!();
                println!("Usage:");
                println!("  feedback-shell-daemon          Run daemon (normally started by the client)");
                println!("  feedback-shell-daemon --status Show live sessions");
                println!("  feedback-shell-daemon --stop   Graceful shutdown");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown argument: {}", args[1]);
                std::process::exit(1);
            }
        }
    }

    init_tracing();
    run_daemon(config)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn send(sock_path: &Path, request: &Request) -> Result<Response> {
    let stream = UnixStream::connect(sock_path).context("Daemon not running")?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let mut writer = BufWriter::new(&stream);
    framing::write_message(&mut writer, request)?;
    drop(writer);

    let mut reader = BufReader::new(&stream);
    Ok(framing::read_message(&mut reader)?)
}

fn show_status(config: &Config) -> Result<()> {
    let sock_path = config.server.socket_path();

    match send(&sock_path, &Request::ListSessions)? {
        Response::SessionList { sessions } => {
            if sessions.is_empty() {
                println!("Daemon running, no active sessions");
            } else {
                println!("Daemon running with {} session(s):", sessions.len());
                for session in sessions {
                    println!(
                        "  {} [{}] shell={:?} logs={} {}",
                        session.session_id,
                        session.created_at.format("%H:%M:%S"),
                        session.shell,
                        session.log_len,
                        session.title.as_deref().unwrap_or("")
                    );
                }
            }
        }
        Response::Error { message, .. } => {
            eprintln!("Error: {}", message);
        }
        _ => {
            eprintln!("Unexpected response");
        }
    }

    Ok(())
}

fn stop_daemon(config: &Config) -> Result<()> {
    let sock_path = config.server.socket_path();

    if UnixStream::connect(&sock_path).is_err() {
        println!("Daemon not running");
        return Ok(());
    }

    match send(&sock_path, &Request::Shutdown) {
        Ok(Response::ShuttingDown) => println!("Daemon shutting down"),
        Ok(Response::Error { message, .. }) => eprintln!("Error: {}", message),
        Ok(_) => eprintln!("Unexpected response"),
        Err(_) => println!("Daemon shutting down"),
    }

    Ok(())
}

fn run_daemon(config: Config) -> Result<()> {
    let sock_path = config.server.socket_path();

    // Remove stale socket if it exists
    if sock_path.exists() {
        // Check if there's already a daemon running
        if UnixStream::connect(&sock_path).is_ok() {
            error!(socket = %sock_path.display(), "Daemon already running");
            std::process::exit(1);
        }
        // Stale socket, remove it
        fs::remove_file(&sock_path)
            .with_context(|| format!("Failed to remove stale socket: {}", sock_path.display()))?;
    }

    let listener = UnixListener::bind(&sock_path).context("Failed to bind socket")?;
    listener
        .set_nonblocking(true)
        .context("Failed to set non-blocking")?;

    let accept_timeout = config.server.command_accept_timeout();
    let shutdown = Arc::new(AtomicBool::new(false));
    let coordinator = Arc::new(SessionCoordinator::new(config));
    let handler = RequestHandler::new(Arc::clone(&coordinator), Arc::clone(&shutdown));

    info!(socket = %sock_path.display(), "feedback-shell-daemon started");

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let handler = handler.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_client(&handler, stream, accept_timeout) {
                        warn!(error = %e, "Client error");
                    }
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                // No pending connections
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                warn!(error = %e, "Accept error");
            }
        }
    }

    // Cleanup
    coordinator.shutdown();
    fs::remove_file(&sock_path).ok();
    info!("feedback-shell-daemon stopped");

    Ok(())
}

fn handle_client(handler: &RequestHandler, stream: UnixStream, read_timeout: Duration) -> Result<()> {
    // Listener is non-blocking, but connections should block
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(read_timeout))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let mut reader = BufReader::new(&stream);
    let request: Request = framing::read_message(&mut reader)?;

    // Process request with panic catching for robustness
    let response = panic::catch_unwind(panic::AssertUnwindSafe(|| handler.handle(request)))
        .unwrap_or_else(|e| {
            let msg = if let Some(s) = e.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = e.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!(panic = %msg, "Request handler panicked");
            Response::error(ErrorKind::Internal, format!("Internal error: {}", msg))
        });

    let mut writer = BufWriter::new(&stream);
    framing::write_message(&mut writer, &response)?;

    Ok(())
}
