//! feedback-shell: command-line client for the feedback-shell daemon.
//!
//! Usage:
//!   feedback-shell open [--prompt P] [--title T] [--timeout SECS]
//!   feedback-shell create [--prompt P] [--title T]
//!   feedback-shell show <id> | list | shell <id> | logs <id>
//!   feedback-shell exec <id> <command...>
//!   feedback-shell submit <id> <text...>
//!   feedback-shell ping

use std::time::Duration;

use anyhow::{Context, Result};

use feedback_shell::config::Config;
use feedback_shell::daemon_client::DaemonClient;
use feedback_shell::session::Submission;

const USAGE: &str = "\
feedback-shell: collect feedback through a browser form with a live shell

Usage:
  feedback-shell open [--prompt P] [--title T] [--timeout SECS]
                                     Open a session and wait for feedback (JSON on stdout)
  feedback-shell create [--prompt P] [--title T]
                                     Create a session without waiting on it
  feedback-shell show <id>           Show a session
  feedback-shell list                List live sessions
  feedback-shell shell <id>          Start the session's shell
  feedback-shell exec <id> <cmd...>  Run a command in the session's shell
  feedback-shell logs <id>           Print the session's terminal log
  feedback-shell submit <id> <text...>
                                     Submit feedback for a session
  feedback-shell ping                Check the daemon is alive";

/// `--prompt`, `--title` and `--timeout` options.
#[derive(Debug, Default, PartialEq)]
struct OpenOptions {
    prompt: Option<String>,
    title: Option<String>,
    timeout: Option<Duration>,
}

fn parse_open_options(args: &[String]) -> Result<OpenOptions> {
    let mut options = OpenOptions::default();
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let mut value = || {
            iter.next()
                .cloned()
                .with_context(|| format!("Missing value for {}", flag))
        };
        match flag.as_str() {
            "--prompt" => options.prompt = Some(value()?),
            "--title" => options.title = Some(value()?),
            "--timeout" => {
                let secs: u64 = value()?
                    .parse()
                    .with_context(|| format!("Invalid timeout for {}", flag))?;
                options.timeout = Some(Duration::from_secs(secs));
            }
            other => anyhow::bail!("Unknown option: {}", other),
        }
    }
    Ok(options)
}

fn session_arg(args: &[String]) -> Result<&str> {
    args.first()
        .map(String::as_str)
        .context("Missing session id")
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };
    let rest = &args[1..];

    if matches!(command.as_str(), "--help" | "-h" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load().context("Failed to load configuration")?;
    let client = DaemonClient::connect(&config).context("Failed to reach daemon")?;

    match command.as_str() {
        "open" => {
            let options = parse_open_options(rest)?;
            let result = client.open_session(
                options.prompt.as_deref(),
                options.title.as_deref(),
                options.timeout,
            )?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        "create" => {
            let options = parse_open_options(rest)?;
            let (session_id, url) =
                client.create_session(options.prompt.as_deref(), options.title.as_deref())?;
            println!("{}\n{}", session_id, url);
        }
        "show" => {
            let view = client.get_session(session_arg(rest)?)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        "list" => {
            let sessions = client.list_sessions()?;
            if sessions.is_empty() {
                println!("No active sessions");
            }
            for session in sessions {
                println!(
                    "{}  shell={:?}  logs={}  {}",
                    session.session_id,
                    session.shell,
                    session.log_len,
                    session.title.as_deref().unwrap_or("")
                );
            }
        }
        "shell" => {
            let session_id = session_arg(rest)?;
            client.ensure_shell(session_id)?;
            println!("Shell ready for {}", session_id);
        }
        "exec" => {
            let session_id = session_arg(rest)?;
            let command = rest[1..].join(" ");
            if command.trim().is_empty() {
                anyhow::bail!("Missing command");
            }
            let logs = client.execute_command(session_id, &command)?;
            print!("{}", logs.concat());
        }
        "logs" => {
            let logs = client.get_logs(session_arg(rest)?)?;
            print!("{}", logs.concat());
        }
        "submit" => {
            let session_id = session_arg(rest)?;
            client.submit_session(session_id, Submission::text(rest[1..].join(" ")))?;
            println!("Submitted {}", session_id);
        }
        "ping" => {
            client.ping()?;
            println!("pong");
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(1);
        }
    }

    Ok(())
}
