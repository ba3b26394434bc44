//! Configuration management for feedback-shell.
//!
//! Handles loading of session lifetimes, shell selection and daemon settings.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Session lifetime settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Interactive shell settings
    #[serde(default)]
    pub shell: ShellConfig,

    /// Daemon and presentation settings
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from disk, or return default if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from an explicit path, or return default if not found
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate();

        Ok(config)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Clamp every section to usable values
    pub fn validate(&mut self) {
        self.session.validate();
        self.shell.validate();
        self.server.validate();
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not find config directory")?;

        Ok(config_dir.join("feedback-shell").join("config.json"))
    }
}

/// Session lifetime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Age after which the reaper expires an unresolved session
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,

    /// How often the reaper sweeps the store
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,

    /// Default wait for `OpenSession` when the caller gives none
    #[serde(default = "default_feedback_timeout_secs")]
    pub feedback_timeout_secs: u64,
}

fn default_expiry_secs() -> u64 {
    5 * 60
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_feedback_timeout_secs() -> u64 {
    5 * 60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_expiry_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            feedback_timeout_secs: default_feedback_timeout_secs(),
        }
    }
}

impl SessionConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn feedback_timeout(&self) -> Duration {
        Duration::from_secs(self.feedback_timeout_secs)
    }

    fn validate(&mut self) {
        self.expiry_secs = self.expiry_secs.max(1);
        self.reaper_interval_secs = self.reaper_interval_secs.max(1);
        self.feedback_timeout_secs = self.feedback_timeout_secs.max(1);
    }
}

/// Interactive shell configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Shell program; platform default when unset
    #[serde(default)]
    pub program: Option<String>,

    /// Working directory tried before the home directory
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Bound on the readiness handshake after spawning
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    2000
}

/// Smallest handshake wait that still gives a shell time to start.
const MIN_HANDSHAKE_TIMEOUT_MS: u64 = 100;

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: None,
            working_dir: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ShellConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Resolve the shell program to spawn.
    pub fn program(&self) -> String {
        if let Some(program) = &self.program {
            return program.clone();
        }
        if Path::new("/bin/bash").exists() {
            "/bin/bash".to_string()
        } else {
            "/bin/sh".to_string()
        }
    }

    /// Resolve the directory the shell starts in.
    ///
    /// Tries the configured directory, then the user's home, then the
    /// process working directory.
    pub fn working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .filter(|dir| dir.is_dir())
            .or_else(|| dirs::home_dir().filter(|dir| dir.is_dir()))
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    fn validate(&mut self) {
        self.handshake_timeout_ms = self.handshake_timeout_ms.max(MIN_HANDSHAKE_TIMEOUT_MS);
    }
}

/// Daemon and presentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the browser form is served on
    #[serde(default = "default_gui_port")]
    pub gui_port: u16,

    /// Unix socket the daemon listens on
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// How long the daemon waits to read a request from a client
    #[serde(default = "default_command_accept_timeout_secs")]
    pub command_accept_timeout_secs: u64,
}

fn default_gui_port() -> u16 {
    3501
}

fn default_command_accept_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            gui_port: default_gui_port(),
            socket_path: None,
            command_accept_timeout_secs: default_command_accept_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn command_accept_timeout(&self) -> Duration {
        Duration::from_secs(self.command_accept_timeout_secs)
    }

    /// URL of the feedback form for a session.
    pub fn gui_url(&self, session_id: &str) -> String {
        format!("http://localhost:{}/gui?session={}", self.gui_port, session_id)
    }

    /// Socket path, defaulting to a per-user path under /tmp.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(|| {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/feedback-shell-{}.sock", uid))
        })
    }

    fn validate(&mut self) {
        self.command_accept_timeout_secs = self.command_accept_timeout_secs.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.expiry(), Duration::from_secs(300));
        assert_eq!(config.session.reaper_interval(), Duration::from_secs(60));
        assert_eq!(config.shell.handshake_timeout(), Duration::from_millis(2000));
        assert_eq!(config.server.gui_port, 3501);
        assert!(config.shell.program.is_none());
    }

    #[test]
    fn test_validate_clamps_zero_values() {
        let mut config = Config::default();
        config.session.reaper_interval_secs = 0;
        config.session.expiry_secs = 0;
        config.shell.handshake_timeout_ms = 5;
        config.validate();
        assert_eq!(config.session.reaper_interval_secs, 1);
        assert_eq!(config.session.expiry_secs, 1);
        assert_eq!(config.shell.handshake_timeout_ms, MIN_HANDSHAKE_TIMEOUT_MS);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"session":{"expiry_secs":900}}"#).unwrap();
        assert_eq!(config.session.expiry_secs, 900);
        assert_eq!(config.session.reaper_interval_secs, 60);
        assert_eq!(config.shell.handshake_timeout_ms, 2000);
    }

    #[test]
    fn test_missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.session.expiry_secs, 300);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.shell.program = Some("/bin/sh".to_string());
        config.server.gui_port = 4000;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.shell.program.as_deref(), Some("/bin/sh"));
        assert_eq!(loaded.server.gui_port, 4000);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_working_dir_falls_back_when_override_missing() {
        let shell = ShellConfig {
            working_dir: Some(PathBuf::from("/definitely/not/here")),
            ..Default::default()
        };
        let dir = shell.working_dir();
        assert_ne!(dir, PathBuf::from("/definitely/not/here"));
        assert!(dir.is_dir());
    }

    #[test]
    fn test_gui_url_contains_session() {
        let server = ServerConfig::default();
        assert_eq!(
            server.gui_url("session_1_abc"),
            "http://localhost:3501/gui?session=session_1_abc"
        );
    }
}
