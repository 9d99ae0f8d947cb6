//! Configuration management for the AgentRelay daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/agentrelay/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("agent program must not be empty")]
    EmptyProgram,

    #[error("terminal size must be at least 1x1, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("heartbeat_interval_secs must be between 1 and 3600, got {0}")]
    InvalidHeartbeatInterval(u64),

    #[error("subscriber_capacity must be between 1 and 65536, got {0}")]
    InvalidSubscriberCapacity(usize),

    #[error("{name} must be between 1 and 60000 milliseconds, got {value}")]
    InvalidBackoff { name: &'static str, value: u64 },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the AgentRelay daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// How the agent CLI is launched.
    pub agent: AgentConfig,

    /// Event relay tuning.
    pub relay: RelayConfig,

    /// Active project lookup.
    pub project: ProjectConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon state (pid file, recent projects list).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Execution strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Interactive when a pseudo-terminal can be opened, stateless otherwise.
    #[default]
    Auto,
    /// Always run the agent on a pseudo-terminal.
    Interactive,
    /// Always run one process per command.
    Stateless,
}

/// Agent CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Program name or path of the agent CLI.
    pub program: String,

    /// Extra arguments for the interactive session.
    pub args: Vec<String>,

    /// Arguments of the availability check in stateless mode.
    pub probe_args: Vec<String>,

    /// Arguments placed before the prompt in stateless mode.
    pub oneshot_args: Vec<String>,

    pub mode: AgentMode,

    /// Terminal width of the interactive session.
    pub cols: u16,

    /// Terminal height of the interactive session.
    pub rows: u16,

    /// Additional environment variables for the agent.
    pub env: BTreeMap<String, String>,
}

/// Event relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Seconds between heartbeat events.
    pub heartbeat_interval_secs: u64,

    /// Queue depth of each channel subscriber.
    pub subscriber_capacity: usize,

    /// Wait for PTY output before polling liveness again.
    pub read_backoff_ms: u64,

    /// Pause after a PTY read error.
    pub error_backoff_ms: u64,
}

/// Project lookup configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProjectConfig {
    /// Fixed project directory. When unset, the most recent entry of the
    /// recent-projects list in the data directory is used.
    pub directory: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: Vec::new(),
            probe_args: vec!["--version".to_string()],
            oneshot_args: vec!["-p".to_string()],
            mode: AgentMode::Auto,
            cols: 120,
            rows: 40,
            env: BTreeMap::new(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            subscriber_capacity: 256,
            read_backoff_ms: 100,
            error_backoff_ms: 500,
        }
    }
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentrelay")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentrelay")
}

/// Returns a non-empty environment variable.
fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - AGENTRELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - AGENTRELAY_AGENT_PROGRAM: Override the agent CLI program
    /// - AGENTRELAY_PROJECT_DIR: Use a fixed project directory
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = non_empty_env("AGENTRELAY_LOG_LEVEL") {
            tracing::info!(log_level = %level, "Overriding log_level from environment");
            self.daemon.log_level = level;
        }

        if let Some(program) = non_empty_env("AGENTRELAY_AGENT_PROGRAM") {
            tracing::info!(program = %program, "Overriding agent program from environment");
            self.agent.program = program;
        }

        if let Some(dir) = non_empty_env("AGENTRELAY_PROJECT_DIR") {
            tracing::info!(directory = %dir, "Overriding project directory from environment");
            self.project.directory = Some(PathBuf::from(dir));
        }
    }

    /// Validate the configuration values.
    ///
    /// The agent program is not looked up here: a missing CLI is reported
    /// when a session starts, not when the daemon boots.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.program.trim().is_empty() {
            return Err(ConfigError::EmptyProgram);
        }

        if self.agent.cols == 0 || self.agent.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.agent.cols,
                rows: self.agent.rows,
            });
        }

        let interval = self.relay.heartbeat_interval_secs;
        if !(1..=3600).contains(&interval) {
            return Err(ConfigError::InvalidHeartbeatInterval(interval));
        }

        let capacity = self.relay.subscriber_capacity;
        if !(1..=65536).contains(&capacity) {
            return Err(ConfigError::InvalidSubscriberCapacity(capacity));
        }

        for (name, value) in [
            ("read_backoff_ms", self.relay.read_backoff_ms),
            ("error_backoff_ms", self.relay.error_backoff_ms),
        ] {
            if !(1..=60_000).contains(&value) {
                return Err(ConfigError::InvalidBackoff { name, value });
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
