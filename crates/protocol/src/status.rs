//! Session status types returned by status queries.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the supervised agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
}

impl SessionState {
    /// Returns the lowercase name used on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionState::Stopped => "stopped",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How commands reach the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One persistent agent process attached to a pseudo-terminal.
    Interactive,
    /// A fresh one-shot agent invocation per command.
    Stateless,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Interactive => f.write_str("interactive"),
            ExecutionMode::Stateless => f.write_str("stateless"),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub mode: Option<ExecutionMode>,
    /// Project directory the session is rooted at.
    pub project: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_snapshot_is_stopped() {
        let snapshot = SessionSnapshot::default();
        assert_eq!(snapshot.state, SessionState::Stopped);
        assert!(snapshot.pid.is_none());
        assert!(snapshot.started_at.is_none());
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = SessionSnapshot {
            state: SessionState::Error,
            pid: None,
            started_at: None,
            error_message: Some("claude command not found".to_string()),
            mode: Some(ExecutionMode::Stateless),
            project: Some(PathBuf::from("/work/app")),
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["state"], json!("error"));
        assert_eq!(value["mode"], json!("stateless"));
        assert_eq!(value["error_message"], json!("claude command not found"));

        let decoded: SessionSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Running.to_string(), "running");
        assert_eq!(ExecutionMode::Interactive.to_string(), "interactive");
    }
}
