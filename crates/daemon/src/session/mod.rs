//! Agent session supervision.
//!
//! A [`SessionManager`] owns one agent session rooted at a project
//! directory: its state machine, the interactive process (if any) and the
//! background loop that pumps PTY output into the event sink. How the agent
//! is actually spawned is behind the [`AgentBackend`] trait.

pub mod backend;
pub mod manager;
pub mod oneshot;
pub mod pty;

use thiserror::Error;

pub use backend::{AgentBackend, CliBackend, InteractiveProcess, ReadChunk};
pub use manager::{SessionManager, SessionTiming};
pub use pty::PtyProcess;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The agent CLI is not installed or not on `PATH`.
    #[error("{0} command not found, make sure the agent CLI is installed")]
    ToolMissing(String),

    /// The OS refused to create the process or pseudo-terminal.
    #[error("failed to spawn agent: {0}")]
    SpawnFailed(String),

    /// The version check ran but did not succeed.
    #[error("agent probe failed: {0}")]
    ProbeFailed(String),

    /// A command was sent while the session was not running.
    #[error("agent session is not running")]
    NotRunning,

    /// Failed to write to the agent's input.
    #[error("failed to write to agent: {0}")]
    WriteFailed(String),

    /// Failed to read the agent's output.
    #[error("failed to read from agent: {0}")]
    ReadFailed(String),

    /// Failed to release the process handle.
    #[error("failed to close agent: {0}")]
    CloseFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
