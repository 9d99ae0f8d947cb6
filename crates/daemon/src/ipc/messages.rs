//! IPC message types for CLI-daemon communication.
//!
//! Each message is one externally tagged JSON value on its own line, e.g.
//! `"Ping"` or `{"SendCommand":{"command":"run tests"}}`.

use protocol::{EventFrame, SessionSnapshot};
use serde::{Deserialize, Serialize};

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the session snapshot.
    Status,
    /// Start the agent session in the active project.
    Start,
    /// Stop the agent session.
    Stop,
    /// Deliver a command to the running session.
    SendCommand { command: String },
    /// Turn this connection into an event stream.
    Subscribe,
    /// Stop the session and exit the daemon.
    Shutdown,
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Session snapshot plus daemon counters.
    Status {
        session: SessionSnapshot,
        /// Daemon uptime in seconds.
        uptime_secs: u64,
        /// Number of live event subscribers.
        subscribers: usize,
    },
    /// The session is running.
    Started { pid: Option<u32> },
    /// The session is stopped.
    Stopped,
    /// The command was handed to the agent.
    CommandAccepted,
    /// The connection is now subscribed; `Event` lines follow.
    Subscribed { subscriber_id: String },
    /// One broadcast event.
    Event {
        event: String,
        data: serde_json::Value,
    },
    /// Acknowledgment that the daemon is exiting.
    ShuttingDown,
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

impl IpcResponse {
    pub fn error(message: impl Into<String>) -> Self {
        IpcResponse::Error {
            message: message.into(),
        }
    }
}

impl From<&EventFrame> for IpcResponse {
    fn from(frame: &EventFrame) -> Self {
        IpcResponse::Event {
            event: frame.event.clone(),
            data: frame.data.clone(),
        }
    }
}
