//! Event definitions broadcast by the daemon.
//!
//! Every broadcast is a named event plus a JSON payload. The names and
//! payload shapes are fixed so that any transport (IPC socket, SSE bridge,
//! websocket) can forward them without knowing what they mean:
//!
//! | event           | payload                                                        |
//! |-----------------|----------------------------------------------------------------|
//! | `claude_status` | `{"status": "starting" \| "running" \| "stopped" \| "error", ...}` |
//! | `claude_output` | `{"event_type": "text" \| "error" \| "complete", "content", "timestamp", "exit_code"?}` |
//! | `command_sent`  | `{"command": "..."}`                                           |
//! | `heartbeat`     | `{"timestamp": "<RFC 3339>"}`                                  |

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Names of the events the daemon emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Session state transitions.
    ClaudeStatus,
    /// One chunk or line of agent output.
    ClaudeOutput,
    /// A command was accepted for delivery to the agent.
    CommandSent,
    /// Periodic liveness signal.
    Heartbeat,
}

impl EventType {
    /// Returns the wire name of the event.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventType::ClaudeStatus => "claude_status",
            EventType::ClaudeOutput => "claude_output",
            EventType::CommandSent => "command_sent",
            EventType::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "claude_status" => Ok(EventType::ClaudeStatus),
            "claude_output" => Ok(EventType::ClaudeOutput),
            "command_sent" => Ok(EventType::CommandSent),
            "heartbeat" => Ok(EventType::Heartbeat),
            other => Err(ProtocolError::UnknownEventType(other.to_string())),
        }
    }
}

/// Payload of a `claude_status` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusPayload {
    Starting,
    /// `pid` is absent when the platform could not report one.
    Running {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Stopped,
    Error { message: String },
}

/// Kind of an [`OutputEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Regular output (PTY text or one-shot stdout).
    Text,
    /// One-shot stderr, or a failure of the one-shot execution itself.
    Error,
    /// A one-shot execution finished.
    Complete,
}

/// One immutable unit of agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub event_type: OutputKind,
    /// Sanitized text. Empty for `complete`.
    pub content: String,
    /// Capture time in Unix epoch milliseconds.
    pub timestamp: i64,
    /// Exit code of the one-shot process, only set on `complete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl OutputEvent {
    /// Creates a `text` event stamped with the current time.
    pub fn text(content: impl Into<String>) -> Self {
        Self::new(OutputKind::Text, content.into(), None)
    }

    /// Creates an `error` event stamped with the current time.
    pub fn error(content: impl Into<String>) -> Self {
        Self::new(OutputKind::Error, content.into(), None)
    }

    /// Creates a `complete` event carrying the process exit code.
    pub fn complete(exit_code: Option<i32>) -> Self {
        Self::new(OutputKind::Complete, String::new(), exit_code)
    }

    fn new(event_type: OutputKind, content: String, exit_code: Option<i32>) -> Self {
        Self {
            event_type,
            content,
            timestamp: Utc::now().timestamp_millis(),
            exit_code,
        }
    }
}

/// Payload of a `command_sent` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSent {
    pub command: String,
}

/// Payload of a `heartbeat` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// RFC 3339 time the heartbeat was produced.
    pub timestamp: String,
}

impl Heartbeat {
    /// Creates a heartbeat stamped with the current time.
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// A typed event, before it is turned into a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Status(StatusPayload),
    Output(OutputEvent),
    CommandSent(CommandSent),
    Heartbeat(Heartbeat),
}

impl Event {
    /// Shorthand for a `command_sent` event.
    pub fn command_sent(command: impl Into<String>) -> Self {
        Event::CommandSent(CommandSent {
            command: command.into(),
        })
    }

    /// Returns the wire name this event is broadcast under.
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Status(_) => EventType::ClaudeStatus,
            Event::Output(_) => EventType::ClaudeOutput,
            Event::CommandSent(_) => EventType::CommandSent,
            Event::Heartbeat(_) => EventType::Heartbeat,
        }
    }

    /// Serializes the payload into a frame.
    pub fn to_frame(&self) -> Result<EventFrame> {
        let data = match self {
            Event::Status(payload) => serde_json::to_value(payload),
            Event::Output(payload) => serde_json::to_value(payload),
            Event::CommandSent(payload) => serde_json::to_value(payload),
            Event::Heartbeat(payload) => serde_json::to_value(payload),
        }
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        Ok(EventFrame::new(self.event_type().as_str(), data))
    }
}

impl From<StatusPayload> for Event {
    fn from(payload: StatusPayload) -> Self {
        Event::Status(payload)
    }
}

impl From<OutputEvent> for Event {
    fn from(payload: OutputEvent) -> Self {
        Event::Output(payload)
    }
}

/// A serialized broadcast: the event name and its JSON payload.
///
/// Frames are built once per broadcast and shared by every subscriber.
/// The event name is free-form so collaborators can publish their own
/// event types through the same hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    pub data: serde_json::Value,
}

impl EventFrame {
    /// Creates a frame from a name and a payload.
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Decodes the frame back into a typed event.
    ///
    /// Fails with [`ProtocolError::UnknownEventType`] for event names that
    /// were published by collaborators rather than the daemon.
    pub fn decode(&self) -> Result<Event> {
        let event_type: EventType = self.event.parse()?;
        let data = self.data.clone();
        let event = match event_type {
            EventType::ClaudeStatus => Event::Status(serde_json::from_value(data)?),
            EventType::ClaudeOutput => Event::Output(serde_json::from_value(data)?),
            EventType::CommandSent => Event::CommandSent(serde_json::from_value(data)?),
            EventType::Heartbeat => Event::Heartbeat(serde_json::from_value(data)?),
        };
        Ok(event)
    }
}
