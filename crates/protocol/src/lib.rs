//! # AgentRelay Protocol Library
//!
//! Wire-level types shared between the AgentRelay daemon and anything that
//! talks to it.
//!
//! ## Overview
//!
//! - **Events**: the names and JSON payloads of everything the daemon
//!   broadcasts (`claude_status`, `claude_output`, `command_sent`,
//!   `heartbeat`), and the [`EventFrame`] unit subscribers receive
//! - **Status**: the session state machine values and the
//!   [`SessionSnapshot`] returned by status queries
//! - **Errors**: encoding and decoding failures
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Event, OutputEvent, StatusPayload};
//!
//! let frame = Event::Status(StatusPayload::Running { pid: Some(4242) })
//!     .to_frame()
//!     .unwrap();
//! assert_eq!(frame.event, "claude_status");
//!
//! let output = Event::from(OutputEvent::text("hello")).to_frame().unwrap();
//! assert_eq!(output.data["content"], "hello");
//! ```

pub mod error;
pub mod events;
pub mod status;

pub use error::{ProtocolError, Result};
pub use events::{
    CommandSent, Event, EventFrame, EventType, Heartbeat, OutputEvent, OutputKind, StatusPayload,
};
pub use status::{ExecutionMode, SessionSnapshot, SessionState};
