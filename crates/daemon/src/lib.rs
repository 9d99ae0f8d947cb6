//! # AgentRelay Daemon Library
//!
//! Supervises a coding agent CLI (`claude`) on the host and relays its
//! output to any number of subscribers.
//!
//! ## Overview
//!
//! - **Session Management**: start, stop and drive the agent either as a
//!   long-lived PTY process or as one process per command
//! - **Output Sanitizing**: strip terminal control sequences and decode
//!   UTF-8 across read boundaries
//! - **Event Broadcasting**: fan typed events out to subscribers, with a
//!   periodic heartbeat
//! - **Control Channel**: Unix socket IPC for the CLI subcommands
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Daemon Orchestrator                     │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌───────────────┐   ┌──────────────┐  │
//! │  │ IPC Server  │──▶│    Session    │──▶│   Session    │  │
//! │  │             │   │  Controller   │   │   Manager    │  │
//! │  └─────────────┘   └───────────────┘   └──────┬───────┘  │
//! │         ▲                                      │ events   │
//! │         │          ┌───────────────┐           ▼          │
//! │         └──────────│   Event Hub   │◀──────────┘          │
//! │        subscribers └───────────────┘◀── heartbeat         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agentrelay::{ipc::get_socket_path, Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let orchestrator = DaemonOrchestrator::new(config);
//!     orchestrator.start(&get_socket_path()).await?;
//!
//!     orchestrator.shutdown_token().cancelled().await;
//!     orchestrator.stop().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`sanitize`]: Terminal output cleanup
//! - [`broadcast`]: Event hub, subscribers and heartbeat
//! - [`session`]: Agent process supervision
//! - [`project`]: Active project lookup
//! - [`controller`]: Single-session control surface
//! - [`ipc`]: Control socket, client and pid file
//! - [`orchestrator`]: Main daemon coordinator

pub mod broadcast;
pub mod config;
pub mod controller;
pub mod ipc;
pub mod orchestrator;
pub mod project;
pub mod sanitize;
pub mod session;

#[cfg(test)]
mod testing;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use broadcast::{EventHub, EventSink, SubscriberId, SubscriberStats};

pub use session::{AgentBackend, CliBackend, SessionError, SessionManager, SessionTiming};

pub use project::{FixedProjectResolver, ProjectResolver, RecentProjectsResolver};

pub use controller::{ControllerError, SessionController};

pub use orchestrator::{DaemonOrchestrator, OrchestratorState};
