//! How the agent CLI is launched.
//!
//! The manager only decides *when* to spawn; an [`AgentBackend`] knows
//! *how*: whether a PTY can be opened at all, how to start the interactive
//! session, how to check the CLI is installed and how to build a one-shot
//! invocation for stateless mode.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use portable_pty::{native_pty_system, PtySize};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::pty::PtyProcess;
use super::SessionError;
use crate::config::{AgentConfig, AgentMode};

/// One read from an interactive process.
#[derive(Debug)]
pub enum ReadChunk {
    Data(Vec<u8>),
    Error(String),
}

/// A persistent agent process the manager writes to and reads from.
pub trait InteractiveProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Polls whether the process is still running.
    fn is_alive(&mut self) -> bool;

    fn write_all(&mut self, data: &[u8]) -> Result<(), SessionError>;

    /// Hands out the output channel. Returns `None` after the first call.
    fn take_output(&mut self) -> Option<mpsc::Receiver<ReadChunk>>;

    /// Terminates the process and releases its handles.
    fn close(&mut self) -> Result<(), SessionError>;
}

/// Spawning capability for the agent CLI.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Whether an interactive PTY session can be used on this host.
    fn interactive_available(&self) -> bool;

    /// Starts the agent on a PTY rooted at `cwd`.
    async fn spawn_interactive(
        &self,
        cwd: &Path,
    ) -> Result<Box<dyn InteractiveProcess>, SessionError>;

    /// Runs the version check. Returns the reported version on success.
    async fn probe(&self, cwd: &Path) -> Result<String, SessionError>;

    /// Builds a one-shot invocation for `prompt` with piped stdout and stderr.
    fn oneshot_command(&self, prompt: &str, cwd: &Path) -> Result<Command, SessionError>;
}

/// Backend that runs the configured CLI.
pub struct CliBackend {
    config: AgentConfig,
}

impl CliBackend {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Resolves the program against `PATH`.
    fn resolve_program(&self) -> Result<PathBuf, SessionError> {
        which::which(&self.config.program).map_err(|e| {
            tracing::debug!(program = %self.config.program, error = %e, "Agent CLI lookup failed");
            SessionError::ToolMissing(self.config.program.clone())
        })
    }
}

/// Checks that the host can allocate a pseudo-terminal.
fn pty_supported() -> bool {
    match native_pty_system().openpty(PtySize::default()) {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(error = %e, "PTY unavailable");
            false
        }
    }
}

#[async_trait]
impl AgentBackend for CliBackend {
    fn interactive_available(&self) -> bool {
        match self.config.mode {
            AgentMode::Interactive => true,
            AgentMode::Stateless => false,
            AgentMode::Auto => pty_supported(),
        }
    }

    async fn spawn_interactive(
        &self,
        cwd: &Path,
    ) -> Result<Box<dyn InteractiveProcess>, SessionError> {
        let program = self.resolve_program()?;
        let args = self.config.args.clone();
        let env = self.config.env.clone();
        let (cols, rows) = (self.config.cols, self.config.rows);
        let cwd = cwd.to_path_buf();

        let process = tokio::task::spawn_blocking(move || {
            PtyProcess::spawn(&program, &args, &cwd, cols, rows, &env)
        })
        .await
        .map_err(|e| SessionError::SpawnFailed(format!("spawn task failed: {e}")))??;

        Ok(Box::new(process))
    }

    async fn probe(&self, cwd: &Path) -> Result<String, SessionError> {
        let program = self.resolve_program()?;

        let output = Command::new(&program)
            .args(&self.config.probe_args)
            .envs(&self.config.env)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    SessionError::ToolMissing(self.config.program.clone())
                }
                _ => SessionError::SpawnFailed(e.to_string()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = if stderr.is_empty() {
                format!("{} exited with {}", self.config.program, output.status)
            } else {
                stderr
            };
            return Err(SessionError::ProbeFailed(reason));
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::info!(program = %program.display(), version = %version, "Agent CLI available");
        Ok(version)
    }

    fn oneshot_command(&self, prompt: &str, cwd: &Path) -> Result<Command, SessionError> {
        let program = self.resolve_program()?;

        let mut command = Command::new(program);
        command
            .args(&self.config.oneshot_args)
            .arg(prompt)
            .envs(&self.config.env)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }
}
