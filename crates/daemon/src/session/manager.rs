//! Session state machine and output pump.
//!
//! `Stopped -> Starting -> Running -> {Stopped, Error}`. Every transition is
//! emitted while the state lock is held, so a status query never observes a
//! state whose event has not been emitted yet. `start` and `stop` are
//! additionally serialized by a lifecycle lock so concurrent calls cannot
//! interleave their transitions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use protocol::{Event, ExecutionMode, OutputEvent, SessionSnapshot, SessionState, StatusPayload};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::backend::{AgentBackend, InteractiveProcess, ReadChunk};
use super::oneshot::run_oneshot;
use super::SessionError;
use crate::broadcast::EventSink;
use crate::config::RelayConfig;
use crate::sanitize::OutputDecoder;

/// Pid reported for stateless sessions, which have no persistent process.
pub const STATELESS_PID: u32 = 1;

/// Longest command prefix written to the log.
const COMMAND_PREVIEW_LEN: usize = 50;

type ProcessHandle = Arc<Mutex<Box<dyn InteractiveProcess>>>;

/// Read loop pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// How long to wait for output before polling liveness again.
    pub read_backoff: Duration,
    /// Pause after a read error.
    pub error_backoff: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            read_backoff: Duration::from_millis(100),
            error_backoff: Duration::from_millis(500),
        }
    }
}

impl From<&RelayConfig> for SessionTiming {
    fn from(config: &RelayConfig) -> Self {
        Self {
            read_backoff: config.read_backoff(),
            error_backoff: config.error_backoff(),
        }
    }
}

struct ReadTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

struct SessionInner {
    state: SessionState,
    mode: Option<ExecutionMode>,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    process: Option<ProcessHandle>,
    read_task: Option<ReadTask>,
    /// Cancels in-flight one-shot executions. Cancelled by `stop`, which
    /// also closes the session to new commands; replaced on every start.
    oneshot_cancel: CancellationToken,
    /// Bumped on every start so a stale read loop cannot touch a newer run.
    generation: u64,
}

enum Launched {
    Interactive {
        process: Box<dyn InteractiveProcess>,
        output: mpsc::Receiver<ReadChunk>,
        pid: Option<u32>,
    },
    Stateless,
}

/// Supervises one agent session rooted at a project directory.
pub struct SessionManager {
    project: PathBuf,
    backend: Arc<dyn AgentBackend>,
    sink: Arc<dyn EventSink>,
    timing: SessionTiming,
    lifecycle: Mutex<()>,
    inner: Arc<Mutex<SessionInner>>,
    oneshots: TaskTracker,
}

impl SessionManager {
    pub fn new(
        project: PathBuf,
        backend: Arc<dyn AgentBackend>,
        sink: Arc<dyn EventSink>,
        timing: SessionTiming,
    ) -> Self {
        Self {
            project,
            backend,
            sink,
            timing,
            lifecycle: Mutex::new(()),
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Stopped,
                mode: None,
                pid: None,
                started_at: None,
                last_error: None,
                process: None,
                read_task: None,
                oneshot_cancel: CancellationToken::new(),
                generation: 0,
            })),
            oneshots: TaskTracker::new(),
        }
    }

    /// Project directory the session runs in.
    pub fn project(&self) -> &Path {
        &self.project
    }

    /// Starts the session. Succeeds immediately if it is already running.
    pub async fn start(&self) -> Result<(), SessionError> {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Running {
                tracing::debug!(project = %self.project.display(), "Agent session already running");
                return Ok(());
            }
            inner.state = SessionState::Starting;
            inner.generation += 1;
            inner.oneshot_cancel = CancellationToken::new();
            self.sink.emit(StatusPayload::Starting.into()).await;
        }

        tracing::info!(project = %self.project.display(), "Starting agent session");
        let launched = self.launch().await;

        let mut inner = self.inner.lock().await;
        match launched {
            Ok(launched) => {
                let (mode, pid) = match launched {
                    Launched::Interactive {
                        process,
                        output,
                        pid,
                    } => {
                        let process: ProcessHandle = Arc::new(Mutex::new(process));
                        let task = self.spawn_read_loop(Arc::clone(&process), output, inner.generation);
                        inner.process = Some(process);
                        inner.read_task = Some(task);
                        (ExecutionMode::Interactive, pid)
                    }
                    Launched::Stateless => (ExecutionMode::Stateless, Some(STATELESS_PID)),
                };

                inner.mode = Some(mode);
                inner.pid = pid;
                inner.started_at = Some(Utc::now());
                inner.last_error = None;
                inner.state = SessionState::Running;
                self.sink.emit(StatusPayload::Running { pid }.into()).await;

                tracing::info!(pid = ?pid, mode = %mode, "Agent session running");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                inner.state = SessionState::Error;
                inner.pid = None;
                inner.last_error = Some(message.clone());
                self.sink.emit(StatusPayload::Error { message }.into()).await;

                tracing::error!(error = %e, "Failed to start agent session");
                Err(e)
            }
        }
    }

    /// Picks the execution mode and brings the agent up.
    async fn launch(&self) -> Result<Launched, SessionError> {
        if self.backend.interactive_available() {
            let mut process = self.backend.spawn_interactive(&self.project).await?;
            let Some(output) = process.take_output() else {
                if let Err(e) = process.close() {
                    tracing::warn!(error = %e, "Failed to close agent process");
                }
                return Err(SessionError::SpawnFailed(
                    "agent output stream unavailable".to_string(),
                ));
            };
            let pid = process.pid();
            if pid.is_none() {
                tracing::warn!("Agent process did not report a pid");
            }
            Ok(Launched::Interactive {
                process,
                output,
                pid,
            })
        } else {
            tracing::warn!("No PTY available, running each command as its own process");
            let version = self.backend.probe(&self.project).await?;
            tracing::info!(version = %version, "Agent CLI reachable");
            Ok(Launched::Stateless)
        }
    }

    fn spawn_read_loop(
        &self,
        process: ProcessHandle,
        output: mpsc::Receiver<ReadChunk>,
        generation: u64,
    ) -> ReadTask {
        let cancel = CancellationToken::new();
        let read_loop = ReadLoop {
            inner: Arc::clone(&self.inner),
            sink: Arc::clone(&self.sink),
            timing: self.timing,
            process,
            output,
            cancel: cancel.clone(),
            generation,
        };
        ReadTask {
            handle: tokio::spawn(read_loop.run()),
            cancel,
        }
    }

    /// Stops the session.
    ///
    /// Cancels the read loop and any one-shot executions, closes the process
    /// and emits `stopped`. Does nothing when the session is already stopped.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let read_task = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Stopped
                && inner.process.is_none()
                && inner.read_task.is_none()
            {
                tracing::debug!("Agent session already stopped");
                return;
            }

            let read_task = inner.read_task.take();
            if let Some(task) = &read_task {
                task.cancel.cancel();
            }
            // From here on send_command rejects new commands.
            inner.oneshot_cancel.cancel();
            read_task
        };

        if let Some(task) = read_task {
            if let Err(e) = task.handle.await {
                tracing::warn!(error = %e, "Read loop ended abnormally");
            }
        }

        self.oneshots.close();
        self.oneshots.wait().await;
        self.oneshots.reopen();

        let mut inner = self.inner.lock().await;
        if let Some(process) = inner.process.take() {
            if let Err(e) = process.lock().await.close() {
                tracing::warn!(error = %e, "Failed to close agent process");
            }
        }

        let was_stopped = inner.state == SessionState::Stopped;
        inner.state = SessionState::Stopped;
        inner.pid = None;
        if !was_stopped {
            self.sink.emit(StatusPayload::Stopped.into()).await;
            tracing::info!(project = %self.project.display(), "Agent session stopped");
        }
    }

    /// Sends a command to the agent.
    ///
    /// `command_sent` is emitted before delivery. In interactive mode the
    /// command is written to the PTY followed by a newline; in stateless
    /// mode a one-shot execution is started in the background.
    ///
    /// A session that `stop` has begun tearing down is no longer running.
    pub async fn send_command(&self, command: &str) -> Result<(), SessionError> {
        let process = {
            let inner = self.inner.lock().await;
            if inner.state != SessionState::Running || inner.oneshot_cancel.is_cancelled() {
                tracing::warn!(state = %inner.state, "Agent session not running, command rejected");
                return Err(SessionError::NotRunning);
            }

            tracing::info!(command = %preview(command), "Sending command");
            self.sink.emit(Event::command_sent(command)).await;

            // Spawned under the lock so `stop` either sees the execution in
            // the tracker or rejects the command.
            match inner.process.clone() {
                Some(process) => process,
                None => {
                    self.spawn_oneshot(command.to_string(), inner.oneshot_cancel.clone());
                    return Ok(());
                }
            }
        };

        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\n');
        let result = process
            .lock()
            .await
            .write_all(line.as_bytes())
            .inspect_err(|e| tracing::warn!(error = %e, "Failed to write command"));
        result
    }

    fn spawn_oneshot(&self, prompt: String, cancel: CancellationToken) {
        let backend = Arc::clone(&self.backend);
        let sink = Arc::clone(&self.sink);
        let project = self.project.clone();

        self.oneshots.spawn(async move {
            match backend.oneshot_command(&prompt, &project) {
                Ok(command) => run_oneshot(command, sink, cancel).await,
                Err(_) if cancel.is_cancelled() => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to prepare one-shot execution");
                    sink.emit(OutputEvent::error(format!("Execution failed: {e}")).into())
                        .await;
                }
            }
        });
    }

    /// Returns a snapshot of the session.
    pub async fn status(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            state: inner.state,
            pid: inner.pid,
            started_at: inner.started_at,
            error_message: inner.last_error.clone(),
            mode: inner.mode,
            project: Some(self.project.clone()),
        }
    }
}

/// First characters of a command, for logging.
fn preview(command: &str) -> String {
    match command.char_indices().nth(COMMAND_PREVIEW_LEN) {
        Some((end, _)) => format!("{}...", &command[..end]),
        None => command.to_string(),
    }
}

/// Background pump from the PTY reader to the sink.
struct ReadLoop {
    inner: Arc<Mutex<SessionInner>>,
    sink: Arc<dyn EventSink>,
    timing: SessionTiming,
    process: ProcessHandle,
    output: mpsc::Receiver<ReadChunk>,
    cancel: CancellationToken,
    generation: u64,
}

impl ReadLoop {
    async fn run(mut self) {
        let mut decoder = OutputDecoder::new();
        tracing::debug!(generation = self.generation, "Read loop started");

        loop {
            if self.cancel.is_cancelled() {
                tracing::debug!("Read loop cancelled");
                return;
            }

            let alive = self.process.lock().await.is_alive();
            if !alive {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::debug!("Read loop cancelled");
                    return;
                }
                received = timeout(self.timing.read_backoff, self.output.recv()) => match received {
                    Ok(Some(ReadChunk::Data(bytes))) => self.publish(decoder.push(&bytes)).await,
                    Ok(Some(ReadChunk::Error(e))) => {
                        tracing::warn!(error = %e, "Error reading agent output");
                        if !self.pause(self.timing.error_backoff).await {
                            return;
                        }
                    }
                    // Reader finished; keep polling liveness.
                    Ok(None) => {
                        if !self.pause(self.timing.read_backoff).await {
                            return;
                        }
                    }
                    Err(_) => {}
                },
            }
        }

        if !self.drain(&mut decoder).await {
            return;
        }
        self.finish().await;
    }

    async fn publish(&self, text: String) {
        if !text.is_empty() {
            tracing::trace!(bytes = text.len(), "Agent output");
            self.sink.emit(OutputEvent::text(text).into()).await;
        }
    }

    /// Sleeps unless cancelled. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Publishes output the reader produced before the process exited.
    /// Returns false on cancellation.
    async fn drain(&mut self, decoder: &mut OutputDecoder) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                received = timeout(self.timing.read_backoff, self.output.recv()) => match received {
                    Ok(Some(ReadChunk::Data(bytes))) => self.publish(decoder.push(&bytes)).await,
                    _ => break,
                },
            }
        }
        self.publish(decoder.finish()).await;
        true
    }

    /// Releases the process and moves the session to `Stopped` after the
    /// agent exited on its own.
    async fn finish(self) {
        let mut inner = self.inner.lock().await;
        if self.cancel.is_cancelled()
            || inner.generation != self.generation
            || inner.state != SessionState::Running
        {
            return;
        }

        inner.read_task = None;
        if let Some(process) = inner.process.take() {
            if let Err(e) = process.lock().await.close() {
                tracing::warn!(error = %e, "Failed to close agent process");
            }
        }
        inner.state = SessionState::Stopped;
        inner.pid = None;
        self.sink.emit(StatusPayload::Stopped.into()).await;

        tracing::info!("Agent process exited, session stopped");
    }
}
