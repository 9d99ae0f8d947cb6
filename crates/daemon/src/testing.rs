//! Test doubles shared by unit tests.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use protocol::{Event, StatusPayload};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::broadcast::EventSink;
use crate::session::{AgentBackend, InteractiveProcess, ReadChunk, SessionError};

/// Ordered log of sink emissions and process writes.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Sink that keeps every event it is given.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
    journal: Journal,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal(&self) -> Journal {
        Arc::clone(&self.journal)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<StatusPayload> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Polls until `predicate` holds or `limit` elapses.
    pub async fn wait_for<F>(&self, limit: Duration, predicate: F) -> bool
    where
        F: Fn(&[Event]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if predicate(&self.events.lock().unwrap()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: Event) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("event:{}", event.event_type()));
        self.events.lock().unwrap().push(event);
    }
}

/// Observable state of a [`FakeProcess`].
pub struct FakeProcessState {
    pub written: Mutex<Vec<u8>>,
    pub alive: AtomicBool,
    pub fail_writes: AtomicBool,
    pub close_calls: AtomicUsize,
    journal: Journal,
}

impl FakeProcessState {
    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
    }

    pub fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// In-memory interactive process.
pub struct FakeProcess {
    state: Arc<FakeProcessState>,
    output: Option<mpsc::Receiver<ReadChunk>>,
    pid: Option<u32>,
}

impl InteractiveProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(SessionError::WriteFailed("broken pipe".to_string()));
        }
        self.state
            .journal
            .lock()
            .unwrap()
            .push(format!("write:{}", String::from_utf8_lossy(data)));
        self.state.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<ReadChunk>> {
        self.output.take()
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Failure injected into [`FakeBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    ToolMissing,
    SpawnFailed,
    ProbeFailed,
}

/// Backend whose processes are [`FakeProcess`]es and whose one-shot
/// commands are `sh -c <prompt>`.
pub struct FakeBackend {
    interactive: bool,
    failure: Mutex<Option<FakeFailure>>,
    journal: Journal,
    spawns: AtomicUsize,
    probes: AtomicUsize,
    report_pids: bool,
    spawn_delay: Duration,
    processes: Mutex<Vec<(Arc<FakeProcessState>, mpsc::Sender<ReadChunk>)>>,
}

impl FakeBackend {
    pub fn new(interactive: bool) -> Self {
        Self {
            interactive,
            failure: Mutex::new(None),
            journal: Journal::default(),
            spawns: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            report_pids: true,
            spawn_delay: Duration::ZERO,
            processes: Mutex::new(Vec::new()),
        }
    }

    /// Spawned processes report no pid.
    pub fn without_pids(mut self) -> Self {
        self.report_pids = false;
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    /// Every interactive spawn takes `delay`.
    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    pub fn fail_with(&self, failure: Option<FakeFailure>) {
        *self.failure.lock().unwrap() = failure;
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// State and output feed of the most recently spawned process.
    pub fn last_process(&self) -> (Arc<FakeProcessState>, mpsc::Sender<ReadChunk>) {
        let processes = self.processes.lock().unwrap();
        let (state, tx) = processes.last().expect("no process spawned");
        (Arc::clone(state), tx.clone())
    }

    /// Number of spawned processes that have not been closed.
    pub fn alive_count(&self) -> usize {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .filter(|(state, _)| state.alive.load(Ordering::SeqCst))
            .count()
    }

    fn injected_error(&self) -> Option<SessionError> {
        self.failure.lock().unwrap().map(|failure| match failure {
            FakeFailure::ToolMissing => SessionError::ToolMissing("claude".to_string()),
            FakeFailure::SpawnFailed => SessionError::SpawnFailed("openpty failed".to_string()),
            FakeFailure::ProbeFailed => SessionError::ProbeFailed("exit status 1".to_string()),
        })
    }
}

#[async_trait]
impl AgentBackend for FakeBackend {
    fn interactive_available(&self) -> bool {
        self.interactive
    }

    async fn spawn_interactive(
        &self,
        _cwd: &Path,
    ) -> Result<Box<dyn InteractiveProcess>, SessionError> {
        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }
        if let Some(e) = self.injected_error() {
            return Err(e);
        }
        let count = self.spawns.fetch_add(1, Ordering::SeqCst) + 1;

        let state = Arc::new(FakeProcessState {
            written: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            journal: Arc::clone(&self.journal),
        });
        let (tx, rx) = mpsc::channel(64);
        self.processes
            .lock()
            .unwrap()
            .push((Arc::clone(&state), tx));

        Ok(Box::new(FakeProcess {
            state,
            output: Some(rx),
            pid: self.report_pids.then_some(1000 + count as u32),
        }))
    }

    async fn probe(&self, _cwd: &Path) -> Result<String, SessionError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        match self.injected_error() {
            Some(e) => Err(e),
            None => Ok("1.0.0 (fake)".to_string()),
        }
    }

    fn oneshot_command(&self, prompt: &str, cwd: &Path) -> Result<Command, SessionError> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(prompt)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if cwd.is_dir() {
            command.current_dir(cwd);
        }
        Ok(command)
    }
}
