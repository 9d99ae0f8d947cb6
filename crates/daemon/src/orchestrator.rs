//! Daemon orchestrator for wiring together all components.
//!
//! Owns the event hub, the heartbeat, the session controller and the IPC
//! accept loop, and tears them down in order on shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::broadcast::{spawn_heartbeat, EventHub};
use crate::config::Config;
use crate::controller::SessionController;
use crate::ipc::{IpcConnection, IpcError, IpcRequest, IpcResponse, IpcServer, PidFile};
use crate::project::{FixedProjectResolver, ProjectResolver, RecentProjectsResolver};
use crate::session::{AgentBackend, CliBackend, SessionTiming};

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on waiting for connection tasks during shutdown.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding the socket and spawning background tasks.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// State shared by every IPC connection.
struct Shared {
    hub: Arc<EventHub>,
    controller: Arc<SessionController>,
    shutdown_token: CancellationToken,
    started_at: Instant,
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    hub: Arc<EventHub>,
    controller: Arc<SessionController>,
    pid_file: PidFile,
    shutdown_token: CancellationToken,
    tasks: TaskTracker,
    started_at: Instant,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator running the configured agent CLI.
    ///
    /// The active project is `project.directory` when configured, otherwise
    /// the head of the recent-projects file in the data directory.
    pub fn new(config: Config) -> Self {
        let resolver: Arc<dyn ProjectResolver> = match &config.project.directory {
            Some(directory) => Arc::new(FixedProjectResolver::new(directory.clone())),
            None => Arc::new(RecentProjectsResolver::in_data_dir(&config.daemon.data_dir)),
        };
        let backend = Arc::new(CliBackend::new(config.agent.clone()));
        Self::with_parts(config, resolver, backend)
    }

    /// Creates an orchestrator with explicit collaborators.
    pub fn with_parts(
        config: Config,
        resolver: Arc<dyn ProjectResolver>,
        backend: Arc<dyn AgentBackend>,
    ) -> Self {
        let hub = Arc::new(EventHub::with_channel_capacity(
            config.relay.subscriber_capacity,
        ));
        let controller = Arc::new(SessionController::new(
            resolver,
            backend,
            Arc::clone(&hub),
            SessionTiming::from(&config.relay),
        ));
        let pid_file = PidFile::in_data_dir(&config.daemon.data_dir);

        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            hub,
            controller,
            pid_file,
            shutdown_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
            started_at: Instant::now(),
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Binds the control socket and starts the background tasks.
    pub async fn start(&self, socket_path: &Path) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Orchestrator has been shut down");
            }
            *state = OrchestratorState::Starting;
        }

        info!(socket = %socket_path.display(), "Starting daemon orchestrator...");

        let server = match IpcServer::bind(socket_path)
            .await
            .with_context(|| format!("Failed to bind IPC socket: {}", socket_path.display()))
        {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e);
            }
        };

        if let Err(e) = self.pid_file.write() {
            warn!(path = %self.pid_file.path().display(), error = %e, "Failed to write pid file");
        }

        let heartbeat = spawn_heartbeat(
            Arc::clone(&self.hub),
            self.config.relay.heartbeat_interval(),
            self.shutdown_token.child_token(),
        );
        self.tasks.spawn(async move {
            if let Err(e) = heartbeat.await {
                warn!(error = %e, "Heartbeat task ended abnormally");
            }
        });
        debug!(
            interval_secs = self.config.relay.heartbeat_interval_secs,
            "Started heartbeat task"
        );

        let shared = Arc::new(Shared {
            hub: Arc::clone(&self.hub),
            controller: Arc::clone(&self.controller),
            shutdown_token: self.shutdown_token.clone(),
            started_at: self.started_at,
        });
        self.tasks
            .spawn(accept_loop(server, shared, self.tasks.clone()));

        *self.state.write().await = OrchestratorState::Running;
        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    /// Stops the session and every background task.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();
        self.controller.shutdown().await;

        self.tasks.close();
        if tokio::time::timeout(TASK_DRAIN_TIMEOUT, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tasks.len(),
                "Background tasks did not finish in time"
            );
        }

        self.pid_file.remove();

        *self.state.write().await = OrchestratorState::Stopped;
        info!("Daemon orchestrator stopped");
        Ok(())
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    /// Cancelled when shutdown begins, including on a `Shutdown` request.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

async fn accept_loop(server: IpcServer, shared: Arc<Shared>, tasks: TaskTracker) {
    loop {
        tokio::select! {
            _ = shared.shutdown_token.cancelled() => {
                debug!("Accept loop received shutdown signal");
                break;
            }
            accepted = server.accept() => match accepted {
                Ok(conn) => {
                    debug!("Accepted IPC connection");
                    tasks.spawn(handle_connection(conn, Arc::clone(&shared)));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept IPC connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

async fn handle_connection(mut conn: IpcConnection, shared: Arc<Shared>) {
    loop {
        let request = tokio::select! {
            _ = shared.shutdown_token.cancelled() => return,
            request = conn.read_request() => request,
        };

        let response = match request {
            Ok(None) => return,
            Ok(Some(IpcRequest::Subscribe)) => {
                stream_events(conn, &shared).await;
                return;
            }
            Ok(Some(IpcRequest::Shutdown)) => {
                info!("Shutdown requested over IPC");
                if let Err(e) = conn.send_response(&IpcResponse::ShuttingDown).await {
                    debug!(error = %e, "Failed to acknowledge shutdown");
                }
                shared.shutdown_token.cancel();
                return;
            }
            Ok(Some(request)) => shared.handle(request).await,
            Err(IpcError::Json(e)) => IpcResponse::error(format!("invalid request: {e}")),
            Err(e) => {
                debug!(error = %e, "IPC connection failed");
                return;
            }
        };

        if let Err(e) = conn.send_response(&response).await {
            debug!(error = %e, "Failed to send IPC response");
            return;
        }
    }
}

/// Turns the connection into a hub subscriber until either side leaves.
async fn stream_events(mut conn: IpcConnection, shared: &Shared) {
    let (subscriber_id, frames) = shared.hub.subscribe_channel().await;
    info!(subscriber_id = %subscriber_id, "IPC client subscribed");

    let subscribed = IpcResponse::Subscribed {
        subscriber_id: subscriber_id.clone(),
    };
    let result = match conn.send_response(&subscribed).await {
        Ok(()) => conn.forward_events(frames, &shared.shutdown_token).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        debug!(subscriber_id = %subscriber_id, error = %e, "Event stream ended with error");
    }

    shared.hub.unsubscribe(&subscriber_id).await;
    info!(subscriber_id = %subscriber_id, "IPC client unsubscribed");
}

impl Shared {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                session: self.controller.status().await,
                uptime_secs: self.started_at.elapsed().as_secs(),
                subscribers: self.hub.subscriber_count().await,
            },
            IpcRequest::Start => match self.controller.start().await {
                Ok(snapshot) => IpcResponse::Started { pid: snapshot.pid },
                Err(e) => IpcResponse::error(e.to_string()),
            },
            IpcRequest::Stop => {
                self.controller.stop().await;
                IpcResponse::Stopped
            }
            IpcRequest::SendCommand { command } => {
                match self.controller.send_command(&command).await {
                    Ok(()) => IpcResponse::CommandAccepted,
                    Err(e) => IpcResponse::error(e.to_string()),
                }
            }
            IpcRequest::Subscribe | IpcRequest::Shutdown => {
                IpcResponse::error("request must be handled by the connection")
            }
        }
    }
}
