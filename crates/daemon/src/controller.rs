//! Session controller.
//!
//! Entry point for the control surfaces (IPC, CLI). Resolves the active
//! project, keeps at most one [`SessionManager`] alive and replaces it when
//! the project changes. Every manager it creates emits into the shared hub.

use std::path::PathBuf;
use std::sync::Arc;

use protocol::SessionSnapshot;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::broadcast::EventHub;
use crate::project::ProjectResolver;
use crate::session::{AgentBackend, SessionError, SessionManager, SessionTiming};

/// Errors returned by controller operations.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The resolver has no active project.
    #[error("no active project")]
    NoActiveProject,

    /// The active project directory does not exist.
    #[error("project directory does not exist: {}", .0.display())]
    ProjectNotFound(PathBuf),

    /// The command was empty after trimming.
    #[error("command is empty")]
    EmptyCommand,

    /// Session operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Owns the current session and routes control requests to it.
pub struct SessionController {
    resolver: Arc<dyn ProjectResolver>,
    backend: Arc<dyn AgentBackend>,
    hub: Arc<EventHub>,
    timing: SessionTiming,
    /// Serializes `start` and `shutdown`, so a replaced session is never
    /// started after its replacement was installed.
    lifecycle: Mutex<()>,
    session: Mutex<Option<Arc<SessionManager>>>,
}

impl SessionController {
    pub fn new(
        resolver: Arc<dyn ProjectResolver>,
        backend: Arc<dyn AgentBackend>,
        hub: Arc<EventHub>,
        timing: SessionTiming,
    ) -> Self {
        Self {
            resolver,
            backend,
            hub,
            timing,
            lifecycle: Mutex::new(()),
            session: Mutex::new(None),
        }
    }

    /// Starts a session in the active project.
    ///
    /// A session rooted at another project is stopped and replaced first.
    /// Returns the snapshot after starting.
    pub async fn start(&self) -> Result<SessionSnapshot, ControllerError> {
        let _lifecycle = self.lifecycle.lock().await;

        let project = self
            .resolver
            .active_project()
            .ok_or(ControllerError::NoActiveProject)?;
        if !project.is_dir() {
            return Err(ControllerError::ProjectNotFound(project));
        }

        let manager = {
            let mut session = self.session.lock().await;
            let reusable = session
                .as_ref()
                .filter(|current| current.project() == project)
                .cloned();
            match reusable {
                Some(manager) => manager,
                None => {
                    if let Some(previous) = session.take() {
                        tracing::info!(
                            from = %previous.project().display(),
                            to = %project.display(),
                            "Active project changed, replacing session"
                        );
                        previous.stop().await;
                    }
                    let manager = Arc::new(SessionManager::new(
                        project,
                        Arc::clone(&self.backend),
                        self.hub.clone(),
                        self.timing,
                    ));
                    *session = Some(Arc::clone(&manager));
                    manager
                }
            }
        };

        manager.start().await?;
        Ok(manager.status().await)
    }

    /// Stops the current session, if there is one.
    pub async fn stop(&self) {
        if let Some(manager) = self.current().await {
            manager.stop().await;
        }
    }

    /// Sends a trimmed command to the running session.
    pub async fn send_command(&self, command: &str) -> Result<(), ControllerError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ControllerError::EmptyCommand);
        }

        let manager = self.current().await.ok_or(SessionError::NotRunning)?;
        manager.send_command(command).await?;
        Ok(())
    }

    /// Snapshot of the current session, or a stopped default.
    pub async fn status(&self) -> SessionSnapshot {
        match self.current().await {
            Some(manager) => manager.status().await,
            None => SessionSnapshot::default(),
        }
    }

    /// Stops and drops the session.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let manager = self.session.lock().await.take();
        if let Some(manager) = manager {
            tracing::info!("Shutting down agent session");
            manager.stop().await;
        }
    }

    async fn current(&self) -> Option<Arc<SessionManager>> {
        self.session.lock().await.clone()
    }
}
