//! AgentRelay
//!
//! Supervises a coding agent CLI and relays its output to subscribers.

use std::path::PathBuf;
use std::time::Duration;

use agentrelay::config::Config;
use agentrelay::ipc::{get_socket_path, IpcClient, IpcResponse, PidFile};
use agentrelay::orchestrator::DaemonOrchestrator;
use anyhow::Context;
use clap::{Parser, Subcommand};
use protocol::{Event, EventFrame, OutputKind, SessionSnapshot, StatusPayload};
use tracing_subscriber::EnvFilter;

/// AgentRelay - supervise a coding agent CLI and relay its output.
#[derive(Parser, Debug)]
#[command(name = "agentrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon in the foreground
    Serve {
        /// Project directory the agent runs in (overrides the config)
        #[arg(long, short, value_name = "DIR")]
        project: Option<PathBuf>,
    },

    /// Start the agent session
    Start,

    /// Stop the agent session
    Stop,

    /// Send a command to the agent
    Send {
        /// Command text; multiple words are joined with spaces
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Show session status
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Stream events until interrupted
    Watch {
        /// Also print heartbeats
        #[arg(long)]
        heartbeats: bool,
    },

    /// Shut the daemon down
    Shutdown {
        /// Kill the daemon with SIGKILL instead of asking it to exit
        #[arg(long, short)]
        force: bool,

        /// Seconds to wait for the daemon to exit
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    init_tracing(&config, cli.verbose);
    if let Some(config_path) = &cli.config {
        tracing::debug!(path = %config_path.display(), "Using config file");
    }

    match cli.command {
        Commands::Serve { project } => {
            if let Some(project) = project {
                config.project.directory = Some(project);
            }
            serve(config).await?;
        }
        Commands::Start => {
            let mut client = connect().await?;
            match client.start().await? {
                IpcResponse::Started { pid } => match pid {
                    Some(pid) => println!("Agent session running (pid {pid})"),
                    None => println!("Agent session running"),
                },
                other => return unexpected(other),
            }
        }
        Commands::Stop => {
            let mut client = connect().await?;
            match client.stop().await? {
                IpcResponse::Stopped => println!("Agent session stopped"),
                other => return unexpected(other),
            }
        }
        Commands::Send { text } => {
            let mut client = connect().await?;
            match client.send_command(text.join(" ")).await? {
                IpcResponse::CommandAccepted => {}
                other => return unexpected(other),
            }
        }
        Commands::Status { json } => {
            let mut client = connect().await?;
            match client.status().await? {
                IpcResponse::Status {
                    session,
                    uptime_secs,
                    subscribers,
                } => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&session)?);
                    } else {
                        print_status(&session, uptime_secs, subscribers);
                    }
                }
                other => return unexpected(other),
            }
        }
        Commands::Watch { heartbeats } => watch(heartbeats).await?,
        Commands::Shutdown { force, timeout } => {
            if force {
                force_stop_daemon(&config)?;
            } else {
                graceful_stop_daemon(timeout).await?;
            }
            println!("Daemon stopped");
        }
    }

    Ok(())
}

fn init_tracing(config: &Config, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn connect() -> anyhow::Result<IpcClient> {
    let socket_path = get_socket_path();
    IpcClient::connect(&socket_path).await.with_context(|| {
        format!(
            "Cannot connect to daemon at {} (is `agentrelay serve` running?)",
            socket_path.display()
        )
    })
}

fn unexpected(response: IpcResponse) -> anyhow::Result<()> {
    match response {
        IpcResponse::Error { message } => anyhow::bail!("{message}"),
        other => anyhow::bail!("Unexpected response from daemon: {other:?}"),
    }
}

/// Runs the daemon until SIGINT, SIGTERM or a `Shutdown` request.
async fn serve(config: Config) -> anyhow::Result<()> {
    let pid_file = PidFile::in_data_dir(&config.daemon.data_dir);
    if let Some(pid) = pid_file.running_pid() {
        anyhow::bail!("Daemon already running (PID: {pid}). Stop it with `agentrelay shutdown`.");
    }

    match &config.project.directory {
        Some(directory) => tracing::info!(project = %directory.display(), "Using fixed project"),
        None => tracing::info!("Using most recent project"),
    }

    let orchestrator = DaemonOrchestrator::new(config);
    orchestrator.start(&get_socket_path()).await?;

    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
        }
        _ = shutdown.cancelled() => {
            tracing::info!("Shutdown requested");
        }
    }

    orchestrator.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

async fn watch(heartbeats: bool) -> anyhow::Result<()> {
    let mut client = connect().await?;
    let subscriber_id = client.subscribe().await?;
    tracing::debug!(subscriber_id = %subscriber_id, "Subscribed to events");

    loop {
        let frame = tokio::select! {
            frame = client.next_event() => frame?,
            result = wait_for_shutdown_signal() => {
                result?;
                return Ok(());
            }
        };
        let Some(frame) = frame else {
            eprintln!("Daemon closed the event stream");
            return Ok(());
        };
        if let Some(line) = format_event(&frame, heartbeats) {
            println!("{line}");
        }
    }
}

/// Renders one event for the terminal. `None` hides it.
fn format_event(frame: &EventFrame, heartbeats: bool) -> Option<String> {
    let event = match frame.decode() {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(event = %frame.event, error = %e, "Undecodable event");
            return Some(format!("[{}] {}", frame.event, frame.data));
        }
    };

    match event {
        Event::Status(status) => Some(match status {
            StatusPayload::Starting => "[status] starting".to_string(),
            StatusPayload::Running { pid: Some(pid) } => format!("[status] running (pid {pid})"),
            StatusPayload::Running { pid: None } => "[status] running".to_string(),
            StatusPayload::Stopped => "[status] stopped".to_string(),
            StatusPayload::Error { message } => format!("[status] error: {message}"),
        }),
        Event::Output(output) => match output.event_type {
            OutputKind::Text => Some(output.content),
            OutputKind::Error => Some(format!("[stderr] {}", output.content)),
            OutputKind::Complete => Some(match output.exit_code {
                Some(code) => format!("[complete] exit code {code}"),
                None => "[complete]".to_string(),
            }),
        },
        Event::CommandSent(sent) => Some(format!("> {}", sent.command)),
        Event::Heartbeat(beat) => heartbeats.then(|| format!("[heartbeat] {}", beat.timestamp)),
    }
}

fn print_status(session: &SessionSnapshot, uptime_secs: u64, subscribers: usize) {
    println!("Session: {}", session.state);
    if let Some(mode) = session.mode {
        println!("  Mode:        {mode}");
    }
    if let Some(pid) = session.pid {
        println!("  PID:         {pid}");
    }
    if let Some(project) = &session.project {
        println!("  Project:     {}", project.display());
    }
    if let Some(started_at) = session.started_at {
        println!("  Started:     {}", started_at.to_rfc3339());
    }
    if let Some(message) = &session.error_message {
        println!("  Error:       {message}");
    }
    println!("Daemon uptime: {}", format_duration(uptime_secs));
    println!("Subscribers:   {subscribers}");
}

/// Asks the daemon to exit and waits until its socket is gone.
async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();
    let mut client = IpcClient::connect_with_timeout(&socket_path, Duration::from_secs(5))
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))?;

    client.set_timeout(Duration::from_secs(timeout_secs));
    match client.shutdown().await? {
        IpcResponse::ShuttingDown => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        other => return unexpected(other),
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({timeout_secs}s)")
}

/// Kills the daemon recorded in the pid file with SIGKILL.
fn force_stop_daemon(config: &Config) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid_file = PidFile::in_data_dir(&config.daemon.data_dir);
    let pid = pid_file
        .running_pid()
        .ok_or_else(|| anyhow::anyhow!("Daemon PID file not found - is the daemon running?"))?;
    let raw = i32::try_from(pid).context("PID out of range")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {pid})"))?;
    println!("Sent SIGKILL to daemon (PID {pid})");

    pid_file.remove();
    let _ = std::fs::remove_file(get_socket_path());
    Ok(())
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
