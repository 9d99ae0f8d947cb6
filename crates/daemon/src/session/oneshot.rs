//! Stateless command execution.
//!
//! Each command runs as its own agent process. Stdout and stderr are
//! drained line by line concurrently, then the exit code is reported with a
//! single `complete` event. Nothing is returned to the caller: the
//! execution runs detached, so every failure becomes an `error` event.

use std::process::ExitStatus;
use std::sync::Arc;

use protocol::{OutputEvent, OutputKind};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::SessionError;
use crate::broadcast::EventSink;
use crate::sanitize::strip_control_sequences;

/// Runs one execution to completion or until `cancel` fires.
///
/// On cancellation the child is killed and no further events are emitted.
pub async fn run_oneshot(mut command: Command, sink: Arc<dyn EventSink>, cancel: CancellationToken) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!("One-shot execution cancelled");
        }
        result = execute(&mut command, sink.as_ref()) => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "One-shot execution failed");
                sink.emit(OutputEvent::error(format!("Execution failed: {e}")).into())
                    .await;
            }
        }
    }
}

async fn execute(command: &mut Command, sink: &dyn EventSink) -> Result<(), SessionError> {
    let mut child = command
        .spawn()
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
    let pid = child.id();
    tracing::debug!(pid = ?pid, "Started one-shot execution");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::try_join!(
        drain_lines(stdout, OutputKind::Text, sink),
        drain_lines(stderr, OutputKind::Error, sink),
    )?;

    let status = child.wait().await?;
    let exit_code = exit_code(status);
    tracing::debug!(pid = ?pid, exit_code = ?exit_code, "One-shot execution finished");

    sink.emit(OutputEvent::complete(exit_code).into()).await;
    Ok(())
}

/// Emits every non-blank line of `stream` as an output event of `kind`.
async fn drain_lines<R>(
    stream: Option<R>,
    kind: OutputKind,
    sink: &dyn EventSink,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return Ok(());
    };

    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| SessionError::ReadFailed(e.to_string()))?;
        if read == 0 {
            return Ok(());
        }

        let text = strip_control_sequences(&String::from_utf8_lossy(&line));
        let content = text.trim_end();
        if content.is_empty() {
            continue;
        }

        let event = match kind {
            OutputKind::Error => OutputEvent::error(content),
            _ => OutputEvent::text(content),
        };
        sink.emit(event.into()).await;
    }
}

/// Exit code of the process; a negated signal number when it was killed.
fn exit_code(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|s| -s))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}
