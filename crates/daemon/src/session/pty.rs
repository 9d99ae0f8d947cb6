//! Agent process attached to a pseudo-terminal.
//!
//! The PTY master is read on a dedicated OS thread that forwards chunks over
//! a bounded channel. The async side never blocks on the PTY: it waits on
//! the channel with a timeout and polls the child for liveness.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::Path;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use super::backend::{InteractiveProcess, ReadChunk};
use super::SessionError;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Chunks buffered between the reader thread and the read loop.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// A running agent process with its PTY.
pub struct PtyProcess {
    /// Kept alive so the PTY stays open; `None` once closed.
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    output: Option<mpsc::Receiver<ReadChunk>>,
    pid: Option<u32>,
    exited: bool,
}

impl PtyProcess {
    /// Spawns `program` on a new PTY of the given size, rooted at `cwd`.
    pub fn spawn(
        program: &Path,
        args: &[String],
        cwd: &Path,
        cols: u16,
        rows: u16,
        env: &BTreeMap<String, String>,
    ) -> Result<Self, SessionError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(cwd);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // Only the child holds the slave, so reads see EOF once it exits.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        spawn_reader_thread(reader, tx, pid)?;

        tracing::info!(
            pid = ?pid,
            program = %program.display(),
            cwd = %cwd.display(),
            cols = cols,
            rows = rows,
            "Spawned agent on PTY"
        );

        Ok(PtyProcess {
            master: Some(pair.master),
            writer: Some(writer),
            child,
            output: Some(rx),
            pid,
            exited: false,
        })
    }
}

/// Starts the blocking reader.
///
/// The thread ends on EOF, on a read error (after forwarding it), or when the
/// receiving side is dropped.
fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<ReadChunk>,
    pid: Option<u32>,
) -> Result<(), SessionError> {
    std::thread::Builder::new()
        .name("agent-pty-reader".to_string())
        .spawn(move || {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(ReadChunk::Data(buffer[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if is_hangup(&e) => break,
                    Err(e) => {
                        let _ = tx.blocking_send(ReadChunk::Error(e.to_string()));
                        break;
                    }
                }
            }
            tracing::debug!(pid = ?pid, "PTY reader finished");
        })
        .map_err(|e| SessionError::SpawnFailed(format!("failed to start PTY reader: {e}")))?;
    Ok(())
}

/// Linux reports EIO on the master once every slave descriptor is closed.
fn is_hangup(error: &io::Error) -> bool {
    error.raw_os_error() == Some(nix::errno::Errno::EIO as i32)
}

impl InteractiveProcess for PtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        if self.exited {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exited = true;
                tracing::info!(
                    pid = ?self.pid,
                    exit_code = status.exit_code(),
                    "Agent process exited"
                );
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to poll agent process");
                true
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let writer = self.writer.as_mut().ok_or(SessionError::NotRunning)?;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<ReadChunk>> {
        self.output.take()
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.writer = None;
        self.output = None;

        let result = if self.exited || !self.is_alive() {
            Ok(())
        } else {
            let killed = self
                .child
                .kill()
                .map_err(|e| SessionError::CloseFailed(e.to_string()));
            if killed.is_ok() {
                // Reap the child; SIGKILL makes this prompt.
                if let Err(e) = self.child.wait() {
                    tracing::debug!(pid = ?self.pid, error = %e, "Failed to reap agent process");
                }
                self.exited = true;
            }
            killed
        };

        self.master = None;
        tracing::debug!(pid = ?self.pid, "Closed agent PTY");
        result
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.master.is_some() {
            if let Err(e) = self.close() {
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to close agent PTY on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn spawn_program(name: &str, args: &[&str], cwd: &Path) -> PtyProcess {
        let program = which::which(name).expect("program not on PATH");
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        PtyProcess::spawn(&program, &args, cwd, 80, 24, &BTreeMap::new()).unwrap()
    }

    async fn read_until(rx: &mut mpsc::Receiver<ReadChunk>, needle: &str) -> bool {
        let mut collected = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(ReadChunk::Data(data))) => {
                    collected.push_str(&String::from_utf8_lossy(&data));
                    if collected.contains(needle) {
                        return true;
                    }
                }
                Ok(Some(ReadChunk::Error(_))) | Ok(None) => return false,
                Err(_) => {}
            }
        }
        false
    }

    #[tokio::test]
    async fn test_spawn_write_and_read() {
        let dir = TempDir::new().unwrap();
        let mut process = spawn_program("cat", &[], dir.path());
        assert!(process.pid().is_some());
        assert!(process.is_alive());

        let mut rx = process.take_output().unwrap();
        assert!(process.take_output().is_none());

        process.write_all(b"pty_marker_line\n").unwrap();
        assert!(read_until(&mut rx, "pty_marker_line").await);

        process.close().unwrap();
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cwd_probe.txt"), "").unwrap();
        let mut process = spawn_program("ls", &[], dir.path());

        let mut rx = process.take_output().unwrap();
        assert!(read_until(&mut rx, "cwd_probe.txt").await);
    }

    #[tokio::test]
    async fn test_env_vars_passed() {
        let dir = TempDir::new().unwrap();
        let program = which::which("sh").unwrap();
        let mut env = BTreeMap::new();
        env.insert("RELAY_TEST_VAR".to_string(), "relay_value".to_string());
        let args = vec!["-c".to_string(), "echo $RELAY_TEST_VAR".to_string()];
        let mut process = PtyProcess::spawn(&program, &args, dir.path(), 80, 24, &env).unwrap();

        let mut rx = process.take_output().unwrap();
        assert!(read_until(&mut rx, "relay_value").await);
    }

    #[tokio::test]
    async fn test_exit_detected() {
        let dir = TempDir::new().unwrap();
        let mut process = spawn_program("sh", &["-c", "exit 3"], dir.path());

        let mut alive = true;
        for _ in 0..50 {
            alive = process.is_alive();
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive);

        // Closing an exited process is not an error.
        process.close().unwrap();
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let mut process = spawn_program("cat", &[], dir.path());
        process.close().unwrap();

        assert!(matches!(
            process.write_all(b"hello\n"),
            Err(SessionError::NotRunning)
        ));
    }

    #[test]
    fn test_spawn_missing_program() {
        let dir = TempDir::new().unwrap();
        let result = PtyProcess::spawn(
            Path::new("/nonexistent/agent"),
            &[],
            dir.path(),
            80,
            24,
            &BTreeMap::new(),
        );
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }
}
