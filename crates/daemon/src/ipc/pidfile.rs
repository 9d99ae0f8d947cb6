//! PID file for detecting a running daemon.
//!
//! The file lives at `<data dir>/daemon.pid` and holds the daemon's pid as
//! decimal text. A file whose pid is unparsable or no longer alive is stale
//! and removed on read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Name of the pid file inside the data directory.
pub const PID_FILE_NAME: &str = "daemon.pid";

/// Handle to the daemon's pid file.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Pid file inside `data_dir`.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(PID_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records the current process as the running daemon.
    pub fn write(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{}\n", std::process::id()))
    }

    /// Returns the pid of the running daemon, cleaning up a stale file.
    pub fn running_pid(&self) -> Option<u32> {
        let content = fs::read_to_string(&self.path).ok()?;

        let Ok(pid) = content.trim().parse::<u32>() else {
            tracing::debug!(path = %self.path.display(), "Removing unparsable pid file");
            self.remove();
            return None;
        };

        if is_process_running(pid) {
            Some(pid)
        } else {
            tracing::debug!(pid = pid, "Removing stale pid file");
            self.remove();
            None
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    /// Deletes the file. A missing file is not an error.
    pub fn remove(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
            }
        }
    }
}

/// Signal 0 probes for existence without delivering anything.
fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read_current_process() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::in_data_dir(&dir.path().join("nested"));

        pid_file.write().unwrap();
        assert_eq!(pid_file.running_pid(), Some(std::process::id()));
        assert!(pid_file.is_running());

        pid_file.remove();
        assert!(!pid_file.path().exists());
        assert!(!pid_file.is_running());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::in_data_dir(dir.path());
        assert_eq!(pid_file.running_pid(), None);
        // Removing a missing file is fine.
        pid_file.remove();
    }

    #[test]
    fn test_stale_pid_is_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::in_data_dir(dir.path());
        fs::write(pid_file.path(), "4000000000\n").unwrap();

        assert_eq!(pid_file.running_pid(), None);
        assert!(!pid_file.path().exists());
    }

    #[test]
    fn test_garbage_is_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::in_data_dir(dir.path());
        fs::write(pid_file.path(), "not a pid").unwrap();

        assert_eq!(pid_file.running_pid(), None);
        assert!(!pid_file.path().exists());
    }

    #[test]
    fn test_is_process_running() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(0));
        assert!(!is_process_running(4_000_000_000));
    }
}
