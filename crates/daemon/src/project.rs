//! Active project lookup.
//!
//! The controller only needs to know which directory the agent should run
//! in. Where that comes from is up to the resolver: a directory fixed at
//! startup, or the head of the recent-projects list another tool maintains.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// File name of the recent-projects list inside the data directory.
pub const RECENT_PROJECTS_FILE: &str = "recent-projects.json";

/// Finds the project directory a session should be rooted at.
pub trait ProjectResolver: Send + Sync {
    /// Returns the active project, or `None` when there is none.
    fn active_project(&self) -> Option<PathBuf>;
}

/// Always resolves to the same directory.
#[derive(Debug, Clone)]
pub struct FixedProjectResolver {
    directory: PathBuf,
}

impl FixedProjectResolver {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

impl ProjectResolver for FixedProjectResolver {
    fn active_project(&self) -> Option<PathBuf> {
        Some(self.directory.clone())
    }
}

#[derive(Debug, Deserialize)]
struct RecentProject {
    path: PathBuf,
}

/// Resolves to the most recent entry of a recent-projects file.
///
/// The file is a JSON array of objects with at least a `path` field, most
/// recent first. It is re-read on every lookup and never written.
#[derive(Debug, Clone)]
pub struct RecentProjectsResolver {
    file: PathBuf,
}

impl RecentProjectsResolver {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self { file: file.into() }
    }

    /// Resolver for the recent-projects file inside `data_dir`.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(RECENT_PROJECTS_FILE))
    }

    pub fn file(&self) -> &Path {
        &self.file
    }
}

impl ProjectResolver for RecentProjectsResolver {
    fn active_project(&self) -> Option<PathBuf> {
        let content = match std::fs::read_to_string(&self.file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(file = %self.file.display(), error = %e, "Failed to read recent projects");
                return None;
            }
        };

        match serde_json::from_str::<Vec<RecentProject>>(&content) {
            Ok(projects) => projects.into_iter().next().map(|p| p.path),
            Err(e) => {
                tracing::warn!(file = %self.file.display(), error = %e, "Malformed recent projects file");
                None
            }
        }
    }
}
