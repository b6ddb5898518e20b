//! Bounded history of signing-state backups.
//!
//! Every changed state the watchdog observes is written to its own
//! timestamped file. Only the `keep_recent` newest files written by this
//! process are kept; older ones are deleted oldest-first. The separate
//! "latest" pointer file is managed here too but is never pruned.

use crate::paths::BackupDir;
use crate::state::{SigningState, StateError};
use chrono::Utc;
use std::collections::VecDeque;
use std::path::PathBuf;

/// Retention never keeps fewer than this many history files.
pub const MIN_KEEP_RECENT: usize = 3;

pub fn clamp_keep_recent(keep_recent: usize) -> usize {
    keep_recent.max(MIN_KEEP_RECENT)
}

#[derive(Debug)]
pub struct BackupRetention {
    dir: BackupDir,
    keep_recent: usize,
    /// Oldest first, in the order the files were written.
    tracked: VecDeque<PathBuf>,
}

impl BackupRetention {
    /// `keep_recent` below [`MIN_KEEP_RECENT`] is raised to it.
    pub fn new(dir: BackupDir, keep_recent: usize) -> Self {
        Self {
            dir,
            keep_recent: clamp_keep_recent(keep_recent),
            tracked: VecDeque::new(),
        }
    }

    pub fn keep_recent(&self) -> usize {
        self.keep_recent
    }

    pub fn dir(&self) -> &BackupDir {
        &self.dir
    }

    /// History files currently tracked, oldest first.
    #[cfg(test)]
    pub fn tracked(&self) -> impl Iterator<Item = &std::path::Path> {
        self.tracked.iter().map(PathBuf::as_path)
    }

    /// Write `state` to a new timestamped history file, then prune.
    ///
    /// Two records in the same second get distinct names. A failed write
    /// leaves the tracked list untouched.
    pub fn record(&mut self, state: &SigningState) -> Result<PathBuf, StateError> {
        let path = unique_path(self.dir.history_file(Utc::now(), state));
        state.save(&path)?;
        tracing::debug!(path = %path.display(), "recorded state backup");
        self.tracked.push_back(path.clone());
        self.prune();
        Ok(path)
    }

    /// Delete the oldest tracked files beyond `keep_recent`.
    ///
    /// Already-missing files are fine; other delete errors are logged and the
    /// entry is dropped anyway.
    pub fn prune(&mut self) {
        while self.tracked.len() > self.keep_recent {
            let Some(path) = self.tracked.pop_front() else {
                break;
            };
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "pruned state backup");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %e,
                        "failed to remove backup file"
                    );
                }
            }
        }
    }

    /// Overwrite the "latest" pointer with `state`.
    pub fn update_latest(&self, state: &SigningState) -> Result<PathBuf, StateError> {
        let path = self.dir.latest();
        state.save(&path)?;
        Ok(path)
    }

    /// The state in the "latest" pointer, or `None` if there is no pointer yet.
    pub fn load_latest(&self) -> Result<Option<SigningState>, StateError> {
        let path = self.dir.latest();
        match SigningState::load(&path) {
            Ok(state) => Ok(Some(state)),
            Err(StateError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// `path` itself if free, otherwise `<stem>_1.json`, `<stem>_2.json`, ...
fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    (1u32..)
        .map(|n| path.with_file_name(format!("{stem}_{n}.json")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}
