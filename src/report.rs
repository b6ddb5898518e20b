//! Incident reports written when the signing state regresses.
//!
//! Two files are produced: a timestamped mismatch report in the backup
//! directory and an urgent report at a fixed path in the operator's home.
//! Both are written from background tasks so they never delay killing the
//! node, and each write is retried until it succeeds.

use crate::paths::{BackupDir, TOOL_NAME};
use crate::state::SigningState;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handles to the two in-flight report writers.
pub struct ReportWriters {
    pub mismatch: JoinHandle<PathBuf>,
    pub urgent: JoinHandle<PathBuf>,
}

impl ReportWriters {
    /// Wait for both reports to land. Returns `(mismatch, urgent)` paths.
    pub async fn join(self) -> Result<(PathBuf, PathBuf), tokio::task::JoinError> {
        Ok((self.mismatch.await?, self.urgent.await?))
    }
}

pub fn spawn_reports(
    previous: &SigningState,
    recent: &SigningState,
    backup_dir: &BackupDir,
    urgent_path: PathBuf,
    retry: Duration,
) -> ReportWriters {
    let mismatch_path = backup_dir.mismatch_report(Utc::now());
    let mismatch = tokio::spawn(write_until_ok(
        mismatch_path,
        mismatch_content(previous, recent),
        retry,
    ));
    let urgent = tokio::spawn(write_until_ok(
        urgent_path,
        urgent_content(previous, recent, backup_dir.root()),
        retry,
    ));
    ReportWriters { mismatch, urgent }
}

fn mismatch_content(previous: &SigningState, recent: &SigningState) -> String {
    format!(
        "Previous state:\n{}\n\nRecent state:\n{}\n",
        previous.display_json(),
        recent.display_json()
    )
}

fn urgent_content(previous: &SigningState, recent: &SigningState, backup_root: &Path) -> String {
    format!(
        "\n{TOOL_NAME} detected a mismatch in priv_validator_state.json content, currently executing killing the node!!!\n\
         \n\
         Previous state:\n{}\n\
         \n\
         Recent state:\n{}\n\
         \n\
         How to recover:\n\
         - Fix your problem in priv_validator_state.json, can check latest backup at {}\n\
         - Stop this auto-backup service\n\
         - Restart the node\n\
         - Restart this auto-backup service\n",
        previous.display_json(),
        recent.display_json(),
        backup_root.display()
    )
}

async fn write_until_ok(path: PathBuf, content: String, retry: Duration) -> PathBuf {
    loop {
        match tokio::fs::write(&path, &content).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), "report written");
                return path;
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to write report");
                tokio::time::sleep(retry).await;
            }
        }
    }
}
