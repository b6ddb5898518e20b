//! Advisory lock: prevents two tool instances from operating on the same
//! node directory concurrently.
//!
//! The lock is a small JSON file (`.pvguard.lock`) inside the locked
//! directory naming the owning instance and an expiry. A held lock is kept
//! alive by a background refresher that rewrites the expiry every quarter of
//! the extension interval. Expired locks count as free, so a crashed holder
//! stops blocking others once its TTL runs out.

use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const LOCK_UNTIL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Name of the lock file placed inside a locked directory.
pub fn lock_file_name() -> String {
    format!(".{}.lock", crate::paths::TOOL_NAME)
}

/// On-disk lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub instance_id: String,
    pub lock_until: String,
}

impl LockRecord {
    fn new(instance_id: &str, until: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            lock_until: until.format(LOCK_UNTIL_FORMAT).to_string(),
        }
    }

    pub fn until(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.lock_until, LOCK_UNTIL_FORMAT)
            .ok()
            .map(|t| t.and_utc())
    }
}

/// What a lock file currently says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Expired(LockRecord),
    Held {
        record: LockRecord,
        until: DateTime<Utc>,
    },
}

#[derive(Debug)]
pub enum LockError {
    /// Another instance holds an unexpired lock.
    HeldByOther {
        instance_id: String,
        until: DateTime<Utc>,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The lock file exists but is not a valid record.
    Invalid { path: PathBuf, reason: String },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::HeldByOther { instance_id, until } => {
                let left = (*until - Utc::now()).num_seconds().max(0);
                write!(
                    f,
                    "lock is already acquired by another instance {instance_id} until {} ({left}s left)",
                    until.format(LOCK_UNTIL_FORMAT)
                )
            }
            LockError::Read { path, source } => {
                write!(f, "failed to read lock file {}: {}", path.display(), source)
            }
            LockError::Invalid { path, reason } => {
                write!(f, "lock file {} is invalid: {}", path.display(), reason)
            }
            LockError::Write { path, source } => {
                write!(f, "failed to write lock file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Read { source, .. } | LockError::Write { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Process-wide owner of advisory locks.
///
/// Construct once at startup and hand out locks from it. It carries the
/// instance ID shared by every lock this process takes, and serializes lock
/// file I/O between those locks so one lock's refresh can't interleave with
/// another's read-then-write acquire.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<ManagerState>,
}

struct ManagerState {
    instance_id: String,
    io: RwLock<()>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_instance_id(generate_instance_id())
    }

    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ManagerState {
                instance_id: instance_id.into(),
                io: RwLock::new(()),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// A not-yet-acquired lock on `dir`, refreshed every `extend / 4` once held.
    pub fn lock(&self, dir: impl Into<PathBuf>, extend: Duration) -> AdvisoryLock {
        AdvisoryLock {
            manager: self.inner.clone(),
            lock_file: dir.into().join(lock_file_name()),
            extend,
            acquired: false,
            signal: Arc::new(StopSignal::default()),
            refresher: None,
        }
    }

    /// Current lock state of `dir`, for display.
    pub fn status(&self, dir: &Path) -> Result<LockStatus, LockError> {
        let _guard = self.inner.io.read().unwrap_or_else(PoisonError::into_inner);
        read_status(&dir.join(lock_file_name()))
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct StopSignal {
    aborted: AtomicBool,
    notify: Notify,
}

/// A lock on one directory. See the module docs.
pub struct AdvisoryLock {
    manager: Arc<ManagerState>,
    lock_file: PathBuf,
    extend: Duration,
    acquired: bool,
    signal: Arc<StopSignal>,
    refresher: Option<JoinHandle<()>>,
}

impl AdvisoryLock {
    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    /// Take the lock and start the background refresher.
    ///
    /// Fails without retrying when another instance holds an unexpired lock.
    /// Must be called from within a tokio runtime.
    ///
    /// # Panics
    ///
    /// If called a second time on the same lock.
    pub fn acquire(&mut self) -> Result<(), LockError> {
        assert!(!self.acquired, "advisory lock can not be acquired twice");

        {
            let _guard = self
                .manager
                .io
                .write()
                .unwrap_or_else(PoisonError::into_inner);

            if let LockStatus::Held { record, until } = read_status(&self.lock_file)? {
                if record.instance_id != self.manager.instance_id {
                    return Err(LockError::HeldByOther {
                        instance_id: record.instance_id,
                        until,
                    });
                }
            }

            write_record(&self.lock_file, &self.manager.instance_id, self.extend)?;
        }

        self.acquired = true;
        self.refresher = Some(tokio::spawn(refresh_loop(
            self.manager.clone(),
            self.lock_file.clone(),
            self.extend,
            self.signal.clone(),
        )));

        tracing::debug!(
            path = %self.lock_file.display(),
            instance_id = %self.manager.instance_id,
            "acquired advisory lock"
        );
        Ok(())
    }

    /// Ask the refresher to stop and delete the lock file. Idempotent and
    /// non-blocking; use [`join`](Self::join) to wait for the deletion.
    pub fn release(&self) {
        self.signal.aborted.store(true, Ordering::SeqCst);
        self.signal.notify.notify_one();
    }

    /// Wait until the refresher has exited.
    pub async fn join(&mut self) {
        if let Some(handle) = self.refresher.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "advisory lock refresher failed");
            }
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if self.acquired {
            self.release();
        }
    }
}

async fn refresh_loop(
    manager: Arc<ManagerState>,
    lock_file: PathBuf,
    extend: Duration,
    signal: Arc<StopSignal>,
) {
    let period = extend / 4;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = signal.notify.notified() => {}
        }

        let _guard = manager.io.write().unwrap_or_else(PoisonError::into_inner);

        if signal.aborted.load(Ordering::SeqCst) {
            match std::fs::remove_file(&lock_file) {
                Ok(()) => {
                    tracing::debug!(path = %lock_file.display(), "released advisory lock");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %lock_file.display(), error = %e, "failed to remove lock file");
                }
            }
            return;
        }

        if let Err(e) = write_record(&lock_file, &manager.instance_id, extend) {
            tracing::error!(error = %e, "failed to extend advisory lock");
        }
    }
}

fn write_record(path: &Path, instance_id: &str, extend: Duration) -> Result<(), LockError> {
    let extend = chrono::Duration::from_std(extend).unwrap_or_else(|_| chrono::Duration::days(1));
    let until = Utc::now() + extend;
    let record = LockRecord::new(instance_id, until);
    let bytes = serde_json::to_vec(&record).map_err(|e| LockError::Write {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    std::fs::write(path, bytes).map_err(|e| LockError::Write {
        path: path.to_path_buf(),
        source: e,
    })
}

fn read_status(path: &Path) -> Result<LockStatus, LockError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockStatus::Free),
        Err(e) => {
            return Err(LockError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let invalid = |reason: String| LockError::Invalid {
        path: path.to_path_buf(),
        reason,
    };

    let record: LockRecord = serde_json::from_slice(&bytes).map_err(|e| invalid(e.to_string()))?;
    if record.instance_id.is_empty() || record.lock_until.is_empty() {
        return Err(invalid("missing instance_id or lock_until".to_string()));
    }
    let until = record
        .until()
        .ok_or_else(|| invalid(format!("unparseable lock_until {:?}", record.lock_until)))?;

    if until < Utc::now() {
        Ok(LockStatus::Expired(record))
    } else {
        Ok(LockStatus::Held { record, until })
    }
}

/// `<datetime>_<unix nanos>_<random hex>`, unique per process lifetime.
fn generate_instance_id() -> String {
    let now = Utc::now();
    let nanos = now.timestamp_nanos_opt().unwrap_or_default();
    let random: u128 = rand::thread_rng().gen();
    format!("{}_{nanos}_{random:032x}", now.format(LOCK_UNTIL_FORMAT))
}
