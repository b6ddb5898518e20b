use crate::retention::MIN_KEEP_RECENT;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from pvguard.toml.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct GuardConfig {
    pub watchdog: WatchdogConfig,
    pub lock: LockConfig,
    pub paths: PathsConfig,
}

impl GuardConfig {
    /// Load configuration from a TOML file. If the file doesn't exist,
    /// returns compiled defaults. Returns an error only if the file exists
    /// but can't be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// CLI values take precedence over file/default values when present.
    pub fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(keep) = overrides.keep_recent {
            self.watchdog.keep_recent = keep;
        }
        if let Some(ref dir) = overrides.backup_dir {
            self.paths.backup_dir = Some(dir.clone());
        }
    }

    /// Problems that make the config unusable. Empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let w = &self.watchdog;
        for (name, value) in [
            ("watchdog.poll_interval_ms", w.poll_interval_ms),
            ("watchdog.poll_step_ms", w.poll_step_ms),
            ("watchdog.fast_retry_ms", w.fast_retry_ms),
            ("watchdog.recovery_retry_ms", w.recovery_retry_ms),
            ("watchdog.fatal_retry_ms", w.fatal_retry_ms),
            ("watchdog.report_retry_ms", w.report_retry_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }
        if w.poll_step_ms > w.poll_interval_ms {
            errors.push(format!(
                "watchdog.poll_step_ms ({}) must not exceed watchdog.poll_interval_ms ({})",
                w.poll_step_ms, w.poll_interval_ms
            ));
        }
        let refresh = self.lock.refresh_interval();
        if refresh < Duration::from_secs(1) {
            errors.push(format!(
                "lock.extend_secs ({}) gives a {}ms lock refresh interval, must be at least 1s (extend_secs >= 4)",
                self.lock.extend_secs,
                refresh.as_millis()
            ));
        }
        errors
    }

    /// Warn about values that are accepted but adjusted.
    pub fn warn_adjusted(&self) {
        if self.watchdog.keep_recent < MIN_KEEP_RECENT {
            tracing::warn!(
                configured = self.watchdog.keep_recent,
                used = MIN_KEEP_RECENT,
                "watchdog.keep_recent below minimum, raised"
            );
        }
    }
}

/// CLI values that can override config file settings.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub keep_recent: Option<usize>,
    pub backup_dir: Option<PathBuf>,
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatchdogConfig {
    /// History files to keep (never fewer than 3).
    pub keep_recent: usize,
    /// Time between two reads of the live state file.
    pub poll_interval_ms: u64,
    /// Sleep granularity while waiting for the next poll.
    pub poll_step_ms: u64,
    /// Pause after a kill attempt that found nothing to kill.
    pub fast_retry_ms: u64,
    /// Pause after issuing kills while a snapshot restore is in progress.
    pub recovery_retry_ms: u64,
    /// Pause after issuing kills once the state has regressed.
    pub fatal_retry_ms: u64,
    /// Pause between attempts to write an incident report.
    pub report_retry_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            keep_recent: MIN_KEEP_RECENT,
            poll_interval_ms: 200,
            poll_step_ms: 20,
            fast_retry_ms: 5,
            recovery_retry_ms: 100,
            fatal_retry_ms: 300,
            report_retry_ms: 300,
        }
    }
}

impl WatchdogConfig {
    pub fn timing(&self) -> Timing {
        Timing {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            poll_step: Duration::from_millis(self.poll_step_ms),
            fast_retry: Duration::from_millis(self.fast_retry_ms),
            recovery_retry: Duration::from_millis(self.recovery_retry_ms),
            fatal_retry: Duration::from_millis(self.fatal_retry_ms),
            report_retry: Duration::from_millis(self.report_retry_ms),
        }
    }
}

/// Resolved watchdog cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub poll_interval: Duration,
    pub poll_step: Duration,
    pub fast_retry: Duration,
    pub recovery_retry: Duration,
    pub fatal_retry: Duration,
    pub report_retry: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        WatchdogConfig::default().timing()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LockConfig {
    /// Lock TTL; the refresher rewrites it every quarter of this.
    pub extend_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { extend_secs: 8 }
    }
}

impl LockConfig {
    pub fn extend(&self) -> Duration {
        Duration::from_secs(self.extend_secs)
    }

    /// How often a held lock is rewritten.
    pub fn refresh_interval(&self) -> Duration {
        self.extend() / 4
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PathsConfig {
    /// Backup directory; defaults to `~/.backup_priv_validator_state_pvguard`.
    pub backup_dir: Option<PathBuf>,
    /// Urgent report; defaults to
    /// `~/FATAL_REPORT_MISMATCH_PRIV_VALIDATOR_STATE.txt`.
    pub urgent_report: Option<PathBuf>,
}
