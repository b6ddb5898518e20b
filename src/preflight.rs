use crate::paths::{BackupDir, NodeHome};
use nix::unistd::{Uid, User};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Warn,
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    pub fn has_fatal(&self) -> bool {
        self.checks.iter().any(|c| c.severity == Severity::Fatal)
    }

    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.checks
            .iter()
            .filter(|c| c.severity == Severity::Warn)
            .collect()
    }

    pub fn fatals(&self) -> Vec<&CheckResult> {
        self.checks
            .iter()
            .filter(|c| c.severity == Severity::Fatal)
            .collect()
    }

    fn fatal(&mut self, name: &'static str, message: String) {
        self.checks.push(CheckResult {
            name,
            severity: Severity::Fatal,
            message,
        });
    }

    fn warn(&mut self, name: &'static str, message: String) {
        self.checks.push(CheckResult {
            name,
            severity: Severity::Warn,
            message,
        });
    }
}

/// The account the tool runs as.
#[derive(Debug, Clone)]
pub struct Operator {
    pub name: String,
    pub home: PathBuf,
    pub is_root: bool,
}

#[derive(Debug)]
pub enum OperatorError {
    Lookup { uid: Uid, source: nix::Error },
    NoPasswdEntry(Uid),
}

impl std::fmt::Display for OperatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatorError::Lookup { uid, source } => {
                write!(f, "failed to get current user (uid {uid}): {source}")
            }
            OperatorError::NoPasswdEntry(uid) => write!(f, "no passwd entry for uid {uid}"),
        }
    }
}

impl std::error::Error for OperatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OperatorError::Lookup { source, .. } => Some(source),
            OperatorError::NoPasswdEntry(_) => None,
        }
    }
}

impl Operator {
    pub fn current() -> Result<Self, OperatorError> {
        let uid = Uid::effective();
        let user = User::from_uid(uid)
            .map_err(|source| OperatorError::Lookup { uid, source })?
            .ok_or(OperatorError::NoPasswdEntry(uid))?;
        Ok(Self {
            name: user.name,
            home: user.dir,
            is_root: uid.is_root(),
        })
    }
}

/// What the watchdog needs before it may start.
pub struct WatchTarget<'a> {
    pub operator: &'a Operator,
    pub node_home: &'a NodeHome,
    pub binary: &'a Path,
    pub backup_dir: &'a BackupDir,
}

/// File name of the binary to kill, e.g. `gaiad` for `/home/val/go/bin/gaiad`.
pub fn binary_name(binary: &Path) -> Option<String> {
    binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
}

/// Validate the setup. Creates the backup directory when it's missing.
pub fn run_preflight(target: &WatchTarget<'_>) -> PreflightReport {
    let mut report = PreflightReport::default();

    if target.operator.is_root {
        report.fatal("not_root", "this action should not be run as root".to_string());
    }

    check_node_home(&mut report, target.node_home, &target.operator.home);
    check_binary(&mut report, target.binary);

    match target.backup_dir.ensure_exists() {
        Ok(true) => {
            tracing::info!(path = %target.backup_dir.root().display(), "created backup directory");
        }
        Ok(false) => {}
        Err(e) => report.fatal(
            "backup_dir",
            format!(
                "failed to create backup directory at {}: {e}",
                target.backup_dir.root().display()
            ),
        ),
    }

    report
}

fn check_node_home(report: &mut PreflightReport, node_home: &NodeHome, user_home: &Path) {
    let root = node_home.root();

    if !root.is_absolute() {
        report.fatal(
            "node_home",
            format!(
                "node home directory must be absolute path, eg: /home/user/.nodeHome (got '{}')",
                root.display()
            ),
        );
        return;
    }
    if !root.starts_with(user_home) {
        report.fatal(
            "node_home",
            format!(
                "node home directory must be under user home directory: {}",
                user_home.display()
            ),
        );
    }
    if !root.is_dir() {
        report.fatal(
            "node_home",
            format!("node home directory does not exist: {}", root.display()),
        );
        return;
    }
    for dir in [node_home.config_dir(), node_home.data_dir()] {
        if !dir.is_dir() {
            report.fatal(
                "node_home",
                format!(
                    "'{}' does not look like a node home, missing {}",
                    root.display(),
                    dir.display()
                ),
            );
        }
    }
    if node_home.data_dir().is_dir() && !node_home.state_file().exists() {
        report.warn(
            "state_file",
            format!(
                "{} does not exist yet, waiting for the node to create it",
                node_home.state_file().display()
            ),
        );
    }
}

fn check_binary(report: &mut PreflightReport, binary: &Path) {
    if binary.as_os_str().is_empty() {
        report.fatal("binary", "required flag --binary".to_string());
        return;
    }
    if !binary.is_absolute() {
        let name = binary_name(binary).unwrap_or_default();
        report.fatal(
            "binary",
            format!("binary must be absolute path, eg: /home/user/go/bin/{name}"),
        );
        return;
    }
    match std::fs::metadata(binary) {
        Ok(meta) if meta.is_dir() => report.fatal(
            "binary",
            format!("specified binary path is a directory: {}", binary.display()),
        ),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.fatal(
            "binary",
            format!("binary file does not exist: {}", binary.display()),
        ),
        Err(e) => report.fatal(
            "binary",
            format!("failed to check binary file {}: {e}", binary.display()),
        ),
    }
}
