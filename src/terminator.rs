//! Finds and force-kills the node's processes.
//!
//! Every matched process is hit twice: a direct SIGKILL and a batched
//! `kill -9` run through the shell. Either channel may fail on its own, so
//! both are always attempted.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Command;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// One entry of the host's process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmd: Vec<String>,
}

impl ProcessInfo {
    pub fn cmdline(&self) -> String {
        self.cmd.join(" ")
    }
}

#[derive(Debug)]
pub enum TerminatorError {
    ListProcesses(String),
    Spawn(std::io::Error),
    ShellFailed(std::process::ExitStatus),
    Signal { pid: u32, source: nix::Error },
}

impl std::fmt::Display for TerminatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminatorError::ListProcesses(reason) => {
                write!(f, "failed to list processes: {reason}")
            }
            TerminatorError::Spawn(e) => write!(f, "failed to start kill -9 command: {e}"),
            TerminatorError::ShellFailed(status) => write!(f, "kill -9 command {status}"),
            TerminatorError::Signal { pid, source } => {
                write!(f, "failed to kill {pid}: {source}")
            }
        }
    }
}

impl std::error::Error for TerminatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TerminatorError::Spawn(e) => Some(e),
            TerminatorError::Signal { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Access to the process table and the two kill channels.
pub trait ProcessTable {
    fn list(&mut self) -> Result<Vec<ProcessInfo>, TerminatorError>;

    /// Direct kill of one process.
    fn kill(&mut self, pid: u32) -> Result<(), TerminatorError>;

    /// One shell invocation running `kill -9` for every pid.
    fn force_kill_batch(&mut self, pids: &[u32]) -> Result<(), TerminatorError>;

    fn matches(&self, process: &ProcessInfo, binary_name: &str) -> bool {
        is_node_process(process, binary_name)
    }
}

/// A process is the node if it mentions `binary_name` and carries the
/// `start` subcommand.
///
/// The joined command line is checked first; because process APIs don't
/// agree on how argv is joined, individual argv tokens are scanned when that
/// is inconclusive. An exact process-name match counts as mentioning the
/// binary.
pub fn is_node_process(process: &ProcessInfo, binary_name: &str) -> bool {
    let cmdline = process.cmdline();

    let mut same_name = false;
    let mut has_start = false;

    if cmdline.contains(binary_name) && cmdline.contains(" start") {
        same_name = true;
        has_start = true;
    }
    if !same_name && process.name == binary_name {
        same_name = true;
    }
    if !has_start && cmdline.contains(" start") {
        has_start = true;
    }

    if !same_name || !has_start {
        for arg in &process.cmd {
            if arg.contains(binary_name) && arg.contains(" start") {
                same_name = true;
                has_start = true;
            }
            if !same_name && arg.contains(binary_name) {
                same_name = true;
            }
            if !has_start && arg.contains("start") {
                has_start = true;
            }
            if same_name && has_start {
                break;
            }
        }
    }

    same_name && has_start
}

/// The real host process table.
pub struct SystemProcessTable {
    system: System,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn list(&mut self) -> Result<Vec<ProcessInfo>, TerminatorError> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        let own_pid = std::process::id();

        let processes: Vec<ProcessInfo> = self
            .system
            .processes()
            .iter()
            .map(|(pid, p)| ProcessInfo {
                pid: pid.as_u32(),
                name: p.name().to_string_lossy().into_owned(),
                cmd: p
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect(),
            })
            .collect();

        if processes.is_empty() {
            return Err(TerminatorError::ListProcesses(
                "process table is empty".to_string(),
            ));
        }
        Ok(processes.into_iter().filter(|p| p.pid != own_pid).collect())
    }

    fn kill(&mut self, pid: u32) -> Result<(), TerminatorError> {
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
            .map_err(|source| TerminatorError::Signal { pid, source })
    }

    fn force_kill_batch(&mut self, pids: &[u32]) -> Result<(), TerminatorError> {
        let script = kill_script(pids);
        tracing::info!("{script}");
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(&script)
            .status()
            .map_err(TerminatorError::Spawn)?;
        if status.success() {
            Ok(())
        } else {
            Err(TerminatorError::ShellFailed(status))
        }
    }
}

/// `kill -9 1 ; kill -9 2`
fn kill_script(pids: &[u32]) -> String {
    pids.iter()
        .map(|pid| format!("kill -9 {pid}"))
        .collect::<Vec<_>>()
        .join(" ; ")
}

/// Why the terminator is being called; only changes how loudly an empty
/// match is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    /// Waiting out a snapshot restore. The node being down is expected.
    Restore,
    /// Signing state regressed. Finding nothing to kill is worth an error.
    Fatal,
}

pub struct ProcessTerminator<T> {
    table: T,
    binary_name: String,
    killed_total: u64,
}

impl<T: ProcessTable> ProcessTerminator<T> {
    pub fn new(table: T, binary_name: impl Into<String>) -> Self {
        Self {
            table,
            binary_name: binary_name.into(),
            killed_total: 0,
        }
    }

    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    /// Processes killed without error since the last
    /// [`reset_killed_total`](Self::reset_killed_total).
    pub fn killed_total(&self) -> u64 {
        self.killed_total
    }

    pub fn reset_killed_total(&mut self) {
        self.killed_total = 0;
    }

    /// Kill every process matching the binary.
    ///
    /// Returns `true` when the caller should retry quickly: nothing matched,
    /// or the process table couldn't be read. Returns `false` once kills were
    /// issued, meaning the caller should give them time to land.
    pub fn kill_matching(&mut self, urgency: Urgency) -> bool {
        let processes = match self.table.list() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to get processes");
                return true;
            }
        };

        let pids: Vec<u32> = processes
            .iter()
            .filter(|p| self.table.matches(p, &self.binary_name))
            .map(|p| p.pid)
            .collect();

        if pids.is_empty() {
            if urgency == Urgency::Fatal && self.killed_total == 0 {
                tracing::error!(binary = %self.binary_name, "no process found to be killed");
            } else {
                tracing::debug!(binary = %self.binary_name, "no matching process");
            }
            return true;
        }

        let mut any_error = false;

        for &pid in &pids {
            tracing::warn!(pid, "killing");
            if let Err(e) = self.table.kill(pid) {
                any_error = true;
                tracing::error!(error = %e, "direct kill failed");
            }
        }

        if let Err(e) = self.table.force_kill_batch(&pids) {
            any_error = true;
            tracing::error!(error = %e, "kill -9 failed");
        }

        if !any_error {
            self.killed_total += pids.len() as u64;
        }
        tracing::info!(total = self.killed_total, "total killed processes");

        false
    }
}
