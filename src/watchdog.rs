//! Signing-state watchdog.
//!
//! Polls the node's `priv_validator_state.json` and compares every read
//! against the last state confirmed as forward progress:
//!
//! - unchanged: nothing to do
//! - advanced: back it up, move the "latest" pointer, carry on
//! - regressed to the empty state: a snapshot restore is in progress; keep
//!   the node down until the file has content again
//! - regressed otherwise: the node would double-sign. Write incident reports
//!   and kill the node forever
//!
//! The last case is terminal: once in [`Phase::Fatal`] the watchdog does
//! nothing but kill the node until a human stops it.

use crate::config::Timing;
use crate::logging::FATAL_TARGET;
use crate::report::{spawn_reports, ReportWriters};
use crate::retention::BackupRetention;
use crate::state::{SigningState, StateError};
use crate::terminator::{ProcessTable, ProcessTerminator, Urgency};
use std::cmp::Ordering;
use std::path::PathBuf;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Normal polling.
    Watching,
    /// The state file was emptied; keeping the node down until it's refilled.
    Restoring,
    /// The state regressed. No way out.
    Fatal,
}

/// What a single [`Watchdog::cycle`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The live file couldn't be read; retried next cycle.
    ReadFailed,
    Unchanged,
    Advanced,
    /// Entered, or still in, the restore wait.
    Restoring,
    /// The restore wait ended; the next poll runs immediately.
    Restored,
    Fatal,
}

/// How a fresh read relates to the last confirmed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Same height/round/step. `different_signs` flags a signature change at
    /// that position, which is logged but not acted on.
    Unchanged { different_signs: bool },
    Advanced,
    RegressedEmpty,
    RegressedFatal,
}

pub fn classify(latest_known: &SigningState, recent: &SigningState) -> Classification {
    let cmp = latest_known.compare(recent);
    match cmp.ordering {
        Ordering::Equal => Classification::Unchanged {
            different_signs: cmp.different_signs,
        },
        Ordering::Less => Classification::Advanced,
        Ordering::Greater if recent.is_empty() => Classification::RegressedEmpty,
        Ordering::Greater => Classification::RegressedFatal,
    }
}

pub struct Watchdog<T> {
    state_file: PathBuf,
    retention: BackupRetention,
    terminator: ProcessTerminator<T>,
    urgent_report: PathBuf,
    timing: Timing,
    latest_known: SigningState,
    phase: Phase,
    last_poll: Option<Instant>,
    reports: Option<ReportWriters>,
    sign_mismatch_seen: Option<SigningState>,
}

impl<T: ProcessTable> Watchdog<T> {
    /// Seeds the last confirmed state from the "latest" backup pointer, or
    /// the empty state when there is none. A corrupt pointer is an error.
    pub fn new(
        state_file: PathBuf,
        retention: BackupRetention,
        terminator: ProcessTerminator<T>,
        urgent_report: PathBuf,
        timing: Timing,
    ) -> Result<Self, StateError> {
        let latest_known = retention.load_latest()?.unwrap_or_else(SigningState::empty);
        tracing::info!(
            "latest state from backup:\n{}",
            latest_known.display_json()
        );
        Ok(Self {
            state_file,
            retention,
            terminator,
            urgent_report,
            timing,
            latest_known,
            phase: Phase::Watching,
            last_poll: None,
            reports: None,
            sign_mismatch_seen: None,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn latest_known(&self) -> &SigningState {
        &self.latest_known
    }

    pub fn terminator(&self) -> &ProcessTerminator<T> {
        &self.terminator
    }

    /// Handles to the incident report writers, once the state has regressed.
    pub fn take_reports(&mut self) -> Option<ReportWriters> {
        self.reports.take()
    }

    /// Run forever.
    pub async fn run(&mut self) {
        tracing::info!(
            state_file = %self.state_file.display(),
            binary = %self.terminator.binary_name(),
            keep_recent = self.retention.keep_recent(),
            "watching signing state"
        );
        loop {
            if self.phase == Phase::Watching {
                self.wait_for_next_poll().await;
            }
            self.cycle().await;
        }
    }

    /// One step of the current phase.
    pub async fn cycle(&mut self) -> CycleOutcome {
        match self.phase {
            Phase::Watching => self.poll(),
            Phase::Restoring => self.restore_step().await,
            Phase::Fatal => {
                self.fatal_step().await;
                CycleOutcome::Fatal
            }
        }
    }

    /// Make the next poll fire without waiting.
    pub fn fast_forward(&mut self) {
        self.last_poll = None;
    }

    /// Sleep in `poll_step` increments until `poll_interval` has passed since
    /// the previous poll.
    async fn wait_for_next_poll(&mut self) {
        if let Some(last) = self.last_poll {
            while last.elapsed() < self.timing.poll_interval {
                sleep(self.timing.poll_step).await;
            }
        }
        self.last_poll = Some(Instant::now());
    }

    fn read_live(&self) -> Result<SigningState, StateError> {
        SigningState::load(&self.state_file)
    }

    fn poll(&mut self) -> CycleOutcome {
        let recent = match self.read_live() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to load priv_validator_state.json");
                return CycleOutcome::ReadFailed;
            }
        };

        match classify(&self.latest_known, &recent) {
            Classification::Unchanged { different_signs } => {
                if different_signs {
                    self.note_sign_mismatch(&recent);
                }
                CycleOutcome::Unchanged
            }
            Classification::Advanced => {
                self.record(&recent);
                if let Err(e) = self.retention.update_latest(&recent) {
                    tracing::error!(error = %e, "failed to save latest backup");
                }
                tracing::debug!(
                    height = recent.height,
                    round = recent.round,
                    step = recent.step,
                    "state advanced"
                );
                self.latest_known = recent;
                CycleOutcome::Advanced
            }
            Classification::RegressedEmpty => {
                self.record(&recent);
                tracing::warn!("detected state file is empty, possibly restoring snapshot");
                tracing::warn!(
                    binary = %self.terminator.binary_name(),
                    "attempts to kill the node binary while waiting content to be restored"
                );
                self.terminator.reset_killed_total();
                self.phase = Phase::Restoring;
                CycleOutcome::Restoring
            }
            Classification::RegressedFatal => {
                self.record(&recent);
                self.enter_fatal(recent);
                CycleOutcome::Fatal
            }
        }
    }

    fn record(&mut self, state: &SigningState) {
        if let Err(e) = self.retention.record(state) {
            tracing::error!(error = %e, "failed to save backup file");
        }
    }

    fn note_sign_mismatch(&mut self, recent: &SigningState) {
        // TODO: decide whether a signature change at an unchanged
        // height/round/step should kill the node; for now it is only logged.
        if self.sign_mismatch_seen.as_ref() == Some(recent) {
            return;
        }
        tracing::warn!(
            height = recent.height,
            round = recent.round,
            step = recent.step,
            "signature changed without height/round/step change"
        );
        self.sign_mismatch_seen = Some(recent.clone());
    }

    /// Kill once and re-read. Leaves the restore wait as soon as the file has
    /// content again, whatever that content is; the next poll classifies it.
    async fn restore_step(&mut self) -> CycleOutcome {
        let skip_sleep = self.terminator.kill_matching(Urgency::Restore);
        sleep(if skip_sleep {
            self.timing.fast_retry
        } else {
            self.timing.recovery_retry
        })
        .await;

        match self.read_live() {
            Ok(recent) if !recent.is_empty() => {
                tracing::info!(
                    height = recent.height,
                    "state file has content again, resuming checks"
                );
                self.phase = Phase::Watching;
                self.fast_forward();
                CycleOutcome::Restored
            }
            Ok(_) => CycleOutcome::Restoring,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to load priv_validator_state.json after killing node"
                );
                sleep(self.timing.fast_retry).await;
                CycleOutcome::Restoring
            }
        }
    }

    fn enter_fatal(&mut self, recent: SigningState) {
        let previous = &self.latest_known;
        tracing::error!(target: FATAL_TARGET, "priv_validator_state.json content decreased");
        tracing::error!(target: FATAL_TARGET, "Previous state:\n{}", previous.display_json());
        tracing::error!(target: FATAL_TARGET, "Recent state:\n{}", recent.display_json());

        self.reports = Some(spawn_reports(
            previous,
            &recent,
            self.retention.dir(),
            self.urgent_report.clone(),
            self.timing.report_retry,
        ));

        tracing::warn!(binary = %self.terminator.binary_name(), "killing the node binary");
        self.terminator.reset_killed_total();
        self.phase = Phase::Fatal;
    }

    async fn fatal_step(&mut self) {
        let skip_sleep = self.terminator.kill_matching(Urgency::Fatal);
        sleep(if skip_sleep {
            self.timing.fast_retry
        } else {
            self.timing.fatal_retry
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::{BackupDir, NodeHome};
    use crate::terminator::tests::{process, FakeTable};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_timing() -> Timing {
        Timing {
            poll_interval: Duration::from_millis(10),
            poll_step: Duration::from_millis(1),
            fast_retry: Duration::from_millis(1),
            recovery_retry: Duration::from_millis(2),
            fatal_retry: Duration::from_millis(2),
            report_retry: Duration::from_millis(5),
        }
    }

    struct Fixture {
        _tmp: TempDir,
        node: NodeHome,
        backup: BackupDir,
        urgent: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let node = NodeHome::new(tmp.path().join("node"));
            std::fs::create_dir_all(node.data_dir()).unwrap();
            let backup = BackupDir::new(tmp.path().join("backup"));
            backup.ensure_exists().unwrap();
            let urgent = tmp.path().join("FATAL.txt");
            Self {
                _tmp: tmp,
                node,
                backup,
                urgent,
            }
        }

        fn write_live(&self, state: &SigningState) {
            write_state(&self.node.state_file(), state);
        }

        fn seed_latest(&self, state: &SigningState) {
            state.save(&self.backup.latest()).unwrap();
        }

        fn watchdog(&self, table: FakeTable, keep: usize) -> Watchdog<FakeTable> {
            Watchdog::new(
                self.node.state_file(),
                BackupRetention::new(self.backup.clone(), keep),
                ProcessTerminator::new(table, "gaiad"),
                self.urgent.clone(),
                fast_timing(),
            )
            .unwrap()
        }

        fn history_count(&self) -> usize {
            std::fs::read_dir(self.backup.root())
                .unwrap()
                .flatten()
                .filter(|e| {
                    let name = e.file_name().to_string_lossy().into_owned();
                    name.starts_with("priv_validator_state_") && name.contains("_hrs_")
                })
                .count()
        }
    }

    fn write_state(path: &Path, state: &SigningState) {
        std::fs::write(path, state.to_json().unwrap()).unwrap();
    }

    fn node_table() -> FakeTable {
        FakeTable {
            respawn: true,
            ..FakeTable::with_processes(vec![process(42, "gaiad", &["gaiad", "start"])])
        }
    }

    #[test]
    fn test_classify() {
        let s100 = SigningState::new(100, 0, 1);
        let s101 = SigningState::new(101, 0, 0);
        assert_eq!(classify(&s100, &s101), Classification::Advanced);
        assert_eq!(
            classify(&s101, &s101.clone()),
            Classification::Unchanged {
                different_signs: false
            }
        );
        assert_eq!(
            classify(&s101, &SigningState::empty()),
            Classification::RegressedEmpty
        );
        assert_eq!(classify(&s101, &s100), Classification::RegressedFatal);
        assert_eq!(
            classify(&s101, &SigningState::new(101, 0, 0).with_signature("x", "y")),
            Classification::Unchanged {
                different_signs: true
            }
        );
        assert_eq!(
            classify(&SigningState::empty(), &SigningState::empty()),
            Classification::Unchanged {
                different_signs: false
            }
        );
    }

    #[tokio::test]
    async fn test_seeds_from_latest_pointer() {
        let fx = Fixture::new();
        assert_eq!(
            fx.watchdog(FakeTable::default(), 3).latest_known(),
            &SigningState::empty()
        );

        fx.seed_latest(&SigningState::new(100, 0, 1));
        assert_eq!(
            fx.watchdog(FakeTable::default(), 3).latest_known(),
            &SigningState::new(100, 0, 1)
        );
    }

    #[tokio::test]
    async fn test_corrupt_latest_pointer_is_setup_error() {
        let fx = Fixture::new();
        std::fs::write(fx.backup.latest(), "{").unwrap();
        let result = Watchdog::new(
            fx.node.state_file(),
            BackupRetention::new(fx.backup.clone(), 3),
            ProcessTerminator::new(FakeTable::default(), "gaiad"),
            fx.urgent.clone(),
            fast_timing(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_advance_records_and_updates_latest_without_kill() {
        let fx = Fixture::new();
        fx.seed_latest(&SigningState::new(100, 0, 1));
        let table = node_table();
        let mut watchdog = fx.watchdog(table.clone(), 3);

        fx.write_live(&SigningState::new(101, 0, 0));
        assert_eq!(watchdog.cycle().await, CycleOutcome::Advanced);

        assert_eq!(watchdog.latest_known(), &SigningState::new(101, 0, 0));
        assert_eq!(
            SigningState::load(&fx.backup.latest()).unwrap(),
            SigningState::new(101, 0, 0)
        );
        assert_eq!(fx.history_count(), 1);
        assert_eq!(watchdog.phase(), Phase::Watching);
        assert_eq!(table.log.lock().unwrap().list_calls, 0);

        assert_eq!(watchdog.cycle().await, CycleOutcome::Unchanged);
        assert_eq!(fx.history_count(), 1);
    }

    #[tokio::test]
    async fn test_read_failure_keeps_watching() {
        let fx = Fixture::new();
        let mut watchdog = fx.watchdog(FakeTable::default(), 3);

        assert_eq!(watchdog.cycle().await, CycleOutcome::ReadFailed);
        std::fs::write(fx.node.state_file(), "{\"height\":").unwrap();
        assert_eq!(watchdog.cycle().await, CycleOutcome::ReadFailed);
        assert_eq!(watchdog.phase(), Phase::Watching);

        fx.write_live(&SigningState::new(1, 0, 1));
        assert_eq!(watchdog.cycle().await, CycleOutcome::Advanced);
    }

    #[tokio::test]
    async fn test_signature_change_at_same_position_is_not_fatal() {
        let fx = Fixture::new();
        let signed = SigningState::new(101, 0, 3).with_signature("aaa", "bbb");
        fx.seed_latest(&signed);
        let table = node_table();
        let mut watchdog = fx.watchdog(table.clone(), 3);

        fx.write_live(&SigningState::new(101, 0, 3).with_signature("ccc", "bbb"));
        assert_eq!(watchdog.cycle().await, CycleOutcome::Unchanged);
        assert_eq!(watchdog.cycle().await, CycleOutcome::Unchanged);

        assert_eq!(watchdog.phase(), Phase::Watching);
        assert_eq!(watchdog.latest_known(), &signed);
        assert!(table.log.lock().unwrap().killed.is_empty());
    }

    #[tokio::test]
    async fn test_empty_state_holds_node_down_until_restored() {
        let fx = Fixture::new();
        fx.seed_latest(&SigningState::new(101, 0, 0));
        let state_file = fx.node.state_file();

        // The restore finishes after the node has been killed three times.
        let mut table = node_table();
        let log = table.log.clone();
        table.on_kill = Some(Arc::new(move || {
            if log.lock().unwrap().killed.len() == 3 {
                write_state(&state_file, &SigningState::new(101, 0, 0));
            }
        }));
        let mut watchdog = fx.watchdog(table.clone(), 3);

        fx.write_live(&SigningState::empty());
        assert_eq!(watchdog.cycle().await, CycleOutcome::Restoring);
        assert_eq!(watchdog.phase(), Phase::Restoring);

        let mut steps = 0;
        loop {
            steps += 1;
            assert!(steps < 100, "restore wait never ended");
            match watchdog.cycle().await {
                CycleOutcome::Restoring => continue,
                CycleOutcome::Restored => break,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(table.log.lock().unwrap().killed.len(), 3);
        assert_eq!(watchdog.phase(), Phase::Watching);
        assert_eq!(watchdog.latest_known(), &SigningState::new(101, 0, 0));
        // The empty state never reaches the latest pointer.
        assert_eq!(
            SigningState::load(&fx.backup.latest()).unwrap(),
            SigningState::new(101, 0, 0)
        );
        assert_eq!(watchdog.cycle().await, CycleOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_restore_wait_tolerates_node_already_down() {
        let fx = Fixture::new();
        fx.seed_latest(&SigningState::new(101, 0, 0));
        let table = FakeTable::default();
        let mut watchdog = fx.watchdog(table.clone(), 3);

        fx.write_live(&SigningState::empty());
        assert_eq!(watchdog.cycle().await, CycleOutcome::Restoring);
        for _ in 0..5 {
            assert_eq!(watchdog.cycle().await, CycleOutcome::Restoring);
        }
        assert!(table.log.lock().unwrap().list_calls >= 5);
        assert_eq!(watchdog.terminator().killed_total(), 0);

        fx.write_live(&SigningState::new(102, 0, 1));
        assert_eq!(watchdog.cycle().await, CycleOutcome::Restored);
        assert_eq!(watchdog.cycle().await, CycleOutcome::Advanced);
    }

    #[tokio::test]
    async fn test_regression_reports_and_kills_forever() {
        let fx = Fixture::new();
        fx.seed_latest(&SigningState::new(101, 0, 0));
        let table = node_table();
        let mut watchdog = fx.watchdog(table.clone(), 3);

        fx.write_live(&SigningState::new(100, 0, 2));
        assert_eq!(watchdog.cycle().await, CycleOutcome::Fatal);
        assert_eq!(watchdog.phase(), Phase::Fatal);

        let (mismatch, urgent) = watchdog.take_reports().unwrap().join().await.unwrap();
        assert!(mismatch.starts_with(fx.backup.root()));
        assert!(std::fs::read_to_string(&mismatch).unwrap().contains("\"100\""));
        assert_eq!(urgent, fx.urgent);
        assert!(std::fs::read_to_string(&urgent).unwrap().contains("\"101\""));

        // The latest pointer is never moved backwards.
        assert_eq!(
            SigningState::load(&fx.backup.latest()).unwrap(),
            SigningState::new(101, 0, 0)
        );

        let mut runner = tokio::spawn(async move { watchdog.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let kills_midway = table.log.lock().unwrap().killed.len();

        let still_running = tokio::time::timeout(Duration::from_millis(100), &mut runner).await;
        assert!(still_running.is_err(), "fatal state must never return");
        let kills_later = table.log.lock().unwrap().killed.len();

        assert!(kills_midway > 0);
        assert!(kills_later > kills_midway, "kill attempts must continue");
        runner.abort();
    }

    #[tokio::test]
    async fn test_fatal_is_terminal() {
        let fx = Fixture::new();
        fx.seed_latest(&SigningState::new(101, 0, 0));
        let mut watchdog = fx.watchdog(FakeTable::default(), 3);

        fx.write_live(&SigningState::new(100, 0, 0));
        assert_eq!(watchdog.cycle().await, CycleOutcome::Fatal);

        // Even a healthy-looking state doesn't bring it back.
        fx.write_live(&SigningState::new(500, 0, 0));
        for _ in 0..3 {
            assert_eq!(watchdog.cycle().await, CycleOutcome::Fatal);
        }
        assert_eq!(watchdog.phase(), Phase::Fatal);
        assert_eq!(watchdog.latest_known(), &SigningState::new(101, 0, 0));
    }

    #[tokio::test]
    async fn test_history_bounded_with_clamped_keep() {
        let fx = Fixture::new();
        let mut watchdog = fx.watchdog(FakeTable::default(), 1);
        assert_eq!(watchdog.retention.keep_recent(), 3);

        for height in 1..=6 {
            fx.write_live(&SigningState::new(height, 0, 1));
            assert_eq!(watchdog.cycle().await, CycleOutcome::Advanced);
        }
        assert_eq!(fx.history_count(), 3);
    }

    #[tokio::test]
    async fn test_poll_waits_for_interval_unless_fast_forwarded() {
        let fx = Fixture::new();
        let mut watchdog = fx.watchdog(FakeTable::default(), 3);
        watchdog.timing.poll_interval = Duration::from_millis(100);

        let start = Instant::now();
        watchdog.wait_for_next_poll().await;
        assert!(start.elapsed() < Duration::from_millis(50));

        watchdog.wait_for_next_poll().await;
        assert!(start.elapsed() >= Duration::from_millis(100));

        watchdog.fast_forward();
        let again = Instant::now();
        watchdog.wait_for_next_poll().await;
        assert!(again.elapsed() < Duration::from_millis(50));
    }
}
