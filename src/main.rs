mod config;
mod lock;
mod logging;
mod paths;
mod preflight;
mod report;
mod retention;
mod setup_guide;
mod state;
mod terminator;
mod watchdog;

use clap::{Args, Parser, Subcommand};
use config::{CliOverrides, GuardConfig};
use lock::{LockError, LockManager, LockStatus};
use paths::{BackupDir, NodeHome};
use preflight::{Operator, WatchTarget};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Watchdog for a validator's priv_validator_state.json: keeps rolling
/// backups and kills the node before it can double-sign.
#[derive(Parser, Debug)]
#[command(name = "pvguard", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = "pvguard.toml")]
    config: PathBuf,

    /// Extra logging (retention, lock refreshes, state advances)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Designed to run as a service: back up priv_validator_state.json and
    /// kill the node if its content decreases
    #[command(
        name = "auto-backup-pvs",
        visible_aliases = ["auto-backup-priv-validator-state", "auto-backup-priv-validator-state-json"]
    )]
    AutoBackupPvs(WatchArgs),
    /// Print how to run auto-backup-pvs as a systemd service
    SetupGuide {
        #[command(flatten)]
        watch: WatchArgs,

        /// Chain name shown in the unit description (e.g. "Cosmos Hub")
        #[arg(long)]
        chain_name: String,

        /// Mainnet or Testnet
        #[arg(long)]
        network: String,
    },
    /// Show who holds the advisory lock on a directory
    LockStatus {
        /// Directory to inspect (usually a node home)
        dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Node home directory, e.g. /home/user/.gaia
    node_home: PathBuf,

    /// Absolute path of the chain binary to kill when priv_validator_state.json has a problem
    #[arg(long)]
    binary: PathBuf,

    /// Keep backups of the last N states (minimum 3)
    #[arg(long)]
    keep: Option<usize>,

    /// Backup directory (overrides config)
    #[arg(long)]
    backup_dir: Option<PathBuf>,
}

impl WatchArgs {
    fn to_overrides(&self) -> CliOverrides {
        CliOverrides {
            keep_recent: self.keep,
            backup_dir: self.backup_dir.clone(),
        }
    }
}

/// Everything resolved and validated before the watchdog may start.
struct Prepared {
    config: GuardConfig,
    operator: Operator,
    node_home: NodeHome,
    backup_dir: BackupDir,
    binary_name: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    tracing::debug!(?cli, "parsed CLI arguments");

    match &cli.command {
        Commands::LockStatus { dir } => {
            if let Err(e) = print_lock_status(dir) {
                exit_with_error(&format!("failed to read lock: {e}"));
            }
        }
        Commands::SetupGuide {
            watch,
            chain_name,
            network,
        } => {
            let prepared = prepare(&cli.config, watch);
            let guide = setup_guide::render(&setup_guide::GuideParams {
                chain_name,
                network,
                user: &prepared.operator.name,
                node_home: prepared.node_home.root(),
                binary: &watch.binary,
                keep_recent: retention::clamp_keep_recent(prepared.config.watchdog.keep_recent),
            });
            println!("{guide}");
        }
        Commands::AutoBackupPvs(watch) => {
            let prepared = prepare(&cli.config, watch);
            run_watchdog(prepared).await;
        }
    }
}

/// Load config, apply CLI overrides and run preflight. Exits on any problem.
fn prepare(config_path: &Path, args: &WatchArgs) -> Prepared {
    let mut config = match GuardConfig::load(config_path) {
        Ok(c) => c,
        Err(e) => exit_with_error(&format!("configuration error: {e}")),
    };
    config.apply_cli_overrides(&args.to_overrides());
    tracing::debug!(?config, "resolved configuration");

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("invalid configuration: {err}");
        }
        std::process::exit(1);
    }
    config.warn_adjusted();

    let operator = match Operator::current() {
        Ok(o) => o,
        Err(e) => exit_with_error(&e.to_string()),
    };

    let node_home = NodeHome::new(&args.node_home);
    let backup_dir = match &config.paths.backup_dir {
        Some(dir) => BackupDir::new(dir),
        None => BackupDir::default_for_home(&operator.home),
    };

    let report = preflight::run_preflight(&WatchTarget {
        operator: &operator,
        node_home: &node_home,
        binary: &args.binary,
        backup_dir: &backup_dir,
    });
    for check in report.warnings() {
        tracing::warn!(check = check.name, "{}", check.message);
    }
    if report.has_fatal() {
        for check in report.fatals() {
            tracing::error!(check = check.name, "{}", check.message);
        }
        std::process::exit(1);
    }

    let Some(binary_name) = preflight::binary_name(&args.binary) else {
        exit_with_error(&format!("invalid binary path: {}", args.binary.display()));
    };

    Prepared {
        config,
        operator,
        node_home,
        backup_dir,
        binary_name,
    }
}

async fn run_watchdog(prepared: Prepared) {
    let Prepared {
        config,
        operator,
        node_home,
        backup_dir,
        binary_name,
    } = prepared;

    tracing::info!(path = %backup_dir.root().display(), "backup directory");
    tracing::info!(
        keep_recent = retention::clamp_keep_recent(config.watchdog.keep_recent),
        "keep backup of the most recent states"
    );
    tracing::info!(binary = %binary_name, "binary to kill");
    tracing::info!(path = %node_home.state_file().display(), "priv_validator_state.json file path");

    let locks = LockManager::new();
    let mut node_lock = locks.lock(node_home.root(), config.lock.extend());
    if let Err(e) = node_lock.acquire() {
        exit_with_error(&format!("failed to acquire lock on node home: {e}"));
    }
    tracing::info!(
        path = %node_lock.lock_file().display(),
        instance_id = %locks.instance_id(),
        "acquired lock on node home"
    );

    let urgent_report = config
        .paths
        .urgent_report
        .clone()
        .unwrap_or_else(|| paths::urgent_report_path(&operator.home));
    let retention = retention::BackupRetention::new(backup_dir, config.watchdog.keep_recent);
    let terminator = terminator::ProcessTerminator::new(
        terminator::SystemProcessTable::new(),
        binary_name,
    );

    let mut watchdog = match watchdog::Watchdog::new(
        node_home.state_file(),
        retention,
        terminator,
        urgent_report,
        config.watchdog.timing(),
    ) {
        Ok(w) => w,
        Err(e) => {
            node_lock.release();
            node_lock.join().await;
            exit_with_error(&format!("failed to load latest backup: {e}"));
        }
    };

    tokio::select! {
        _ = watchdog.run() => {}
        _ = shutdown_signal() => {}
    }
    tracing::warn!(
        phase = ?watchdog.phase(),
        killed = watchdog.terminator().killed_total(),
        "shutdown requested, stopping watchdog"
    );

    if let Some(reports) = watchdog.take_reports() {
        match tokio::time::timeout(Duration::from_secs(5), reports.join()).await {
            Ok(Ok((mismatch, urgent))) => tracing::info!(
                mismatch = %mismatch.display(),
                urgent = %urgent.display(),
                "incident reports written"
            ),
            Ok(Err(e)) => tracing::error!(error = %e, "incident report writer failed"),
            Err(_) => tracing::error!("incident reports still not written, giving up"),
        }
    }

    node_lock.release();
    node_lock.join().await;
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

fn print_lock_status(dir: &Path) -> Result<(), LockError> {
    match LockManager::new().status(dir)? {
        LockStatus::Free => println!("{}: not locked", dir.display()),
        LockStatus::Expired(record) => println!(
            "{}: lock of instance {} expired at {}",
            dir.display(),
            record.instance_id,
            record.lock_until
        ),
        LockStatus::Held { record, until } => println!(
            "{}: locked by instance {} until {} ({}s left)",
            dir.display(),
            record.instance_id,
            record.lock_until,
            (until - chrono::Utc::now()).num_seconds().max(0)
        ),
    }
    Ok(())
}

fn exit_with_error(message: &str) -> ! {
    tracing::error!("{message}");
    std::process::exit(1);
}
