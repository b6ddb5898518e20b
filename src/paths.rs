use crate::state::SigningState;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

pub const TOOL_NAME: &str = env!("CARGO_PKG_NAME");

const STATE_PREFIX: &str = "priv_validator_state";
const URGENT_REPORT_FILE: &str = "FATAL_REPORT_MISMATCH_PRIV_VALIDATOR_STATE.txt";

/// Layout of a node's home directory (e.g. `~/.gaia`).
#[derive(Debug, Clone)]
pub struct NodeHome {
    root: PathBuf,
}

impl NodeHome {
    /// Trailing slashes and `.` components are dropped.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into().components().collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// The live signing-state file the node writes.
    pub fn state_file(&self) -> PathBuf {
        self.data_dir().join(format!("{STATE_PREFIX}.json"))
    }
}

/// Manages the backup directory the watchdog writes into.
///
/// Holds the timestamped history files, the single "latest" pointer and the
/// per-incident mismatch reports.
#[derive(Debug, Clone)]
pub struct BackupDir {
    root: PathBuf,
}

impl BackupDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default location under the operator's home directory.
    pub fn default_for_home(user_home: &Path) -> Self {
        Self::new(user_home.join(format!(".backup_{STATE_PREFIX}_{TOOL_NAME}")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The "latest" pointer: the most recent state confirmed as a forward advance.
    pub fn latest(&self) -> PathBuf {
        self.root.join(format!("{STATE_PREFIX}_latest.json"))
    }

    /// History file for `state` captured at `at`, e.g.
    /// `priv_validator_state_2024_05_01_10_00_00_hrs_101_0_3.json`.
    pub fn history_file(&self, at: DateTime<Utc>, state: &SigningState) -> PathBuf {
        self.root.join(format!(
            "{STATE_PREFIX}_{}_hrs_{}_{}_{}.json",
            file_name_timestamp(at),
            state.height,
            state.round,
            state.step
        ))
    }

    pub fn mismatch_report(&self, at: DateTime<Utc>) -> PathBuf {
        self.root
            .join(format!("mismatch_{STATE_PREFIX}_{}.json", file_name_timestamp(at)))
    }

    /// Create the directory (mode 0700) if missing.
    /// Returns Ok(true) if it was created, Ok(false) if it already existed.
    pub fn ensure_exists(&self) -> std::io::Result<bool> {
        match std::fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(false),
            Ok(_) => Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a directory", self.root.display()),
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                use std::os::unix::fs::DirBuilderExt;
                std::fs::DirBuilder::new().mode(0o700).create(&self.root)?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}

/// Fixed-path incident report in the operator's home directory.
pub fn urgent_report_path(user_home: &Path) -> PathBuf {
    user_home.join(URGENT_REPORT_FILE)
}

/// `2024-05-01 10:00:00` rendered as `2024_05_01_10_00_00`.
pub fn file_name_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y_%m_%d_%H_%M_%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_node_home_state_file() {
        let home = NodeHome::new("/home/val/.gaia");
        assert_eq!(
            home.state_file(),
            PathBuf::from("/home/val/.gaia/data/priv_validator_state.json")
        );
        assert_eq!(home.config_dir(), PathBuf::from("/home/val/.gaia/config"));
    }

    #[test]
    fn test_node_home_trims_trailing_slash() {
        let home = NodeHome::new("/home/val/.gaia/");
        assert_eq!(home.root().display().to_string(), "/home/val/.gaia");
        assert_eq!(
            NodeHome::new("/home/val/./.gaia//").root().display().to_string(),
            "/home/val/.gaia"
        );
    }

    #[test]
    fn test_backup_file_names() {
        let dir = BackupDir::new("/b");
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 2, 3).unwrap();

        assert_eq!(
            dir.history_file(at, &SigningState::new(101, 0, 3)),
            PathBuf::from("/b/priv_validator_state_2024_05_01_10_02_03_hrs_101_0_3.json")
        );
        assert_eq!(
            dir.mismatch_report(at),
            PathBuf::from("/b/mismatch_priv_validator_state_2024_05_01_10_02_03.json")
        );
        assert_eq!(
            dir.latest(),
            PathBuf::from("/b/priv_validator_state_latest.json")
        );
    }

    #[test]
    fn test_default_backup_dir() {
        let dir = BackupDir::default_for_home(Path::new("/home/val"));
        assert_eq!(
            dir.root(),
            Path::new("/home/val/.backup_priv_validator_state_pvguard")
        );
        assert_eq!(
            urgent_report_path(Path::new("/home/val")),
            PathBuf::from("/home/val/FATAL_REPORT_MISMATCH_PRIV_VALIDATOR_STATE.txt")
        );
    }

    #[test]
    fn test_ensure_exists_creates_private_dir() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let dir = BackupDir::new(tmp.path().join("backups"));

        assert!(dir.ensure_exists().unwrap());
        assert!(!dir.ensure_exists().unwrap());

        let mode = std::fs::metadata(dir.root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_ensure_exists_rejects_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("not-a-dir");
        std::fs::write(&path, "x").unwrap();
        assert!(BackupDir::new(&path).ensure_exists().is_err());
    }
}
