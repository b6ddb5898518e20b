//! The validator's consensus signing state, as persisted in
//! `priv_validator_state.json` by the node.
//!
//! Every read produces a fresh, immutable [`SigningState`]. The bytes the
//! value was decoded from are kept so backups can be written back out without
//! re-encoding the signature fields.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// Height/round/step progress marker plus the signature made at that point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SigningState {
    #[serde(with = "height_string")]
    pub height: u64,
    pub round: u32,
    pub step: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
    #[serde(default, rename = "signbytes", skip_serializing_if = "String::is_empty")]
    pub sign_bytes: String,
    #[serde(skip)]
    raw: Option<Vec<u8>>,
}

/// Result of [`SigningState::compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comparison {
    /// Ordering of `(height, round, step)`, integer-wise.
    pub ordering: Ordering,
    /// Same `(height, round, step)` but different signature bytes.
    pub different_signs: bool,
}

/// Errors reading or writing a state file.
#[derive(Debug)]
pub enum StateError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Encode(serde_json::Error),
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Read { path, source } => {
                write!(f, "failed to read state file {}: {}", path.display(), source)
            }
            StateError::Parse { path, source } => {
                write!(f, "failed to parse state file {}: {}", path.display(), source)
            }
            StateError::Encode(source) => write!(f, "failed to encode state: {source}"),
            StateError::Write { path, source } => {
                write!(f, "failed to write state file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StateError::Read { source, .. } => Some(source),
            StateError::Parse { source, .. } => Some(source),
            StateError::Encode(source) => Some(source),
            StateError::Write { source, .. } => Some(source),
        }
    }
}

impl SigningState {
    /// A state with fields set and no signature.
    pub fn new(height: u64, round: u32, step: u32) -> Self {
        Self {
            height,
            round,
            step,
            ..Self::default()
        }
    }

    /// The "no state yet" value the node writes before its first vote, and
    /// which a snapshot restore leaves behind.
    pub fn empty() -> Self {
        Self::new(0, 0, 0)
    }

    #[cfg(test)]
    pub fn with_signature(mut self, signature: &str, sign_bytes: &str) -> Self {
        self.signature = signature.to_string();
        self.sign_bytes = sign_bytes.to_string();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.height == 0
            && self.round == 0
            && self.step == 0
            && self.signature.is_empty()
            && self.sign_bytes.is_empty()
    }

    pub fn hrs(&self) -> (u64, u32, u32) {
        (self.height, self.round, self.step)
    }

    /// Compare progress of `self` against `other`.
    ///
    /// `ordering` is `Less` when `other` is further along. The
    /// `different_signs` flag can only be set when `ordering` is `Equal`.
    pub fn compare(&self, other: &SigningState) -> Comparison {
        let ordering = self.hrs().cmp(&other.hrs());
        let different_signs = ordering == Ordering::Equal
            && (self.signature != other.signature || self.sign_bytes != other.sign_bytes);
        Comparison {
            ordering,
            different_signs,
        }
    }

    /// Decode a state from the node's JSON format, remembering the input bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let mut state: SigningState = serde_json::from_slice(bytes)?;
        state.raw = Some(bytes.to_vec());
        Ok(state)
    }

    pub fn load(path: &Path) -> Result<Self, StateError> {
        let bytes = std::fs::read(path).map_err(|e| StateError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&bytes).map_err(|e| StateError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Pretty JSON rendering, used in logs and incident reports.
    pub fn to_json(&self) -> Result<String, StateError> {
        serde_json::to_string_pretty(self).map_err(StateError::Encode)
    }

    /// Same as [`to_json`](Self::to_json) but never fails; falls back to the
    /// debug form.
    pub fn display_json(&self) -> String {
        self.to_json().unwrap_or_else(|_| format!("{self:?}"))
    }

    /// Bytes to persist: the original file content when this value was read
    /// from disk, a fresh encoding otherwise.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StateError> {
        match &self.raw {
            Some(raw) => Ok(raw.clone()),
            None => self.to_json().map(String::into_bytes),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes).map_err(|e| StateError::Write {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

impl PartialEq for SigningState {
    fn eq(&self, other: &Self) -> bool {
        self.hrs() == other.hrs()
            && self.signature == other.signature
            && self.sign_bytes == other.sign_bytes
    }
}

impl Eq for SigningState {}

/// The node writes `height` as a JSON string; older files carry a number.
mod height_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(height: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(height)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Height {
            Text(String),
            Number(u64),
        }

        match Height::deserialize(deserializer)? {
            Height::Text(text) => text
                .trim()
                .parse()
                .map_err(|e| de::Error::custom(format!("invalid height {text:?}: {e}"))),
            Height::Number(n) => Ok(n),
        }
    }
}
