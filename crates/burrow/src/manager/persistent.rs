use crate::fsutil::write_atomic;
use burrow_core::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const TMP_SUFFIX: &str = ".json.tmp";

/// VM history that survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_boot: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_shutdown: Option<DateTime<Utc>>,
    #[serde(default)]
    pub boot_count: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_version: String,
    #[serde(default)]
    pub disk_size_mb: u64,
    #[serde(default)]
    pub clean_shutdown: bool,
}

/// JSON-backed store for [`PersistentState`].
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file reads as the default state.
    pub fn load(&self) -> Result<PersistentState> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistentState::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map_err(|e| Error::Metadata(format!("{}: {}", self.path.display(), e)))
    }

    pub fn save(&self, state: &PersistentState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::Metadata(format!("encode state: {e}")))?;
        write_atomic(&self.path, &data, TMP_SUFFIX)
    }

    pub fn update(&self, f: impl FnOnce(&mut PersistentState)) -> Result<PersistentState> {
        let mut state = self.load()?;
        f(&mut state);
        self.save(&state)?;
        Ok(state)
    }

    pub fn record_boot(&self) -> Result<PersistentState> {
        self.update(|state| {
            state.last_boot = Some(Utc::now());
            state.boot_count += 1;
            state.clean_shutdown = false;
        })
    }

    pub fn record_shutdown(&self, clean: bool) -> Result<PersistentState> {
        self.update(|state| {
            state.last_shutdown = Some(Utc::now());
            state.clean_shutdown = clean;
        })
    }
}
