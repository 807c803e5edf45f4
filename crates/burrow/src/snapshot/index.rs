use crate::fsutil::write_atomic;
use burrow_core::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub(crate) const INDEX_TMP_SUFFIX: &str = ".json.tmp";

/// One point-in-time copy of a VM's disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub name: String,
    pub vm_name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    /// Size of the disk before compression, in bytes.
    pub disk_size: u64,
    /// Lowercase hex SHA-256 of the compressed artifact. Empty for snapshots
    /// taken before checksums were recorded.
    #[serde(default)]
    pub checksum: String,
}

/// The per-VM metadata document: `{"snapshots": [...]}` in creation order.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct SnapshotIndex {
    #[serde(default)]
    pub snapshots: Vec<SnapshotEntry>,
}

impl SnapshotIndex {
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map_err(|e| Error::Metadata(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Metadata(format!("encode snapshot index: {e}")))?;
        write_atomic(path, &data, INDEX_TMP_SUFFIX)
    }

    pub fn get(&self, name: &str) -> Option<&SnapshotEntry> {
        self.snapshots.iter().find(|s| s.name == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<SnapshotEntry> {
        let pos = self.snapshots.iter().position(|s| s.name == name)?;
        Some(self.snapshots.remove(pos))
    }
}
