use burrow_core::{Error, Result};
use std::path::{Path, PathBuf};

pub const DISK_FILE: &str = "disk.raw";
pub const STATE_FILE: &str = "state.json";
pub const SNAPSHOT_INDEX_FILE: &str = "snapshots.json";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const SNAPSHOT_EXTENSION: &str = "raw.gz";
pub const RUNNING_MARKER: &str = ".running";

/// On-disk layout of one VM: `<home>/data/<vm>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLayout {
    name: String,
    dir: PathBuf,
}

impl VmLayout {
    pub fn new(home: impl AsRef<Path>, vm: &str) -> Result<Self> {
        validate_name("VM", vm)?;
        Ok(Self {
            name: vm.to_string(),
            dir: home.as_ref().join("data").join(vm),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn disk(&self) -> PathBuf {
        self.dir.join(DISK_FILE)
    }

    pub fn state_file(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn snapshot_index(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_INDEX_FILE)
    }

    pub fn running_marker(&self) -> PathBuf {
        self.dir.join(RUNNING_MARKER)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.dir.join(SNAPSHOTS_DIR)
    }

    pub fn snapshot_artifact(&self, snapshot: &str) -> PathBuf {
        self.snapshots_dir()
            .join(format!("{snapshot}.{SNAPSHOT_EXTENSION}"))
    }
}

/// Names become file names, so they must be a single plain path component.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidConfig(format!("{kind} name must not be empty")));
    }
    if name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidConfig(format!(
            "{kind} name {name:?} must be a plain file name"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_live_under_data_dir() {
        let layout = VmLayout::new("/home/u/.burrow", "dev").unwrap();
        assert_eq!(layout.dir(), Path::new("/home/u/.burrow/data/dev"));
        assert_eq!(layout.disk(), Path::new("/home/u/.burrow/data/dev/disk.raw"));
        assert_eq!(
            layout.snapshot_index(),
            Path::new("/home/u/.burrow/data/dev/snapshots.json")
        );
        assert_eq!(
            layout.snapshot_artifact("s1"),
            Path::new("/home/u/.burrow/data/dev/snapshots/s1.raw.gz")
        );
    }

    #[test]
    fn rejects_path_like_names() {
        for bad in ["", "..", ".hidden", "a/b", "a\\b"] {
            assert!(
                matches!(VmLayout::new("/tmp", bad), Err(Error::InvalidConfig(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_name("snapshot", "before-upgrade_2").is_ok());
    }
}
