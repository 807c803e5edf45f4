use burrow_core::{Error, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Source of writable disk images for the lifecycle manager.
pub trait DiskProvider: Send + Sync {
    /// Returns the disk's path, creating a sparse file of `size_mb` MiB if it
    /// does not exist yet. Existing disks are never resized.
    fn ensure_disk(&self, name: &str, size_mb: u64) -> Result<PathBuf>;

    fn disk_exists(&self, name: &str) -> bool;

    fn disk_path(&self, name: &str) -> PathBuf;
}

/// Raw disk images stored as `<dir>/<name>.raw`.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Removes a disk. A disk that does not exist is not an error.
    pub fn delete_disk(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.disk_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl DiskProvider for ImageStore {
    fn ensure_disk(&self, name: &str, size_mb: u64) -> Result<PathBuf> {
        crate::layout::validate_name("disk", name)?;
        let bytes = size_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| Error::InvalidConfig(format!("disk size {size_mb} MiB is too large")))?;
        let path = self.disk_path(name);
        if path.exists() {
            return Ok(path);
        }

        std::fs::create_dir_all(&self.dir)?;
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => {
                if let Err(e) = file.set_len(bytes) {
                    // An empty file would pass for a provisioned disk later.
                    drop(file);
                    let _ = std::fs::remove_file(&path);
                    return Err(e.into());
                }
                tracing::info!("Created {} MiB disk image at {}", size_mb, path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        Ok(path)
    }

    fn disk_exists(&self, name: &str) -> bool {
        self.disk_path(name).is_file()
    }

    fn disk_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.raw"))
    }
}
