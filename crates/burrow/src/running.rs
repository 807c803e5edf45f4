//! `.running` marker that tells other processes a VM is in use.
//!
//! The marker holds the owning process id. A marker whose process is gone
//! is stale and counts as not running.

use crate::layout::VmLayout;
use burrow_core::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

/// Held for as long as this process runs the VM. Dropping it removes the
/// marker.
#[derive(Debug)]
pub struct RunningMarker {
    path: PathBuf,
}

impl RunningMarker {
    /// Claims the VM for this process. Fails with `InvalidState` when another
    /// live process holds it.
    pub fn acquire(layout: &VmLayout) -> Result<Self> {
        if let Some(pid) = running_pid(layout) {
            return Err(Error::invalid_state(
                format!("run {}", layout.name()),
                format!("held by pid {}", pid),
            ));
        }
        let path = layout.running_marker();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, std::process::id().to_string())?;
        tracing::debug!("Wrote {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunningMarker {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// The pid of the live process running the VM, if any.
pub fn running_pid(layout: &VmLayout) -> Option<u32> {
    let contents = std::fs::read_to_string(layout.running_marker()).ok()?;
    let pid: i32 = contents.trim().parse().ok()?;
    // 0 and negative values address process groups, not a process.
    if pid <= 0 {
        return None;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => Some(pid as u32),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Above the kernel's pid_max, so never a live process.
    const DEAD_PID: &str = "2147483647";

    #[test]
    fn marker_lives_as_long_as_the_guard() {
        let home = tempfile::tempdir().unwrap();
        let layout = VmLayout::new(home.path(), "dev").unwrap();
        assert_eq!(running_pid(&layout), None);

        let marker = RunningMarker::acquire(&layout).unwrap();
        assert_eq!(marker.path(), layout.running_marker());
        assert_eq!(running_pid(&layout), Some(std::process::id()));
        assert!(matches!(
            RunningMarker::acquire(&layout),
            Err(Error::InvalidState { .. })
        ));

        drop(marker);
        assert!(!layout.running_marker().exists());
        assert_eq!(running_pid(&layout), None);
    }

    #[test]
    fn stale_or_garbage_markers_are_ignored() {
        let home = tempfile::tempdir().unwrap();
        let layout = VmLayout::new(home.path(), "dev").unwrap();
        std::fs::create_dir_all(layout.dir()).unwrap();

        for contents in [DEAD_PID, "0", "-1", "not a pid"] {
            std::fs::write(layout.running_marker(), contents).unwrap();
            assert_eq!(running_pid(&layout), None, "{contents:?}");
        }

        std::fs::write(layout.running_marker(), DEAD_PID).unwrap();
        let _marker = RunningMarker::acquire(&layout).unwrap();
        assert_eq!(running_pid(&layout), Some(std::process::id()));
    }
}
