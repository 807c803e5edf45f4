//! Crash-safe disk snapshots.
//!
//! A snapshot is the VM's `disk.raw` gzip-compressed into
//! `snapshots/<name>.raw.gz`, listed in `snapshots.json` with the SHA-256 of
//! the compressed file. Every write lands in a temporary file that is renamed
//! into place only when complete, so an interrupted operation leaves either
//! the old state or the new one plus stray temporaries, which
//! [`SnapshotEngine::cleanup_partial`] removes.
//!
//! The engine works on files only. It does not know whether the VM is
//! running; callers must stop it before restoring.

mod checksum;
mod index;

pub use index::SnapshotEntry;

use crate::layout::{VmLayout, validate_name};
use burrow_core::{Error, Result};
use checksum::file_checksum;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use index::{INDEX_TMP_SUFFIX, SnapshotIndex};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

const ARTIFACT_TMP_SUFFIX: &str = ".raw.gz.tmp";
const RESTORE_SUFFIX: &str = ".restoring";

// Metadata temporaries are `snapshots.<random>.json.tmp`; other `.json.tmp`
// files in the VM directory belong to someone else.
const INDEX_TMP_PREFIX: &str = "snapshots.";

#[derive(Debug, Clone)]
pub struct SnapshotEngine {
    home: PathBuf,
}

impl SnapshotEngine {
    /// Opens the engine over `<home>/data` and sweeps partial files left by
    /// any interrupted operation.
    pub fn open(home: impl Into<PathBuf>) -> Self {
        let engine = Self { home: home.into() };
        engine.cleanup_all();
        engine
    }

    fn cleanup_all(&self) {
        let Ok(entries) = std::fs::read_dir(self.home.join("data")) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(vm) = name.to_str() else { continue };
            if let Err(e) = self.cleanup_partial(vm) {
                tracing::warn!("Failed to clean partial snapshot files for {}: {}", vm, e);
            }
        }
    }

    fn layout(&self, vm: &str) -> Result<VmLayout> {
        VmLayout::new(&self.home, vm)
    }

    /// Compresses the VM's disk into a new snapshot.
    pub fn create_snapshot(
        &self,
        vm: &str,
        name: &str,
        description: &str,
    ) -> Result<SnapshotEntry> {
        let layout = self.layout(vm)?;
        validate_name("snapshot", name)?;
        self.cleanup_partial(vm)?;

        let source = File::open(layout.disk()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("disk image for VM {vm:?}"))
            } else {
                e.into()
            }
        })?;

        let index_path = layout.snapshot_index();
        let mut index = SnapshotIndex::load(&index_path)?;
        if index.get(name).is_some() {
            return Err(Error::DuplicateName(format!("snapshot {name:?}")));
        }

        let snapshots_dir = layout.snapshots_dir();
        std::fs::create_dir_all(&snapshots_dir)?;
        let artifact = layout.snapshot_artifact(name);

        // Dropping `tmp` on any early return deletes the partial artifact.
        let tmp = tempfile::Builder::new()
            .prefix(&format!("{name}."))
            .suffix(ARTIFACT_TMP_SUFFIX)
            .tempfile_in(&snapshots_dir)?;
        let mut encoder = GzEncoder::new(BufWriter::new(tmp), Compression::default());
        let disk_size = std::io::copy(&mut BufReader::new(source), &mut encoder)?;
        let tmp = encoder
            .finish()?
            .into_inner()
            .map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;

        let tmp = tmp.into_temp_path();
        let checksum = file_checksum(&tmp)?;
        tmp.persist(&artifact).map_err(|e| e.error)?;

        let entry = SnapshotEntry {
            name: name.to_string(),
            vm_name: vm.to_string(),
            description: description.to_string(),
            created_at: chrono::Utc::now(),
            disk_size,
            checksum,
        };
        index.snapshots.push(entry.clone());
        if let Err(e) = index.save(&index_path) {
            remove_if_exists(&artifact)?;
            return Err(e);
        }

        tracing::info!("Created snapshot {} of {} ({} bytes)", name, vm, disk_size);
        Ok(entry)
    }

    pub fn list_snapshots(&self, vm: &str) -> Result<Vec<SnapshotEntry>> {
        let layout = self.layout(vm)?;
        Ok(SnapshotIndex::load(&layout.snapshot_index())?.snapshots)
    }

    pub fn get_snapshot(&self, vm: &str, name: &str) -> Result<SnapshotEntry> {
        let layout = self.layout(vm)?;
        lookup(&layout, name)
    }

    /// Replaces the VM's disk with the snapshot's contents after checking the
    /// artifact's integrity. The live disk is untouched on any failure.
    pub fn restore_snapshot(&self, vm: &str, name: &str) -> Result<()> {
        let layout = self.layout(vm)?;
        self.cleanup_partial(vm)?;
        let entry = lookup(&layout, name)?;

        if entry.checksum.is_empty() {
            tracing::warn!(
                "Snapshot {} has no recorded checksum; restoring without verification",
                name
            );
        } else {
            verify_artifact(&layout, &entry)?;
        }

        let artifact = open_artifact(&layout, name)?;
        let tmp = tempfile::Builder::new()
            .prefix("disk.")
            .suffix(RESTORE_SUFFIX)
            .tempfile_in(layout.dir())?;
        let mut writer = BufWriter::new(tmp);
        std::io::copy(&mut GzDecoder::new(BufReader::new(artifact)), &mut writer)?;
        let tmp = writer.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;
        tmp.into_temp_path()
            .persist(layout.disk())
            .map_err(|e| e.error)?;

        tracing::info!("Restored {} from snapshot {}", vm, name);
        Ok(())
    }

    /// Removes the entry, then its artifact. A missing artifact is fine.
    pub fn delete_snapshot(&self, vm: &str, name: &str) -> Result<()> {
        let layout = self.layout(vm)?;
        self.cleanup_partial(vm)?;

        let index_path = layout.snapshot_index();
        let mut index = SnapshotIndex::load(&index_path)?;
        if index.remove(name).is_none() {
            return Err(Error::NotFound(format!("snapshot {name:?} of VM {vm:?}")));
        }
        index.save(&index_path)?;
        remove_if_exists(&layout.snapshot_artifact(name))?;

        tracing::info!("Deleted snapshot {} of {}", name, vm);
        Ok(())
    }

    /// Checks the artifact against its recorded checksum. Never touches the
    /// live disk.
    pub fn verify_snapshot(&self, vm: &str, name: &str) -> Result<()> {
        let layout = self.layout(vm)?;
        let entry = lookup(&layout, name)?;
        if entry.checksum.is_empty() {
            return Err(Error::NoChecksum(name.to_string()));
        }
        verify_artifact(&layout, &entry)
    }

    /// Size of the compressed artifact in bytes.
    pub fn snapshot_file_size(&self, vm: &str, name: &str) -> Result<u64> {
        let layout = self.layout(vm)?;
        Ok(open_artifact(&layout, name)?.metadata()?.len())
    }

    /// Deletes temporary files left by interrupted operations. Returns how
    /// many were removed.
    pub fn cleanup_partial(&self, vm: &str) -> Result<usize> {
        let layout = self.layout(vm)?;
        let mut removed = 0;
        for path in partial_files(&layout)? {
            remove_if_exists(&path)?;
            tracing::debug!("Removed partial file {}", path.display());
            removed += 1;
        }
        Ok(removed)
    }

    pub fn has_partial_files(&self, vm: &str) -> Result<bool> {
        let layout = self.layout(vm)?;
        Ok(!partial_files(&layout)?.is_empty())
    }
}

fn lookup(layout: &VmLayout, name: &str) -> Result<SnapshotEntry> {
    SnapshotIndex::load(&layout.snapshot_index())?
        .get(name)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("snapshot {name:?} of VM {:?}", layout.name())))
}

fn open_artifact(layout: &VmLayout, name: &str) -> Result<File> {
    File::open(layout.snapshot_artifact(name)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(format!("artifact for snapshot {name:?}"))
        } else {
            e.into()
        }
    })
}

fn verify_artifact(layout: &VmLayout, entry: &SnapshotEntry) -> Result<()> {
    let artifact = layout.snapshot_artifact(&entry.name);
    if !artifact.exists() {
        return Err(Error::NotFound(format!(
            "artifact for snapshot {:?}",
            entry.name
        )));
    }
    let actual = file_checksum(&artifact)?;
    if actual != entry.checksum {
        return Err(Error::Corruption {
            expected: entry.checksum.clone(),
            actual,
        });
    }
    Ok(())
}

fn partial_files(layout: &VmLayout) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for dir in [layout.dir().to_path_buf(), layout.snapshots_dir()] {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if is_partial(&entry.path()) && entry.file_type()?.is_file() {
                found.push(entry.path());
            }
        }
    }
    Ok(found)
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| {
            n.ends_with(ARTIFACT_TMP_SUFFIX)
                || n.ends_with(RESTORE_SUFFIX)
                || (n.starts_with(INDEX_TMP_PREFIX) && n.ends_with(INDEX_TMP_SUFFIX))
        })
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
