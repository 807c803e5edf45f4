//! The `snapshot` commands.
//!
//! These work on the disk file directly. `restore` refuses to touch the disk
//! while a `burrow run` holds the VM.

use burrow::{SnapshotEngine, SnapshotEntry, VmLayout, running_pid};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum SnapshotCommand {
    /// Snapshot the VM's disk
    Create {
        vm: String,
        name: String,
        #[arg(long, short, default_value = "")]
        description: String,
    },
    /// List a VM's snapshots, oldest first
    List {
        vm: String,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Replace the VM's disk with a snapshot (the VM must be stopped)
    Restore { vm: String, name: String },
    /// Delete a snapshot and its data
    Delete { vm: String, name: String },
    /// Check a snapshot's data against its checksum
    Verify { vm: String, name: String },
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

fn render_list(entries: &[(SnapshotEntry, Option<u64>)]) -> String {
    if entries.is_empty() {
        return "No snapshots.\n".to_string();
    }
    let mut out = String::new();
    for (entry, stored) in entries {
        let stored = stored.map_or("missing".to_string(), human_size);
        out.push_str(&format!(
            "{}  {}  disk {}  stored {}",
            entry.name,
            entry.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            human_size(entry.disk_size),
            stored
        ));
        if !entry.description.is_empty() {
            out.push_str(&format!("  {}", entry.description));
        }
        out.push('\n');
    }
    out
}

fn ensure_stopped(home: &Path, vm: &str) -> anyhow::Result<()> {
    let layout = VmLayout::new(home, vm)?;
    if let Some(pid) = running_pid(&layout) {
        anyhow::bail!("VM {vm} is running (pid {pid}); stop it before restoring a snapshot");
    }
    Ok(())
}

pub fn run(home: &Path, command: SnapshotCommand) -> anyhow::Result<()> {
    let engine = SnapshotEngine::open(home);
    match command {
        SnapshotCommand::Create {
            vm,
            name,
            description,
        } => {
            let entry = engine.create_snapshot(&vm, &name, &description)?;
            println!(
                "Created snapshot {} ({} disk, sha256 {})",
                entry.name,
                human_size(entry.disk_size),
                entry.checksum
            );
        }
        SnapshotCommand::List { vm, json } => {
            let entries = engine.list_snapshots(&vm)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                let sized: Vec<_> = entries
                    .into_iter()
                    .map(|entry| {
                        let stored = engine.snapshot_file_size(&vm, &entry.name).ok();
                        (entry, stored)
                    })
                    .collect();
                print!("{}", render_list(&sized));
            }
        }
        SnapshotCommand::Restore { vm, name } => {
            ensure_stopped(home, &vm)?;
            engine.restore_snapshot(&vm, &name)?;
            println!("Restored {vm} from snapshot {name}");
        }
        SnapshotCommand::Delete { vm, name } => {
            engine.delete_snapshot(&vm, &name)?;
            println!("Deleted snapshot {name}");
        }
        SnapshotCommand::Verify { vm, name } => {
            engine.verify_snapshot(&vm, &name)?;
            println!("Snapshot {name} is intact");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, description: &str) -> SnapshotEntry {
        SnapshotEntry {
            name: name.to_string(),
            vm_name: "dev".to_string(),
            description: description.to_string(),
            created_at: "2026-03-01T12:00:00Z".parse().unwrap(),
            disk_size: 10 * 1024 * 1024 * 1024,
            checksum: "ab".repeat(32),
        }
    }

    #[test]
    fn sizes_use_binary_units() {
        assert_eq!(human_size(18), "18 B");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(10 * 1024 * 1024 * 1024), "10.0 GiB");
    }

    #[test]
    fn list_shows_one_line_per_snapshot() {
        let out = render_list(&[
            (entry("base", "fresh install"), Some(300 * 1024 * 1024)),
            (entry("broken", ""), None),
        ]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("base  2026-03-01 12:00:00 UTC"));
        assert!(lines[0].ends_with("fresh install"));
        assert!(lines[1].contains("stored missing"));
    }

    #[test]
    fn empty_list_says_so() {
        assert_eq!(render_list(&[]), "No snapshots.\n");
    }

    #[test]
    fn restore_refused_while_vm_is_held() {
        let home = tempfile::tempdir().unwrap();
        let layout = VmLayout::new(home.path(), "dev").unwrap();
        std::fs::create_dir_all(layout.dir()).unwrap();
        std::fs::write(layout.disk(), b"original").unwrap();
        let restore = || SnapshotCommand::Restore {
            vm: "dev".to_string(),
            name: "s1".to_string(),
        };

        run(
            home.path(),
            SnapshotCommand::Create {
                vm: "dev".to_string(),
                name: "s1".to_string(),
                description: String::new(),
            },
        )
        .unwrap();
        std::fs::write(layout.disk(), b"live guest data").unwrap();

        let marker = burrow::RunningMarker::acquire(&layout).unwrap();
        let err = run(home.path(), restore()).unwrap_err();
        assert!(err.to_string().contains("is running"));
        assert_eq!(std::fs::read(layout.disk()).unwrap(), b"live guest data");

        drop(marker);
        run(home.path(), restore()).unwrap();
        assert_eq!(std::fs::read(layout.disk()).unwrap(), b"original");
    }

    #[test]
    fn create_then_verify_through_the_engine() {
        let home = tempfile::tempdir().unwrap();
        let vm_dir = home.path().join("data").join("dev");
        std::fs::create_dir_all(&vm_dir).unwrap();
        std::fs::write(vm_dir.join("disk.raw"), b"eighteen bytes!!!!").unwrap();

        run(
            home.path(),
            SnapshotCommand::Create {
                vm: "dev".to_string(),
                name: "s1".to_string(),
                description: "d".to_string(),
            },
        )
        .unwrap();
        run(
            home.path(),
            SnapshotCommand::Verify {
                vm: "dev".to_string(),
                name: "s1".to_string(),
            },
        )
        .unwrap();
        assert!(
            run(
                home.path(),
                SnapshotCommand::Delete {
                    vm: "dev".to_string(),
                    name: "missing".to_string(),
                },
            )
            .is_err()
        );
    }
}
