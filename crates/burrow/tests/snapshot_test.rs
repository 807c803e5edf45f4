use burrow::{Error, SnapshotEngine, VmLayout};
use std::path::Path;
use tempfile::TempDir;

const VM: &str = "test-vm";

fn engine_with_disk(content: &[u8]) -> (TempDir, SnapshotEngine, VmLayout) {
    let home = tempfile::tempdir().unwrap();
    let layout = VmLayout::new(home.path(), VM).unwrap();
    std::fs::create_dir_all(layout.dir()).unwrap();
    std::fs::write(layout.disk(), content).unwrap();
    let engine = SnapshotEngine::open(home.path());
    (home, engine, layout)
}

fn flip_byte(path: &Path, offset: usize) {
    let mut data = std::fs::read(path).unwrap();
    data[offset] ^= 0xff;
    std::fs::write(path, data).unwrap();
}

fn dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn create_list_delete() {
    let (_home, engine, layout) = engine_with_disk(b"eighteen byte disk");

    let entry = engine.create_snapshot(VM, "s1", "d").unwrap();
    assert_eq!(entry.disk_size, 18);

    let list = engine.list_snapshots(VM).unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "s1");
    assert_eq!(list[0].vm_name, VM);
    assert_eq!(list[0].description, "d");
    assert_eq!(list[0].disk_size, 18);
    assert!(!list[0].checksum.is_empty());
    assert!(layout.snapshot_artifact("s1").exists());

    engine.delete_snapshot(VM, "s1").unwrap();
    assert!(engine.list_snapshots(VM).unwrap().is_empty());
    assert!(!layout.snapshot_artifact("s1").exists());
}

#[test]
fn restore_onto_zeroed_disk_is_byte_identical() {
    let content: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();
    let (_home, engine, layout) = engine_with_disk(&content);

    engine.create_snapshot(VM, "base", "").unwrap();
    std::fs::write(layout.disk(), vec![0u8; content.len()]).unwrap();

    engine.restore_snapshot(VM, "base").unwrap();
    assert_eq!(std::fs::read(layout.disk()).unwrap(), content);
    assert!(!engine.has_partial_files(VM).unwrap());
}

#[test]
fn duplicate_name_leaves_original_untouched() {
    let (_home, engine, layout) = engine_with_disk(b"first");
    let original = engine.create_snapshot(VM, "s1", "first").unwrap();
    let artifact = std::fs::read(layout.snapshot_artifact("s1")).unwrap();

    std::fs::write(layout.disk(), b"second").unwrap();
    let err = engine.create_snapshot(VM, "s1", "again").unwrap_err();

    assert!(matches!(err, Error::DuplicateName(_)));
    assert!(err.to_string().contains("already exists"));
    assert_eq!(engine.list_snapshots(VM).unwrap(), vec![original]);
    assert_eq!(
        std::fs::read(layout.snapshot_artifact("s1")).unwrap(),
        artifact
    );
}

#[test]
fn verify_untouched_snapshot() {
    let (_home, engine, _layout) = engine_with_disk(b"disk content");
    engine.create_snapshot(VM, "s1", "").unwrap();
    engine.verify_snapshot(VM, "s1").unwrap();
}

#[test]
fn flipped_byte_is_corruption_for_verify_and_restore() {
    let (_home, engine, layout) = engine_with_disk(b"precious disk content");
    engine.create_snapshot(VM, "s1", "").unwrap();
    std::fs::write(layout.disk(), b"live").unwrap();

    let len = std::fs::metadata(layout.snapshot_artifact("s1")).unwrap().len() as usize;
    flip_byte(&layout.snapshot_artifact("s1"), len / 2);

    assert!(matches!(
        engine.verify_snapshot(VM, "s1"),
        Err(Error::Corruption { .. })
    ));
    assert!(matches!(
        engine.restore_snapshot(VM, "s1"),
        Err(Error::Corruption { .. })
    ));
    assert_eq!(std::fs::read(layout.disk()).unwrap(), b"live");
}

#[test]
fn snapshot_without_checksum_reports_no_checksum() {
    let (_home, engine, layout) = engine_with_disk(b"old disk");
    engine.create_snapshot(VM, "legacy", "").unwrap();

    let index = std::fs::read_to_string(layout.snapshot_index()).unwrap();
    let mut doc: serde_json::Value = serde_json::from_str(&index).unwrap();
    doc["snapshots"][0]
        .as_object_mut()
        .unwrap()
        .remove("checksum");
    std::fs::write(layout.snapshot_index(), doc.to_string()).unwrap();

    assert!(matches!(
        engine.verify_snapshot(VM, "legacy"),
        Err(Error::NoChecksum(_))
    ));

    std::fs::write(layout.disk(), b"changed").unwrap();
    engine.restore_snapshot(VM, "legacy").unwrap();
    assert_eq!(std::fs::read(layout.disk()).unwrap(), b"old disk");
}

#[test]
fn cleanup_removes_exactly_partial_files() {
    let (_home, engine, layout) = engine_with_disk(b"disk");
    engine.create_snapshot(VM, "keep", "").unwrap();

    let orphan = layout.snapshots_dir().join("s1.raw.gz.tmp");
    let index_tmp = layout.dir().join("snapshots.json.tmp");
    std::fs::write(&orphan, b"half written").unwrap();
    std::fs::write(&index_tmp, b"{\"snaps").unwrap();
    assert!(engine.has_partial_files(VM).unwrap());

    assert_eq!(engine.cleanup_partial(VM).unwrap(), 2);

    assert!(!engine.has_partial_files(VM).unwrap());
    assert_eq!(
        dir_names(layout.dir()),
        vec!["disk.raw", "snapshots", "snapshots.json"]
    );
    assert_eq!(dir_names(&layout.snapshots_dir()), vec!["keep.raw.gz"]);

    engine.create_snapshot(VM, "s1", "").unwrap();
    assert_eq!(engine.list_snapshots(VM).unwrap().len(), 2);
}

#[test]
fn cleanup_leaves_state_file_temporaries_alone() {
    let (_home, engine, layout) = engine_with_disk(b"disk");
    let state_tmp = layout.dir().join("state.abc123.json.tmp");
    std::fs::write(&state_tmp, b"{}").unwrap();

    assert!(!engine.has_partial_files(VM).unwrap());
    assert_eq!(engine.cleanup_partial(VM).unwrap(), 0);
    engine.create_snapshot(VM, "s1", "").unwrap();
    assert!(state_tmp.exists());
}

#[test]
fn open_sweeps_interrupted_restore() {
    let home = tempfile::tempdir().unwrap();
    let layout = VmLayout::new(home.path(), VM).unwrap();
    std::fs::create_dir_all(layout.dir()).unwrap();
    std::fs::write(layout.dir().join("disk.x1y2.restoring"), b"partial").unwrap();

    let engine = SnapshotEngine::open(home.path());
    assert!(!engine.has_partial_files(VM).unwrap());
}

#[test]
fn create_leaves_no_temporaries() {
    let (_home, engine, layout) = engine_with_disk(b"disk");
    engine.create_snapshot(VM, "s1", "").unwrap();
    assert_eq!(dir_names(&layout.snapshots_dir()), vec!["s1.raw.gz"]);
    assert!(!engine.has_partial_files(VM).unwrap());
}

#[test]
fn missing_disk_is_not_found() {
    let home = tempfile::tempdir().unwrap();
    let engine = SnapshotEngine::open(home.path());
    let err = engine.create_snapshot(VM, "s1", "").unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn unknown_snapshot_is_not_found() {
    let (_home, engine, _layout) = engine_with_disk(b"disk");
    assert!(matches!(
        engine.get_snapshot(VM, "nope"),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        engine.restore_snapshot(VM, "nope"),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        engine.delete_snapshot(VM, "nope"),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn delete_tolerates_missing_artifact() {
    let (_home, engine, layout) = engine_with_disk(b"disk");
    engine.create_snapshot(VM, "s1", "").unwrap();
    std::fs::remove_file(layout.snapshot_artifact("s1")).unwrap();

    engine.delete_snapshot(VM, "s1").unwrap();
    assert!(engine.list_snapshots(VM).unwrap().is_empty());
}

#[test]
fn list_without_metadata_is_empty() {
    let (_home, engine, _layout) = engine_with_disk(b"disk");
    assert!(engine.list_snapshots(VM).unwrap().is_empty());
}

#[test]
fn get_and_file_size() {
    let (_home, engine, layout) = engine_with_disk(&[7u8; 4096]);
    let before = chrono::Utc::now();
    engine.create_snapshot(VM, "s1", "desc").unwrap();

    let entry = engine.get_snapshot(VM, "s1").unwrap();
    assert_eq!(entry.description, "desc");
    assert!(entry.created_at >= before);

    let size = engine.snapshot_file_size(VM, "s1").unwrap();
    assert_eq!(
        size,
        std::fs::metadata(layout.snapshot_artifact("s1")).unwrap().len()
    );
    assert!(size < 4096);
}

#[test]
fn multiple_snapshots_keep_creation_order() {
    let (_home, engine, layout) = engine_with_disk(b"v1");
    engine.create_snapshot(VM, "a", "").unwrap();
    std::fs::write(layout.disk(), b"v2").unwrap();
    engine.create_snapshot(VM, "b", "").unwrap();
    std::fs::write(layout.disk(), b"v3").unwrap();
    engine.create_snapshot(VM, "c", "").unwrap();

    let names: Vec<String> = engine
        .list_snapshots(VM)
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);

    engine.delete_snapshot(VM, "b").unwrap();
    engine.restore_snapshot(VM, "a").unwrap();
    assert_eq!(std::fs::read(layout.disk()).unwrap(), b"v1");
    engine.restore_snapshot(VM, "c").unwrap();
    assert_eq!(std::fs::read(layout.disk()).unwrap(), b"v3");
}

#[test]
fn rejects_path_like_snapshot_names() {
    let (_home, engine, _layout) = engine_with_disk(b"disk");
    assert!(matches!(
        engine.create_snapshot(VM, "../escape", ""),
        Err(Error::InvalidConfig(_))
    ));
}
