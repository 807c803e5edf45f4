use burrow_core::{Error, Result};
use std::io::Write;
use std::path::Path;

/// Replaces `path` with `contents` via a sibling temporary file and rename,
/// so readers see either the old or the new document.
///
/// The temporary file is named `<stem>.<random><suffix>`; callers pick a
/// suffix that partial-file cleanup recognizes.
pub(crate) fn write_atomic(path: &Path, contents: &[u8], suffix: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidConfig(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let stem = path
        .file_stem()
        .map(|s| format!("{}.", s.to_string_lossy()))
        .unwrap_or_default();
    let mut tmp = tempfile::Builder::new()
        .prefix(&stem)
        .suffix(suffix)
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_contents_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_atomic(&path, b"{\"a\":1}", ".json.tmp").unwrap();
        write_atomic(&path, b"{\"a\":2}", ".json.tmp").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn creates_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/state.json");
        write_atomic(&path, b"{}", ".json.tmp").unwrap();
        assert!(path.exists());
    }
}
