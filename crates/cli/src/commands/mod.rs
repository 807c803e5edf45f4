pub mod info;
pub mod mount;
pub mod run;
pub mod snapshot;
pub mod state;

use burrow::SharedDir;

/// A `--share tag=path[:ro|:rw]` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareArg {
    pub tag: String,
    pub dir: SharedDir,
}

pub fn parse_share(s: &str) -> Result<ShareArg, String> {
    let (tag, rest) = s
        .split_once('=')
        .ok_or_else(|| "share format must be 'tag=path' or 'tag=path:ro'".to_string())?;
    if tag.is_empty() {
        return Err("share tag cannot be empty".to_string());
    }

    let (path, read_only) = match rest.rsplit_once(':') {
        Some((path, "ro")) => (path, true),
        Some((path, "rw")) => (path, false),
        _ => (rest, false),
    };
    if path.is_empty() {
        return Err("share path cannot be empty".to_string());
    }

    Ok(ShareArg {
        tag: tag.to_string(),
        dir: SharedDir::new(path, read_only),
    })
}
