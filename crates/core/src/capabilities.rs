use serde::Serialize;

/// Optional features a driver supports. Static for the life of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Host directory pass-through keyed by mount tag.
    pub shared_dirs: bool,
    pub networking: bool,
    pub snapshots: bool,
}
