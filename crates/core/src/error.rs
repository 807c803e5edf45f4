use std::sync::Arc;

/// Errors produced by drivers, the lifecycle manager and the snapshot engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("cannot {operation} while {state}")]
    InvalidState { operation: String, state: String },

    #[error("resource failure: {0}")]
    Resource(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0} already exists")]
    DuplicateName(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Corruption { expected: String, actual: String },

    #[error("no checksum available for snapshot {0}")]
    NoChecksum(String),

    #[error("VM exited with error: {0}")]
    Exited(String),

    #[error("malformed metadata: {0}")]
    Metadata(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl Error {
    pub fn invalid_state(operation: impl Into<String>, state: impl ToString) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Io(Arc::new(std::io::Error::from(errno)))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
