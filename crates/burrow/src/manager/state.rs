use burrow_core::{Error, Result};
use std::fmt;

/// Lifecycle of a VM as seen by the [`Manager`](super::Manager).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ManagerState {
    #[default]
    New,
    Ready,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ManagerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub(crate) fn require(self, operation: &str, allowed: &[ManagerState]) -> Result<()> {
        if allowed.contains(&self) {
            Ok(())
        } else {
            Err(Error::invalid_state(operation, self))
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
