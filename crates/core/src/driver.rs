use crate::capabilities::Capabilities;
use crate::config::VmConfig;
use crate::console::Console;
use crate::error::{Error, Result};
use crate::exit::ExitSignal;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

/// Identifies a driver implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverInfo {
    pub name: String,
    pub version: String,
    pub arch: String,
}

impl DriverInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Driver-side lifecycle. Moves forward only; a fresh `create` is the sole
/// way back to `Created`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DriverState {
    #[default]
    New,
    Created,
    Running,
    Stopped,
}

impl DriverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }

    /// Fails with `InvalidState` unless `self` is one of `allowed`.
    pub fn require(self, operation: &str, allowed: &[DriverState]) -> Result<()> {
        if allowed.contains(&self) {
            Ok(())
        } else {
            Err(Error::invalid_state(operation, self))
        }
    }

    pub fn can_create(self) -> Result<()> {
        self.require("create", &[Self::New, Self::Stopped])
    }

    pub fn can_start(self) -> Result<()> {
        self.require("start", &[Self::Created, Self::Stopped])
    }

    pub fn can_stop(self) -> Result<()> {
        self.require("stop", &[Self::Running])
    }

    pub fn can_kill(self) -> Result<()> {
        self.require("kill", &[Self::Running])
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle contract every hypervisor implementation fulfils.
///
/// Cancellation is cooperative: dropping a pending future abandons the wait
/// but never leaves the driver half-transitioned. `kill` is the
/// unconditional fallback when `stop` is not honored.
#[async_trait]
pub trait Driver: Send + Sync {
    fn info(&self) -> DriverInfo;

    fn capabilities(&self) -> Capabilities;

    fn state(&self) -> DriverState;

    /// Pure check of `config`; touches no resources.
    fn validate(&self, config: &VmConfig) -> Result<()> {
        config.validate()
    }

    /// Allocates console pipes, the disk handle and the platform VM.
    async fn create(&self, config: &VmConfig) -> Result<()>;

    /// Boots the VM. Returns once it is running; the signal resolves when it
    /// exits.
    async fn start(&self) -> Result<ExitSignal>;

    async fn stop(&self) -> Result<()>;

    async fn kill(&self) -> Result<()>;

    fn console(&self) -> Result<Console>;

    fn close_console(&self);
}
