use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Smallest guest memory size accepted by [`VmConfig::validate`], in MiB.
pub const MIN_MEMORY_MB: u64 = 128;

/// A host directory exposed to the guest under a mount tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDir {
    pub host_path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

impl SharedDir {
    pub fn new(host_path: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            host_path: host_path.into(),
            read_only,
        }
    }
}

/// Network attachment kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Nat,
    Bridged,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nat => "nat",
            Self::Bridged => "bridged",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub enabled: bool,
    /// `"nat"` or `"bridged"`. Empty means NAT.
    pub mode: String,
    pub mac_address: Option<String>,
    /// Host port to guest port.
    pub port_forwards: BTreeMap<u16, u16>,
}

impl NetworkConfig {
    pub fn nat() -> Self {
        Self {
            enabled: true,
            mode: NetworkMode::Nat.as_str().to_string(),
            ..Self::default()
        }
    }

    /// Resolves the configured mode without touching the stored string.
    pub fn mode(&self) -> Result<NetworkMode> {
        match self.mode.as_str() {
            "" | "nat" => Ok(NetworkMode::Nat),
            "bridged" => Ok(NetworkMode::Bridged),
            other => Err(Error::InvalidConfig(format!(
                "invalid network mode {other:?} (expected \"nat\" or \"bridged\")"
            ))),
        }
    }
}

/// Everything a driver needs to create a VM. Treated as immutable once
/// handed to [`crate::Driver::create`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub cpus: u32,
    pub memory_mb: u64,
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    pub cmdline: String,
    pub disk: Option<PathBuf>,
    /// Mount tag to shared directory.
    pub shared_dirs: BTreeMap<String, SharedDir>,
    pub network: NetworkConfig,
}

impl VmConfig {
    /// Checks the configuration without side effects.
    pub fn validate(&self) -> Result<()> {
        if self.cpus < 1 {
            return Err(Error::InvalidConfig(format!(
                "CPU count must be at least 1, got {}",
                self.cpus
            )));
        }
        if self.memory_mb < MIN_MEMORY_MB {
            return Err(Error::InvalidConfig(format!(
                "memory must be at least {MIN_MEMORY_MB} MiB, got {}",
                self.memory_mb
            )));
        }
        if self.kernel.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("kernel path is required".to_string()));
        }
        if self.network.enabled {
            self.network.mode()?;
        }
        Ok(())
    }
}
