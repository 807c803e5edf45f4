use burrow_core::{Capabilities, SharedDir};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_CPUS: u32 = 1;
pub const DEFAULT_MEMORY_MB: u64 = 512;
pub const DEFAULT_DISK_SIZE_MB: u64 = 10 * 1024;
pub const DEFAULT_DISK_NAME: &str = "disk";

/// Guest port the SSH forward targets.
pub const SSH_GUEST_PORT: u16 = 22;

/// Declarative description of the VM a [`Manager`](super::Manager) runs.
///
/// Zero-valued sizes are replaced with defaults by `prepare`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_size_mb: u64,
    pub disk_name: String,
    pub shared_dirs: BTreeMap<String, SharedDir>,
    pub network: bool,
    pub network_mode: String,
    pub mac_address: Option<String>,
    /// Host port forwarded to the guest's SSH service; 0 disables it.
    pub ssh_host_port: u16,
}

impl ManagerConfig {
    pub fn with_defaults(&self) -> Self {
        let mut config = self.clone();
        if config.cpus == 0 {
            config.cpus = DEFAULT_CPUS;
        }
        if config.memory_mb == 0 {
            config.memory_mb = DEFAULT_MEMORY_MB;
        }
        if config.disk_size_mb == 0 {
            config.disk_size_mb = DEFAULT_DISK_SIZE_MB;
        }
        if config.disk_name.is_empty() {
            config.disk_name = DEFAULT_DISK_NAME.to_string();
        }
        config
    }

    /// Turns off features the driver lacks and describes each one dropped.
    pub(crate) fn degrade(&mut self, driver: &str, caps: &Capabilities) -> Vec<String> {
        let mut warnings = Vec::new();
        if !caps.shared_dirs && !self.shared_dirs.is_empty() {
            warnings.push(format!(
                "shared directories are not supported by the {driver} driver; ignoring {} share(s)",
                self.shared_dirs.len()
            ));
            self.shared_dirs.clear();
        }
        if !caps.networking && self.network {
            warnings.push(format!(
                "networking is not supported by the {driver} driver; the VM will have no network"
            ));
            self.network = false;
        }
        warnings
    }
}
