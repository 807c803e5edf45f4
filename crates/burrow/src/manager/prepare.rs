use super::config::{ManagerConfig, SSH_GUEST_PORT};
use crate::assets::{AssetPaths, BootConfig, SetupRequirements};
use crate::images::DiskProvider;
use burrow_core::{NetworkConfig, Result, VmConfig};
use std::path::PathBuf;

/// Where the VM's root disk comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DiskPlan {
    /// Boot straight from the distro's converted image.
    DistroImage(PathBuf),
    /// A writable disk owned by the disk provider.
    Managed,
}

impl DiskPlan {
    /// The single place that decides between the two disk sources; both the
    /// warm eligibility check and cold provisioning go through it.
    pub(crate) fn resolve(requirements: &SetupRequirements, paths: &AssetPaths) -> Self {
        if !requirements.needs_extraction && !paths.rootfs.as_os_str().is_empty() {
            Self::DistroImage(paths.rootfs.clone())
        } else {
            Self::Managed
        }
    }

    /// Whether the disk is already in place (warm path eligible).
    pub(crate) fn is_present(&self, disks: &dyn DiskProvider, disk_name: &str) -> bool {
        match self {
            Self::DistroImage(path) => path.is_file(),
            Self::Managed => disks.disk_exists(disk_name),
        }
    }

    /// Path of a disk known to exist.
    pub(crate) fn existing_path(&self, disks: &dyn DiskProvider, disk_name: &str) -> PathBuf {
        match self {
            Self::DistroImage(path) => path.clone(),
            Self::Managed => disks.disk_path(disk_name),
        }
    }

    /// Path of the disk, creating a managed disk if needed.
    pub(crate) fn provision(
        &self,
        disks: &dyn DiskProvider,
        disk_name: &str,
        size_mb: u64,
    ) -> Result<PathBuf> {
        match self {
            Self::DistroImage(path) => Ok(path.clone()),
            Self::Managed => disks.ensure_disk(disk_name, size_mb),
        }
    }
}

pub(crate) fn build_vm_config(
    config: &ManagerConfig,
    boot: &BootConfig,
    paths: &AssetPaths,
    disk: PathBuf,
) -> VmConfig {
    let mut network = NetworkConfig {
        enabled: config.network,
        mode: config.network_mode.clone(),
        mac_address: config.mac_address.clone(),
        ..NetworkConfig::default()
    };
    if config.ssh_host_port > 0 {
        network
            .port_forwards
            .insert(config.ssh_host_port, SSH_GUEST_PORT);
    }

    VmConfig {
        cpus: config.cpus,
        memory_mb: config.memory_mb,
        kernel: paths.kernel.clone(),
        initrd: (!paths.initramfs.as_os_str().is_empty()).then(|| paths.initramfs.clone()),
        cmdline: boot.kernel_cmdline(),
        disk: Some(disk),
        shared_dirs: config.shared_dirs.clone(),
        network,
    }
}
