//! Boot assets consumed by the lifecycle manager.
//!
//! Where the kernel, initramfs and root filesystem come from is up to the
//! [`AssetProvider`]; the manager only needs their paths, the kernel command
//! line, and whether the root filesystem has to be extracted onto a managed
//! disk before first boot.

use async_trait::async_trait;
use burrow_core::{Error, Result};
use std::path::{Path, PathBuf};

/// Absolute paths to the assets. `initramfs` and `rootfs` may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetPaths {
    pub kernel: PathBuf,
    pub initramfs: PathBuf,
    pub rootfs: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootConfig {
    pub cmdline: String,
    pub root_device: String,
    pub root_fs_type: String,
    pub console_device: String,
}

impl BootConfig {
    /// The command line with `root=`, `rootfstype=` and `console=` appended
    /// unless already present.
    pub fn kernel_cmdline(&self) -> String {
        let mut args: Vec<String> = self.cmdline.split_whitespace().map(String::from).collect();
        let has = |args: &[String], key: &str| args.iter().any(|a| a.starts_with(key));

        if !self.root_device.is_empty() && !has(&args, "root=") {
            args.push(format!("root={}", self.root_device));
        }
        if !self.root_fs_type.is_empty() && !has(&args, "rootfstype=") {
            args.push(format!("rootfstype={}", self.root_fs_type));
        }
        if !self.console_device.is_empty() && !has(&args, "console=") {
            args.push(format!("console={}", self.console_device));
        }
        args.join(" ")
    }
}

/// What the distro needs before first boot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupRequirements {
    pub needs_formatting: bool,
    pub fs_type: String,
    /// The root filesystem must be extracted onto a writable managed disk
    /// rather than booted from the distro's own image.
    pub needs_extraction: bool,
}

#[async_trait]
pub trait AssetProvider: Send + Sync {
    /// Whether every required asset is already present locally.
    fn assets_exist(&self) -> bool;

    /// Cached asset locations, without downloading anything.
    fn asset_paths(&self) -> Result<AssetPaths>;

    /// Fetches whatever is missing and returns the resulting locations.
    async fn ensure_assets(&self) -> Result<AssetPaths>;

    fn boot_config(&self) -> BootConfig;

    fn setup_requirements(&self) -> SetupRequirements;
}

/// Assets the user already has on disk. Never downloads.
#[derive(Debug, Clone)]
pub struct LocalAssets {
    paths: AssetPaths,
    boot: BootConfig,
    requirements: Option<SetupRequirements>,
}

impl LocalAssets {
    pub fn new(kernel: impl Into<PathBuf>) -> Self {
        Self {
            paths: AssetPaths {
                kernel: kernel.into(),
                ..AssetPaths::default()
            },
            boot: BootConfig {
                cmdline: "reboot=k panic=1".to_string(),
                root_device: "/dev/vda".to_string(),
                root_fs_type: "ext4".to_string(),
                console_device: default_console().to_string(),
            },
            requirements: None,
        }
    }

    pub fn with_initramfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.initramfs = path.into();
        self
    }

    /// Boot directly from this root filesystem image.
    pub fn with_rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.rootfs = path.into();
        self
    }

    pub fn with_cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.boot.cmdline = cmdline.into();
        self
    }

    pub fn with_boot_config(mut self, boot: BootConfig) -> Self {
        self.boot = boot;
        self
    }

    pub fn with_setup_requirements(mut self, requirements: SetupRequirements) -> Self {
        self.requirements = Some(requirements);
        self
    }

    fn missing(&self) -> Vec<&Path> {
        [&self.paths.kernel, &self.paths.initramfs, &self.paths.rootfs]
            .into_iter()
            .enumerate()
            .filter(|(i, p)| (*i == 0 || !p.as_os_str().is_empty()) && !p.is_file())
            .map(|(_, p)| p.as_path())
            .collect()
    }
}

fn default_console() -> &'static str {
    if cfg!(target_os = "macos") {
        "hvc0"
    } else {
        "ttyS0"
    }
}

#[async_trait]
impl AssetProvider for LocalAssets {
    fn assets_exist(&self) -> bool {
        self.missing().is_empty()
    }

    fn asset_paths(&self) -> Result<AssetPaths> {
        Ok(self.paths.clone())
    }

    async fn ensure_assets(&self) -> Result<AssetPaths> {
        let missing = self.missing();
        if missing.is_empty() {
            return Ok(self.paths.clone());
        }
        let list: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
        Err(Error::NotFound(format!("boot assets: {}", list.join(", "))))
    }

    fn boot_config(&self) -> BootConfig {
        self.boot.clone()
    }

    fn setup_requirements(&self) -> SetupRequirements {
        self.requirements.clone().unwrap_or_else(|| SetupRequirements {
            needs_extraction: self.paths.rootfs.as_os_str().is_empty(),
            ..SetupRequirements::default()
        })
    }
}
