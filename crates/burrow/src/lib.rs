//! Lightweight Linux VMs on the host's native hypervisor.
//!
//! The pieces, from the bottom up:
//!
//! - a [`Driver`] per host hypervisor (see [`platform::new_driver`]),
//! - the [`Manager`], which provisions, boots and watches one VM,
//! - the [`SnapshotEngine`], which copies a VM's disk in and out of
//!   compressed, checksummed snapshots.
//!
//! ```rust,no_run
//! use burrow::{ImageStore, LocalAssets, Manager, ManagerConfig, VmLayout};
//! use std::sync::Arc;
//!
//! # async fn example() -> burrow::Result<()> {
//! let layout = VmLayout::new("/var/lib/burrow", "dev")?;
//! let assets = LocalAssets::new("/boot/vmlinuz").with_initramfs("/boot/initrd.img");
//! let disks = ImageStore::new(layout.dir());
//!
//! let manager = Manager::new(
//!     ManagerConfig::default(),
//!     layout,
//!     burrow::platform::new_driver()?,
//!     Arc::new(assets),
//!     Arc::new(disks),
//! );
//! manager.prepare().await?;
//! manager.start().await?;
//! manager.wait().await?;
//! # Ok(())
//! # }
//! ```

mod assets;
mod fsutil;
mod images;
mod layout;
mod manager;
mod mount;
pub mod platform;
mod running;
mod snapshot;

pub use assets::{AssetPaths, AssetProvider, BootConfig, LocalAssets, SetupRequirements};
pub use images::{DiskProvider, ImageStore};
pub use layout::VmLayout;
pub use manager::{
    DEFAULT_CPUS, DEFAULT_DISK_NAME, DEFAULT_DISK_SIZE_MB, DEFAULT_MEMORY_MB, Manager,
    ManagerConfig, ManagerState, PersistentState, SSH_GUEST_PORT, StateFile,
};
pub use mount::{MountHelper, quote as shell_quote};
pub use running::{RunningMarker, running_pid};
pub use snapshot::{SnapshotEngine, SnapshotEntry};

pub use burrow_core::{
    Capabilities, Console, ConsoleReader, ConsoleWriter, Driver, DriverInfo, DriverState, Error,
    ExitSignal, ExitStatus, NetworkConfig, NetworkMode, Result, SharedDir, VmConfig,
};
