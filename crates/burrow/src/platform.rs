//! Picks the driver for the host this binary runs on.

use burrow_core::{Driver, Result};
use std::sync::Arc;

/// The native driver for this host: Virtualization.framework on macOS, KVM
/// on x86_64 Linux.
#[cfg(target_os = "macos")]
pub fn new_driver() -> Result<Arc<dyn Driver>> {
    Ok(Arc::new(burrow_apple_vz::VzDriver::new()?))
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn new_driver() -> Result<Arc<dyn Driver>> {
    Ok(Arc::new(burrow_linux_kvm::KvmDriver::new()?))
}

#[cfg(not(any(
    target_os = "macos",
    all(target_os = "linux", target_arch = "x86_64")
)))]
pub fn new_driver() -> Result<Arc<dyn Driver>> {
    Err(burrow_core::Error::UnsupportedPlatform(format!(
        "no hypervisor driver for {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )))
}
