//! KVM driver for burrow.
//!
//! Boots Linux guests directly from a bzImage on `/dev/kvm`:
//!
//! - **Direct boot**: bzImage plus optional initrd, 64-bit entry
//! - **Serial console**: 8250 UART on COM1 bridged to the console pipes
//! - **Disk**: virtio-blk over MMIO (`/dev/vda` in the guest)
//! - **SMP**: any vCPU count up to 254, described by an MP table
//!
//! Shared directories, networking and snapshots are not offered; the
//! manager degrades them away with a warning.
//!
//! # Example
//!
//! ```no_run
//! use burrow_core::Driver;
//! use burrow_linux_kvm::KvmDriver;
//!
//! if KvmDriver::is_available() {
//!     let driver = KvmDriver::new().unwrap();
//!     println!("{:?}", driver.info());
//! }
//! ```
#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

mod arch;
mod driver;
mod irq;
mod machine;
mod rtc;
mod serial;
mod virtio;

pub use driver::KvmDriver;
