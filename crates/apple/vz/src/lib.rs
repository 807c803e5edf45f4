//! Virtualization.framework driver for burrow.
//!
//! Boots Linux guests through `VZLinuxBootLoader` with a virtio console
//! bridged to the console pipes, an optional virtio-blk disk, virtio-fs
//! shares keyed by mount tag and a NAT network device.
//!
//! Every framework call is made on the main dispatch queue. The host binary
//! must therefore keep the main thread's run loop serviced (for example by
//! running its tokio runtime on a worker thread and parking the main thread
//! in `CFRunLoopRun`).
#![cfg(target_os = "macos")]

mod delegate;
mod device;
mod driver;
mod main_queue;
mod machine;

pub use driver::VzDriver;
