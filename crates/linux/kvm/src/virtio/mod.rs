//! virtio-mmio (version 2) transport definitions.

mod blk;

pub use blk::VirtioBlk;

pub const MMIO_MAGIC: u64 = 0x00;
pub const MMIO_VERSION: u64 = 0x04;
pub const MMIO_DEVICE_ID: u64 = 0x08;
pub const MMIO_VENDOR_ID: u64 = 0x0c;
pub const MMIO_DEVICE_FEATURES: u64 = 0x10;
pub const MMIO_DEVICE_FEATURES_SEL: u64 = 0x14;
pub const MMIO_DRIVER_FEATURES: u64 = 0x20;
pub const MMIO_DRIVER_FEATURES_SEL: u64 = 0x24;
pub const MMIO_QUEUE_SEL: u64 = 0x30;
pub const MMIO_QUEUE_NUM_MAX: u64 = 0x34;
pub const MMIO_QUEUE_NUM: u64 = 0x38;
pub const MMIO_QUEUE_READY: u64 = 0x44;
pub const MMIO_QUEUE_NOTIFY: u64 = 0x50;
pub const MMIO_INTERRUPT_STATUS: u64 = 0x60;
pub const MMIO_INTERRUPT_ACK: u64 = 0x64;
pub const MMIO_STATUS: u64 = 0x70;
pub const MMIO_QUEUE_DESC_LOW: u64 = 0x80;
pub const MMIO_QUEUE_DESC_HIGH: u64 = 0x84;
pub const MMIO_QUEUE_AVAIL_LOW: u64 = 0x90;
pub const MMIO_QUEUE_AVAIL_HIGH: u64 = 0x94;
pub const MMIO_QUEUE_USED_LOW: u64 = 0xa0;
pub const MMIO_QUEUE_USED_HIGH: u64 = 0xa4;
pub const MMIO_CONFIG: u64 = 0x100;

/// "virt", little-endian.
pub const MMIO_MAGIC_VALUE: u32 = 0x7472_6976;
pub const MMIO_VERSION_MODERN: u32 = 2;
/// "QEMU"; some guest drivers key quirks off the vendor.
pub const MMIO_VENDOR_VALUE: u32 = 0x554d_4551;

pub const STATUS_DRIVER_OK: u32 = 4;
pub const INT_USED_RING: u32 = 1;

pub const F_VERSION_1: u64 = 1 << 32;

pub const QUEUE_SIZE: u16 = 256;
