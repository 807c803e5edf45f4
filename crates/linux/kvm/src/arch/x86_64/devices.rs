//! Fixed guest-physical placement of the emulated devices.

pub const SERIAL_PORT_BASE: u16 = 0x3f8;
pub const SERIAL_PORT_END: u16 = 0x3ff;
pub const SERIAL_IRQ: u32 = 4;

pub const RTC_INDEX_PORT: u16 = 0x70;
pub const RTC_PORT_COUNT: u16 = 2;

pub const VIRTIO_MMIO_BASE: u64 = 0xd000_0000;
pub const VIRTIO_MMIO_SIZE: u64 = 0x200;
pub const VIRTIO_BLK_IRQ: u32 = 5;

/// Kernel argument announcing the virtio-blk MMIO window to the guest.
pub fn virtio_blk_cmdline_arg() -> String {
    format!(
        "virtio_mmio.device=0x{:x}@0x{:x}:{}",
        VIRTIO_MMIO_SIZE, VIRTIO_MMIO_BASE, VIRTIO_BLK_IRQ
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blk_cmdline_arg_matches_mmio_window() {
        assert_eq!(
            virtio_blk_cmdline_arg(),
            "virtio_mmio.device=0x200@0xd0000000:5"
        );
    }
}
