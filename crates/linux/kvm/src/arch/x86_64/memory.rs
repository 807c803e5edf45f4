use burrow_core::{Error, Result};
use vm_memory::{GuestAddress, GuestMemoryMmap};

pub const BOOT_GDT_OFFSET: u64 = 0x500;
pub const BOOT_IDT_OFFSET: u64 = 0x520;
pub const BOOT_STACK_POINTER: u64 = 0x8000;
pub const PML4_START: u64 = 0x9000;
pub const PDPTE_START: u64 = 0xa000;
pub const PDE_START: u64 = 0xb000;
pub const CMDLINE_OFFSET: u64 = 0x20000;
pub const CMDLINE_MAX_SIZE: usize = 0x10000;
pub const BOOT_PARAMS_ADDR: u64 = 0x7000;
// 16 MiB, the preferred load address of a relocatable 64-bit kernel.
pub const KERNEL_LOAD_ADDR: u64 = 0x100_0000;
pub const INITRD_LOAD_ADDR: u64 = 0x400_0000;
pub const HIGH_MEMORY_START: u64 = 0x10_0000;

/// Start of the 32-bit MMIO hole. Guest RAM never overlaps it.
pub const MMIO_HOLE_START: u64 = 0xc000_0000;
pub const MMIO_HOLE_END: u64 = 0x1_0000_0000;

pub fn mib_to_bytes(memory_mb: u64) -> u64 {
    memory_mb << 20
}

/// Splits `mem_bytes` of RAM around the MMIO hole below 4 GiB.
pub fn memory_ranges(mem_bytes: u64) -> Vec<(GuestAddress, usize)> {
    if mem_bytes <= MMIO_HOLE_START {
        return vec![(GuestAddress(0), mem_bytes as usize)];
    }
    vec![
        (GuestAddress(0), MMIO_HOLE_START as usize),
        (
            GuestAddress(MMIO_HOLE_END),
            (mem_bytes - MMIO_HOLE_START) as usize,
        ),
    ]
}

pub fn create_guest_memory(memory_mb: u64) -> Result<GuestMemoryMmap> {
    GuestMemoryMmap::from_ranges(&memory_ranges(mib_to_bytes(memory_mb)))
        .map_err(|e| Error::Resource(format!("failed to create guest memory: {}", e)))
}
