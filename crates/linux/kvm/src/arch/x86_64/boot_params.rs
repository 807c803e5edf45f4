//! Zero page, command line, identity page tables and GDT for a 64-bit
//! direct kernel entry.

use super::memory::{
    BOOT_GDT_OFFSET, BOOT_PARAMS_ADDR, CMDLINE_MAX_SIZE, CMDLINE_OFFSET, HIGH_MEMORY_START,
    MMIO_HOLE_END, MMIO_HOLE_START, PDE_START, PDPTE_START, PML4_START,
};
use burrow_core::{Error, Result};
use linux_loader::bootparam::{boot_e820_entry, boot_params, setup_header};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

const E820_RAM: u32 = 1;
const E820_RESERVED: u32 = 2;

const EBDA_START: u64 = 0x9_fc00;
const BIOS_START: u64 = 0xe_8000;
const BIOS_END: u64 = 0x10_0000;

// Marks the loader as "undefined"; the kernel only checks it is non-zero.
const LOADER_TYPE_UNDEFINED: u8 = 0xff;

/// Where the initrd was placed, if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitrdRegion {
    pub addr: u64,
    pub size: u64,
}

pub fn setup_boot_params(
    memory: &GuestMemoryMmap,
    cmdline: &str,
    kernel_header: Option<setup_header>,
    initrd: Option<InitrdRegion>,
    mem_bytes: u64,
) -> Result<()> {
    write_cmdline(memory, cmdline)?;
    write_page_tables(memory).map_err(guest_write_failed)?;
    write_gdt(memory).map_err(guest_write_failed)?;

    let mut params = boot_params::default();
    if let Some(hdr) = kernel_header {
        params.hdr = hdr;
    }
    params.hdr.type_of_loader = LOADER_TYPE_UNDEFINED;
    params.hdr.cmd_line_ptr = CMDLINE_OFFSET as u32;
    params.hdr.cmdline_size = cmdline.len() as u32;
    if let Some(initrd) = initrd {
        params.hdr.ramdisk_image = initrd.addr as u32;
        params.hdr.ramdisk_size = initrd.size as u32;
    }

    let map = e820_map(mem_bytes);
    params.e820_entries = map.len() as u8;
    for (slot, entry) in params.e820_table.iter_mut().zip(map) {
        *slot = entry;
    }

    // SAFETY: boot_params is a plain-old-data repr(C) struct.
    let bytes = unsafe {
        std::slice::from_raw_parts(
            &params as *const boot_params as *const u8,
            std::mem::size_of::<boot_params>(),
        )
    };
    memory
        .write_slice(bytes, GuestAddress(BOOT_PARAMS_ADDR))
        .map_err(guest_write_failed)
}

fn e820(addr: u64, size: u64, type_: u32) -> boot_e820_entry {
    boot_e820_entry { addr, size, r#type: type_ }
}

fn e820_map(mem_bytes: u64) -> Vec<boot_e820_entry> {
    let mut map = vec![
        e820(0, EBDA_START, E820_RAM),
        e820(EBDA_START, 0x400, E820_RESERVED),
        e820(BIOS_START, BIOS_END - BIOS_START, E820_RESERVED),
        e820(
            HIGH_MEMORY_START,
            mem_bytes.min(MMIO_HOLE_START) - HIGH_MEMORY_START,
            E820_RAM,
        ),
    ];
    if mem_bytes > MMIO_HOLE_START {
        map.push(e820(MMIO_HOLE_END, mem_bytes - MMIO_HOLE_START, E820_RAM));
    }
    map
}

fn write_cmdline(memory: &GuestMemoryMmap, cmdline: &str) -> Result<()> {
    if cmdline.len() >= CMDLINE_MAX_SIZE {
        return Err(Error::InvalidConfig(format!(
            "kernel command line is {} bytes, limit is {}",
            cmdline.len(),
            CMDLINE_MAX_SIZE - 1
        )));
    }
    let mut bytes = cmdline.as_bytes().to_vec();
    bytes.push(0);
    memory
        .write_slice(&bytes, GuestAddress(CMDLINE_OFFSET))
        .map_err(guest_write_failed)
}

// Identity-maps the first GiB with 2 MiB pages.
fn write_page_tables(
    memory: &GuestMemoryMmap,
) -> std::result::Result<(), vm_memory::GuestMemoryError> {
    memory.write_obj(PDPTE_START | 0x3, GuestAddress(PML4_START))?;
    memory.write_obj(PDE_START | 0x3, GuestAddress(PDPTE_START))?;
    for i in 0..512u64 {
        memory.write_obj((i << 21) | 0x83, GuestAddress(PDE_START + i * 8))?;
    }
    Ok(())
}

fn write_gdt(memory: &GuestMemoryMmap) -> std::result::Result<(), vm_memory::GuestMemoryError> {
    let gdt: [u64; 4] = [
        0,
        0,
        0x00af_9a00_0000_ffff, // code64
        0x00cf_9200_0000_ffff, // data
    ];
    for (i, entry) in gdt.iter().enumerate() {
        memory.write_obj(*entry, GuestAddress(BOOT_GDT_OFFSET + i as u64 * 8))?;
    }
    Ok(())
}

fn guest_write_failed(e: vm_memory::GuestMemoryError) -> Error {
    Error::Resource(format!("failed to write boot structures: {}", e))
}
