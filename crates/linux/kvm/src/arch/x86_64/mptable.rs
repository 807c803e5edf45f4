//! Intel MultiProcessor table.
//!
//! Linux reads it to discover the vCPUs and to route ISA interrupts through
//! the IOAPIC; without it the virtio-blk interrupt never arrives.

use burrow_core::{Error, Result};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

/// Floating pointer location, at the start of the EBDA.
pub const MPTABLE_START: u64 = 0x9_fc00;

const MAX_IRQ: u8 = 24;
const IO_APIC_DEFAULT_PHYS_BASE: u32 = 0xfec0_0000;
const APIC_DEFAULT_PHYS_BASE: u32 = 0xfee0_0000;
const APIC_VERSION: u8 = 0x14;
const MPC_SPEC: u8 = 4;

const MP_PROCESSOR: u8 = 0;
const MP_BUS: u8 = 1;
const MP_IOAPIC: u8 = 2;
const MP_INTSRC: u8 = 3;
const MP_LINTSRC: u8 = 4;

const CPU_ENABLED: u8 = 1;
const CPU_BOOTPROCESSOR: u8 = 2;
const MPC_APIC_USABLE: u8 = 1;

const MP_INT: u8 = 0;
const MP_NMI: u8 = 1;
const MP_EXTINT: u8 = 3;

const ALL_LOCAL_APICS: u8 = 0xff;

#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
struct MpfIntel {
    signature: [u8; 4],
    physptr: u32,
    length: u8,
    specification: u8,
    checksum: u8,
    feature: [u8; 5],
}

#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
struct MpcTable {
    signature: [u8; 4],
    length: u16,
    spec: u8,
    checksum: u8,
    oem: [u8; 8],
    productid: [u8; 12],
    oemptr: u32,
    oemsize: u16,
    oemcount: u16,
    lapic: u32,
    reserved: u32,
}

#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
struct MpcCpu {
    type_: u8,
    apicid: u8,
    apicver: u8,
    cpuflag: u8,
    cpufeature: u32,
    featureflag: u32,
    reserved: [u32; 2],
}

#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
struct MpcBus {
    type_: u8,
    busid: u8,
    bustype: [u8; 6],
}

#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
struct MpcIoapic {
    type_: u8,
    apicid: u8,
    apicver: u8,
    flags: u8,
    apicaddr: u32,
}

/// Shared layout of interrupt source and local interrupt source entries.
#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
struct MpcIrq {
    type_: u8,
    irqtype: u8,
    irqflag: u16,
    srcbus: u8,
    srcbusirq: u8,
    dstapic: u8,
    dstirq: u8,
}

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    // SAFETY: only called with the packed POD entry types above.
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()) }
}

fn sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Appends entries after the table header while folding their checksum.
struct EntryWriter<'a> {
    memory: &'a GuestMemoryMmap,
    cursor: u64,
    checksum: u8,
    count: u16,
}

impl EntryWriter<'_> {
    fn push<T: Copy>(&mut self, entry: T) -> Result<()> {
        let bytes = as_bytes(&entry);
        self.memory
            .write_slice(bytes, GuestAddress(self.cursor))
            .map_err(|e| Error::Resource(format!("failed to write MP table: {}", e)))?;
        self.cursor += bytes.len() as u64;
        self.checksum = self.checksum.wrapping_add(sum(bytes));
        self.count += 1;
        Ok(())
    }
}

pub fn setup_mptable(memory: &GuestMemoryMmap, num_cpus: u8) -> Result<()> {
    let ioapic_id = num_cpus + 1;
    let mpf_addr = MPTABLE_START;
    let table_addr = mpf_addr + std::mem::size_of::<MpfIntel>() as u64;
    let entries_addr = table_addr + std::mem::size_of::<MpcTable>() as u64;

    let mut entries = EntryWriter {
        memory,
        cursor: entries_addr,
        checksum: 0,
        count: 0,
    };

    for cpu in 0..num_cpus {
        let boot = if cpu == 0 { CPU_BOOTPROCESSOR } else { 0 };
        entries.push(MpcCpu {
            type_: MP_PROCESSOR,
            apicid: cpu,
            apicver: APIC_VERSION,
            cpuflag: CPU_ENABLED | boot,
            cpufeature: 0x600,
            featureflag: 0x201, // FPU | APIC
            reserved: [0; 2],
        })?;
    }
    entries.push(MpcBus {
        type_: MP_BUS,
        busid: 0,
        bustype: *b"ISA   ",
    })?;
    entries.push(MpcIoapic {
        type_: MP_IOAPIC,
        apicid: ioapic_id,
        apicver: APIC_VERSION,
        flags: MPC_APIC_USABLE,
        apicaddr: IO_APIC_DEFAULT_PHYS_BASE,
    })?;
    for irq in 0..MAX_IRQ {
        entries.push(MpcIrq {
            type_: MP_INTSRC,
            irqtype: MP_INT,
            srcbusirq: irq,
            dstapic: ioapic_id,
            dstirq: irq,
            ..Default::default()
        })?;
    }
    for (irqtype, lint) in [(MP_EXTINT, 0), (MP_NMI, 1)] {
        entries.push(MpcIrq {
            type_: MP_LINTSRC,
            irqtype,
            dstapic: ALL_LOCAL_APICS,
            dstirq: lint,
            ..Default::default()
        })?;
    }

    let mut table = MpcTable {
        signature: *b"PCMP",
        length: (entries.cursor - table_addr) as u16,
        spec: MPC_SPEC,
        oem: *b"BURROW  ",
        productid: *b"KVM         ",
        oemcount: entries.count,
        lapic: APIC_DEFAULT_PHYS_BASE,
        ..Default::default()
    };
    table.checksum = sum(as_bytes(&table))
        .wrapping_add(entries.checksum)
        .wrapping_neg();

    let mut mpf = MpfIntel {
        signature: *b"_MP_",
        physptr: table_addr as u32,
        length: 1,
        specification: MPC_SPEC,
        ..Default::default()
    };
    mpf.checksum = sum(as_bytes(&mpf)).wrapping_neg();

    let write = |bytes: &[u8], addr: u64| {
        memory
            .write_slice(bytes, GuestAddress(addr))
            .map_err(|e| Error::Resource(format!("failed to write MP table: {}", e)))
    };
    write(as_bytes(&table), table_addr)?;
    write(as_bytes(&mpf), mpf_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::memory_ranges;

    fn read(memory: &GuestMemoryMmap, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        memory.read_slice(&mut buf, GuestAddress(addr)).unwrap();
        buf
    }

    #[test]
    fn floating_pointer_checksums_to_zero() {
        let memory = GuestMemoryMmap::from_ranges(&memory_ranges(16 << 20)).unwrap();
        setup_mptable(&memory, 2).unwrap();

        let mpf = read(&memory, MPTABLE_START, std::mem::size_of::<MpfIntel>());
        assert_eq!(&mpf[..4], b"_MP_");
        assert_eq!(sum(&mpf), 0);
    }

    #[test]
    fn config_table_checksums_to_zero() {
        let memory = GuestMemoryMmap::from_ranges(&memory_ranges(16 << 20)).unwrap();
        setup_mptable(&memory, 4).unwrap();

        let table_addr = MPTABLE_START + std::mem::size_of::<MpfIntel>() as u64;
        let header = read(&memory, table_addr, std::mem::size_of::<MpcTable>());
        assert_eq!(&header[..4], b"PCMP");
        let length = u16::from_le_bytes([header[4], header[5]]) as usize;
        let expected = std::mem::size_of::<MpcTable>()
            + 4 * std::mem::size_of::<MpcCpu>()
            + std::mem::size_of::<MpcBus>()
            + std::mem::size_of::<MpcIoapic>()
            + (MAX_IRQ as usize + 2) * std::mem::size_of::<MpcIrq>();
        assert_eq!(length, expected);
        assert_eq!(sum(&read(&memory, table_addr, length)), 0);
    }
}
