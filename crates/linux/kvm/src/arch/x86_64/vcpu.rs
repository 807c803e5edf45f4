use kvm_bindings::{KVM_MAX_CPUID_ENTRIES, kvm_regs, kvm_segment};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd};
use nix::libc;
use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use vm_device::bus::{MmioAddress, PioAddress};
use vm_device::device_manager::{IoManager, MmioManager, PioManager};

use super::memory::{BOOT_GDT_OFFSET, BOOT_IDT_OFFSET, BOOT_STACK_POINTER, PML4_START};

const CR0_PE: u64 = 1 << 0;
const CR0_MP: u64 = 1 << 1;
const CR0_ET: u64 = 1 << 4;
const CR0_NE: u64 = 1 << 5;
const CR0_WP: u64 = 1 << 16;
const CR0_PG: u64 = 1 << 31;
const CR4_PAE: u64 = 1 << 5;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

const CODE_SELECTOR: u16 = 0x10;
const DATA_SELECTOR: u16 = 0x18;

/// Why a vCPU loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuExitReason {
    /// The guest halted or reset.
    Shutdown,
    /// The host cleared the running flag.
    Interrupted,
    /// `KVM_RUN` failed with an unrecoverable error.
    Fault,
}

/// Loads CPUID and, for the boot processor, the long-mode register state
/// that jumps straight into the kernel's 64-bit entry point.
pub fn configure_vcpu(
    vcpu: &VcpuFd,
    kvm: &Kvm,
    boot_cpu: bool,
    kernel_entry: u64,
    boot_params_addr: u64,
) -> Result<(), kvm_ioctls::Error> {
    let cpuid = kvm.get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)?;
    vcpu.set_cpuid2(&cpuid)?;
    setup_sregs(vcpu)?;
    if boot_cpu {
        setup_regs(vcpu, kernel_entry, boot_params_addr)?;
    }
    Ok(())
}

fn setup_regs(
    vcpu: &VcpuFd,
    kernel_entry: u64,
    boot_params_addr: u64,
) -> Result<(), kvm_ioctls::Error> {
    vcpu.set_regs(&kvm_regs {
        rflags: 0x2,
        rip: kernel_entry,
        rsp: BOOT_STACK_POINTER,
        rbp: BOOT_STACK_POINTER,
        rsi: boot_params_addr,
        ..Default::default()
    })
}

fn flat_segment(selector: u16, type_: u8, long: bool) -> kvm_segment {
    kvm_segment {
        base: 0,
        limit: 0xffff_ffff,
        selector,
        type_,
        present: 1,
        dpl: 0,
        db: u8::from(!long),
        s: 1,
        l: u8::from(long),
        g: 1,
        ..Default::default()
    }
}

fn setup_sregs(vcpu: &VcpuFd) -> Result<(), kvm_ioctls::Error> {
    let mut sregs = vcpu.get_sregs()?;

    let code = flat_segment(CODE_SELECTOR, 0xb, true);
    let data = flat_segment(DATA_SELECTOR, 0x3, false);
    sregs.cs = code;
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;

    sregs.gdt.base = BOOT_GDT_OFFSET;
    sregs.gdt.limit = 0x1f;
    sregs.idt.base = BOOT_IDT_OFFSET;
    sregs.idt.limit = 0xffff;

    sregs.cr0 = CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_WP | CR0_PG;
    sregs.cr3 = PML4_START;
    sregs.cr4 = CR4_PAE;
    sregs.efer = EFER_LME | EFER_LMA;

    vcpu.set_sregs(&sregs)
}

/// Drives one vCPU until the guest shuts down, the host clears `running`,
/// or `KVM_RUN` faults. The first vCPU to finish reports its reason; the
/// rest see `running` cleared and follow.
pub fn run_vcpu(
    id: u32,
    mut vcpu: VcpuFd,
    io: Arc<IoManager>,
    running: Arc<AtomicBool>,
    exit_tx: SyncSender<VcpuExitReason>,
) {
    // SIGUSR1 kicks the thread out of KVM_RUN.
    let mut kick = SigSet::empty();
    kick.add(Signal::SIGUSR1);
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&kick), None) {
        tracing::error!("vCPU {}: failed to unblock SIGUSR1: {}", id, e);
    }

    let reason = loop {
        if !running.load(Ordering::Acquire) {
            break VcpuExitReason::Interrupted;
        }
        match vcpu.run() {
            Ok(VcpuExit::Hlt) | Ok(VcpuExit::Shutdown) => break VcpuExitReason::Shutdown,
            Ok(VcpuExit::IoIn(port, data)) => {
                if io.pio_read(PioAddress(port), data).is_err() {
                    // Floating bus.
                    data.fill(0xff);
                }
            }
            Ok(VcpuExit::IoOut(port, data)) => {
                if let Err(e) = io.pio_write(PioAddress(port), data) {
                    tracing::trace!("unhandled PIO write to 0x{:04x}: {:?}", port, e);
                }
            }
            Ok(VcpuExit::MmioRead(addr, data)) => {
                if io.mmio_read(MmioAddress(addr), data).is_err() {
                    data.fill(0);
                }
            }
            Ok(VcpuExit::MmioWrite(addr, data)) => {
                if let Err(e) = io.mmio_write(MmioAddress(addr), data) {
                    tracing::trace!("unhandled MMIO write to 0x{:x}: {:?}", addr, e);
                }
            }
            Ok(other) => tracing::trace!("vCPU {}: ignored exit {:?}", id, other),
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {}
            Err(e) => {
                tracing::error!("vCPU {}: run failed: {}", id, e);
                break VcpuExitReason::Fault;
            }
        }
    };

    tracing::debug!("vCPU {} exited: {:?}", id, reason);
    let _ = exit_tx.try_send(reason);
    running.store(false, Ordering::Release);
}
