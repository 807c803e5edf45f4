//! Interrupt injection for the emulated devices.
//!
//! Devices signal an eventfd; a forwarder thread per line turns each signal
//! into a low-high pulse on the in-kernel IRQ chip via `KVM_IRQ_LINE`.
//! (`KVM_IRQFD` registers fine but the pulses never reached the guest once
//! the IOAPIC took over from the PIC.)

use kvm_ioctls::VmFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use vm_superio::Trigger;
use vmm_sys_util::eventfd::EventFd;

/// Eventfd-backed trigger handed to a device.
pub struct EventFdTrigger(EventFd);

impl EventFdTrigger {
    pub fn new() -> std::io::Result<Self> {
        EventFd::new(0).map(Self)
    }

    pub fn try_clone(&self) -> std::io::Result<EventFd> {
        self.0.try_clone()
    }
}

impl Trigger for EventFdTrigger {
    type E = std::io::Error;

    fn trigger(&self) -> std::io::Result<()> {
        self.0.write(1)
    }
}

/// Owns a forwarder thread. Dropping it stops the thread.
pub struct IrqForwarder {
    wake: EventFd,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl IrqForwarder {
    pub fn spawn(vm: Arc<VmFd>, irq: u32, evt: EventFd) -> std::io::Result<Self> {
        let wake = evt.try_clone()?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name(format!("irq-{}", irq))
            .spawn(move || {
                while evt.read().is_ok() && !stop_flag.load(Ordering::Acquire) {
                    if let Err(e) = vm
                        .set_irq_line(irq, false)
                        .and_then(|_| vm.set_irq_line(irq, true))
                    {
                        tracing::warn!("Failed to inject IRQ {}: {}", irq, e);
                    }
                }
            })?;
        Ok(Self {
            wake,
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for IrqForwarder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.wake.write(1);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
