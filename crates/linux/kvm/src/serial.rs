//! COM1 8250 UART bridged to the console pipes.

use crate::irq::EventFdTrigger;
use nix::errno::Errno;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use vm_device::MutDevicePio;
use vm_device::bus::{PioAddress, PioAddressOffset};
use vm_superio::Serial;
use vm_superio::serial::NoEvents;
use vmm_sys_util::eventfd::EventFd;

pub struct SerialDevice {
    uart: Serial<EventFdTrigger, NoEvents, Box<dyn Write + Send>>,
    // Host input waiting for room in the receive FIFO.
    pending: VecDeque<u8>,
}

impl SerialDevice {
    pub fn new(output: Box<dyn Write + Send>) -> io::Result<Self> {
        Ok(Self {
            uart: Serial::with_events(EventFdTrigger::new()?, NoEvents, output),
            pending: VecDeque::new(),
        })
    }

    /// A second handle on the interrupt eventfd, for the IRQ forwarder.
    pub fn interrupt_evt(&self) -> io::Result<EventFd> {
        self.uart.interrupt_evt().try_clone()
    }

    pub fn enqueue_input(&mut self, data: &[u8]) {
        self.pending.extend(data);
        self.fill_fifo();
    }

    pub fn pending_input(&self) -> usize {
        self.pending.len()
    }

    fn fill_fifo(&mut self) {
        let room = self.uart.fifo_capacity().min(self.pending.len());
        if room == 0 {
            return;
        }
        let bytes: Vec<u8> = self.pending.drain(..room).collect();
        if let Err(e) = self.uart.enqueue_raw_bytes(&bytes) {
            tracing::debug!("serial: dropped {} input bytes: {:?}", bytes.len(), e);
        }
    }
}

impl MutDevicePio for SerialDevice {
    fn pio_read(&mut self, _base: PioAddress, offset: PioAddressOffset, data: &mut [u8]) {
        // The guest draining RBR frees FIFO room.
        self.fill_fifo();
        if let Some(byte) = data.first_mut() {
            *byte = self.uart.read(offset as u8);
        }
    }

    fn pio_write(&mut self, _base: PioAddress, offset: PioAddressOffset, data: &[u8]) {
        if let Some(&byte) = data.first() {
            if let Err(e) = self.uart.write(offset as u8, byte) {
                tracing::trace!("serial write failed: {:?}", e);
            }
        }
    }
}

/// Guest-side end of the console output pipe.
///
/// The descriptor is nonblocking; when the pipe is full or nobody reads,
/// output is discarded rather than stalling the vCPU.
pub struct ConsolePipeWriter(pub OwnedFd);

impl Write for ConsolePipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match nix::unistd::write(&self.0, buf) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) | Err(Errno::EPIPE) => Ok(buf.len()),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
