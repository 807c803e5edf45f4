//! virtio-blk over MMIO, backed by a raw disk image.
//!
//! One request queue. Requests are served synchronously on the vCPU thread
//! that rings the doorbell.

use super::*;
use crate::irq::EventFdTrigger;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use virtio_queue::desc::split::Descriptor;
use virtio_queue::{Queue, QueueT};
use vm_device::MutDeviceMmio;
use vm_device::bus::{MmioAddress, MmioAddressOffset};
use vm_memory::{Address, Bytes, GuestMemoryError, GuestMemoryMmap};
use vm_superio::Trigger;
use vmm_sys_util::eventfd::EventFd;

const VIRTIO_ID_BLOCK: u32 = 2;

const SECTOR_SIZE: u64 = 512;
const REQUEST_HEADER_LEN: u32 = 16;
const DISK_ID: &[u8] = b"burrow-disk";
const DISK_ID_LEN: usize = 20;

const F_SIZE_MAX: u64 = 1 << 1;
const F_SEG_MAX: u64 = 1 << 2;
const F_FLUSH: u64 = 1 << 9;

const SIZE_MAX: u32 = 128 * 1024;
const SEG_MAX: u32 = QUEUE_SIZE as u32 - 2;

const T_IN: u32 = 0;
const T_OUT: u32 = 1;
const T_FLUSH: u32 = 4;
const T_GET_ID: u32 = 8;

const S_OK: u8 = 0;
const S_IOERR: u8 = 1;
const S_UNSUPP: u8 = 2;

#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("unsupported request type {0}")]
    Unsupported(u32),
    #[error("malformed request: {0}")]
    Malformed(&'static str),
    #[error("{len} bytes at sector {sector} exceed the disk")]
    OutOfRange { sector: u64, len: u64 },
    #[error("disk detached")]
    Detached,
    #[error("disk I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("guest memory access failed: {0}")]
    Memory(#[from] GuestMemoryError),
}

impl RequestError {
    fn status(&self) -> u8 {
        match self {
            RequestError::Unsupported(_) => S_UNSUPP,
            _ => S_IOERR,
        }
    }
}

pub struct VirtioBlk {
    disk: Option<File>,
    capacity: u64,
    memory: Arc<GuestMemoryMmap>,
    queue: Queue,

    device_features_sel: u32,
    driver_features: u64,
    driver_features_sel: u32,
    queue_sel: u32,
    status: u32,
    interrupt_status: u32,
    interrupt: EventFdTrigger,
}

impl VirtioBlk {
    pub fn new(disk: File, memory: Arc<GuestMemoryMmap>) -> io::Result<Self> {
        let capacity = disk.metadata()?.len() / SECTOR_SIZE;
        let queue = Queue::new(QUEUE_SIZE)
            .map_err(|e| io::Error::other(format!("failed to create queue: {:?}", e)))?;
        Ok(Self {
            disk: Some(disk),
            capacity,
            memory,
            queue,
            device_features_sel: 0,
            driver_features: 0,
            driver_features_sel: 0,
            queue_sel: 0,
            status: 0,
            interrupt_status: 0,
            interrupt: EventFdTrigger::new()?,
        })
    }

    pub fn interrupt_evt(&self) -> io::Result<EventFd> {
        self.interrupt.try_clone()
    }

    /// Capacity in 512-byte sectors.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Releases the disk file. Later requests complete with an I/O error.
    pub fn detach(&mut self) {
        if self.disk.take().is_some() {
            tracing::debug!("virtio-blk: disk detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.disk.is_some()
    }

    fn device_features(&self) -> u64 {
        F_VERSION_1 | F_SIZE_MAX | F_SEG_MAX | F_FLUSH
    }

    fn config_space(&self) -> [u8; 16] {
        let mut config = [0u8; 16];
        config[..8].copy_from_slice(&self.capacity.to_le_bytes());
        config[8..12].copy_from_slice(&SIZE_MAX.to_le_bytes());
        config[12..].copy_from_slice(&SEG_MAX.to_le_bytes());
        config
    }

    fn reset(&mut self) {
        self.queue.reset();
        self.device_features_sel = 0;
        self.driver_features = 0;
        self.driver_features_sel = 0;
        self.queue_sel = 0;
        self.status = 0;
        self.interrupt_status = 0;
    }

    fn process_queue(&mut self) {
        let memory = self.memory.clone();
        let mem = memory.as_ref();
        let mut completed = 0;

        while let Some(chain) = self.queue.pop_descriptor_chain(mem) {
            let head = chain.head_index();
            let descriptors: Vec<Descriptor> = chain.collect();
            let len = self.complete_request(mem, &descriptors);
            if let Err(e) = self.queue.add_used(mem, head, len) {
                tracing::warn!("virtio-blk: failed to return descriptor {}: {:?}", head, e);
                break;
            }
            completed += 1;
        }

        if completed > 0 {
            self.interrupt_status |= INT_USED_RING;
            if let Err(e) = self.interrupt.trigger() {
                tracing::warn!("virtio-blk: failed to signal interrupt: {}", e);
            }
        }
    }

    /// Runs one request and writes its status byte. Returns the number of
    /// bytes written into guest buffers, status included.
    fn complete_request(&mut self, mem: &GuestMemoryMmap, descriptors: &[Descriptor]) -> u32 {
        let Some((header, rest)) = descriptors.split_first() else {
            return 0;
        };
        let Some((status, data)) = rest.split_last() else {
            tracing::debug!("virtio-blk: request without status descriptor");
            return 0;
        };
        if !status.is_write_only() || status.len() < 1 {
            tracing::debug!("virtio-blk: unusable status descriptor");
            return 0;
        }

        let (code, written) = match self.execute(mem, header, data) {
            Ok(written) => (S_OK, written),
            Err(e) => {
                tracing::debug!("virtio-blk: {}", e);
                (e.status(), 0)
            }
        };
        match mem.write_obj(code, status.addr()) {
            Ok(()) => written + 1,
            Err(_) => written,
        }
    }

    fn execute(
        &mut self,
        mem: &GuestMemoryMmap,
        header: &Descriptor,
        data: &[Descriptor],
    ) -> Result<u32, RequestError> {
        if header.is_write_only() || header.len() < REQUEST_HEADER_LEN {
            return Err(RequestError::Malformed("bad request header"));
        }
        let request_type: u32 = mem.read_obj(header.addr())?;
        let sector: u64 = mem.read_obj(header.addr().unchecked_add(8))?;

        match request_type {
            T_IN => self.read_sectors(mem, sector, data),
            T_OUT => self.write_sectors(mem, sector, data).map(|()| 0),
            T_FLUSH => {
                self.disk()?.sync_all()?;
                Ok(0)
            }
            T_GET_ID => write_id(mem, data),
            other => Err(RequestError::Unsupported(other)),
        }
    }

    fn disk(&self) -> Result<&File, RequestError> {
        self.disk.as_ref().ok_or(RequestError::Detached)
    }

    fn check_range(&self, sector: u64, data: &[Descriptor]) -> Result<u64, RequestError> {
        let len: u64 = data.iter().map(|d| d.len() as u64).sum();
        let start = sector
            .checked_mul(SECTOR_SIZE)
            .ok_or(RequestError::OutOfRange { sector, len })?;
        match start.checked_add(len) {
            Some(end) if end <= self.capacity * SECTOR_SIZE => Ok(start),
            _ => Err(RequestError::OutOfRange { sector, len }),
        }
    }

    fn read_sectors(
        &self,
        mem: &GuestMemoryMmap,
        sector: u64,
        data: &[Descriptor],
    ) -> Result<u32, RequestError> {
        let disk = self.disk()?;
        let mut offset = self.check_range(sector, data)?;
        let mut written = 0u32;
        for desc in data {
            if !desc.is_write_only() {
                return Err(RequestError::Malformed("read into device-readable buffer"));
            }
            let mut buf = segment_buffer(desc)?;
            disk.read_exact_at(&mut buf, offset)?;
            mem.write_slice(&buf, desc.addr())?;
            offset += buf.len() as u64;
            written += desc.len();
        }
        Ok(written)
    }

    fn write_sectors(
        &self,
        mem: &GuestMemoryMmap,
        sector: u64,
        data: &[Descriptor],
    ) -> Result<(), RequestError> {
        let disk = self.disk()?;
        let mut offset = self.check_range(sector, data)?;
        for desc in data {
            if desc.is_write_only() {
                return Err(RequestError::Malformed("write from device-writable buffer"));
            }
            let mut buf = segment_buffer(desc)?;
            mem.read_slice(&mut buf, desc.addr())?;
            disk.write_all_at(&buf, offset)?;
            offset += buf.len() as u64;
        }
        Ok(())
    }

    fn read_register(&self, offset: u64) -> u32 {
        match offset {
            MMIO_MAGIC => MMIO_MAGIC_VALUE,
            MMIO_VERSION => MMIO_VERSION_MODERN,
            MMIO_DEVICE_ID => VIRTIO_ID_BLOCK,
            MMIO_VENDOR_ID => MMIO_VENDOR_VALUE,
            MMIO_DEVICE_FEATURES => match self.device_features_sel {
                0 => self.device_features() as u32,
                1 => (self.device_features() >> 32) as u32,
                _ => 0,
            },
            MMIO_QUEUE_NUM_MAX if self.queue_sel == 0 => self.queue.max_size() as u32,
            MMIO_QUEUE_READY if self.queue_sel == 0 => u32::from(self.queue.ready()),
            MMIO_INTERRUPT_STATUS => self.interrupt_status,
            MMIO_STATUS => self.status,
            _ => 0,
        }
    }

    fn write_register(&mut self, offset: u64, val: u32) {
        let selected = self.queue_sel == 0;
        match offset {
            MMIO_DEVICE_FEATURES_SEL => self.device_features_sel = val,
            MMIO_DRIVER_FEATURES_SEL => self.driver_features_sel = val,
            MMIO_DRIVER_FEATURES => match self.driver_features_sel {
                0 => self.driver_features = (self.driver_features & !0xffff_ffff) | val as u64,
                1 => {
                    self.driver_features =
                        (self.driver_features & 0xffff_ffff) | ((val as u64) << 32)
                }
                _ => {}
            },
            MMIO_QUEUE_SEL => self.queue_sel = val,
            MMIO_QUEUE_NUM if selected => self.queue.set_size(val as u16),
            MMIO_QUEUE_READY if selected => {
                self.queue.set_ready(val == 1);
                if val == 1 && !self.queue.is_valid(self.memory.as_ref()) {
                    tracing::warn!("virtio-blk: guest enabled an invalid queue");
                }
            }
            MMIO_QUEUE_DESC_LOW if selected => self.queue.set_desc_table_address(Some(val), None),
            MMIO_QUEUE_DESC_HIGH if selected => self.queue.set_desc_table_address(None, Some(val)),
            MMIO_QUEUE_AVAIL_LOW if selected => self.queue.set_avail_ring_address(Some(val), None),
            MMIO_QUEUE_AVAIL_HIGH if selected => {
                self.queue.set_avail_ring_address(None, Some(val))
            }
            MMIO_QUEUE_USED_LOW if selected => self.queue.set_used_ring_address(Some(val), None),
            MMIO_QUEUE_USED_HIGH if selected => self.queue.set_used_ring_address(None, Some(val)),
            MMIO_QUEUE_NOTIFY => {
                if val == 0 && self.status & STATUS_DRIVER_OK != 0 {
                    self.process_queue();
                }
            }
            MMIO_INTERRUPT_ACK => self.interrupt_status &= !val,
            MMIO_STATUS => {
                if val == 0 {
                    self.reset();
                    return;
                }
                if val & STATUS_DRIVER_OK != 0 && self.status & STATUS_DRIVER_OK == 0 {
                    tracing::debug!(
                        "virtio-blk: driver ready, features 0x{:x}",
                        self.driver_features
                    );
                }
                self.status = val;
            }
            _ => tracing::trace!("virtio-blk: ignored write 0x{:x} = 0x{:x}", offset, val),
        }
    }
}

fn segment_buffer(desc: &Descriptor) -> Result<Vec<u8>, RequestError> {
    if desc.len() > SIZE_MAX {
        return Err(RequestError::Malformed("segment exceeds size_max"));
    }
    Ok(vec![0u8; desc.len() as usize])
}

fn write_id(mem: &GuestMemoryMmap, data: &[Descriptor]) -> Result<u32, RequestError> {
    let desc = data
        .first()
        .filter(|d| d.is_write_only())
        .ok_or(RequestError::Malformed("GET_ID without buffer"))?;
    let mut id = [0u8; DISK_ID_LEN];
    id[..DISK_ID.len()].copy_from_slice(DISK_ID);
    let len = (desc.len() as usize).min(DISK_ID_LEN);
    mem.write_slice(&id[..len], desc.addr())?;
    Ok(len as u32)
}

impl MutDeviceMmio for VirtioBlk {
    fn mmio_read(&mut self, _base: MmioAddress, offset: MmioAddressOffset, data: &mut [u8]) {
        if offset >= MMIO_CONFIG {
            let config = self.config_space();
            let start = (offset - MMIO_CONFIG) as usize;
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = config.get(start + i).copied().unwrap_or(0);
            }
            return;
        }
        let val = self.read_register(offset).to_le_bytes();
        let n = data.len().min(4);
        data[..n].copy_from_slice(&val[..n]);
    }

    fn mmio_write(&mut self, _base: MmioAddress, offset: MmioAddressOffset, data: &[u8]) {
        if offset >= MMIO_CONFIG {
            return;
        }
        let Ok(bytes) = <[u8; 4]>::try_from(data) else {
            tracing::trace!("virtio-blk: ignored {}-byte write at 0x{:x}", data.len(), offset);
            return;
        };
        self.write_register(offset, u32::from_le_bytes(bytes));
    }
}
