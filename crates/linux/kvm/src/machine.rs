//! One KVM virtual machine: built by `create`, booted by `start`.

use crate::arch::{
    BOOT_PARAMS_ADDR, INITRD_LOAD_ADDR, InitrdRegion, KERNEL_LOAD_ADDR, RTC_INDEX_PORT,
    RTC_PORT_COUNT, SERIAL_IRQ, SERIAL_PORT_BASE, SERIAL_PORT_END, VIRTIO_BLK_IRQ,
    VIRTIO_MMIO_BASE, VIRTIO_MMIO_SIZE, VcpuExitReason, configure_vcpu, create_guest_memory,
    mib_to_bytes, run_vcpu, setup_boot_params, setup_mptable, virtio_blk_cmdline_arg,
};
use crate::irq::IrqForwarder;
use crate::rtc::RtcDevice;
use crate::serial::{ConsolePipeWriter, SerialDevice};
use crate::virtio::VirtioBlk;
use burrow_core::{Error, ExitStatus, GuestConsole, Result, VmConfig, set_nonblocking};
use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};
use linux_loader::bootparam::setup_header;
use linux_loader::loader::KernelLoader;
use linux_loader::loader::bzimage::BzImage;
use nix::sys::pthread::{Pthread, pthread_kill};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;
use vm_device::bus::{MmioAddress, MmioRange, PioAddress, PioRange};
use vm_device::device_manager::{IoManager, MmioManager, PioManager};
use vm_memory::{Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion};

// 64-bit kernels are entered 0x200 past the protected-mode load address.
const ENTRY_64_OFFSET: u64 = 0x200;
const KICK_INTERVAL: Duration = Duration::from_millis(20);

static KICK_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs a no-op SIGUSR1 handler so the signal only interrupts
/// `KVM_RUN` with EINTR. Idempotent.
fn install_kick_handler() -> Result<()> {
    if KICK_HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    extern "C" fn kick(_: nix::libc::c_int) {}

    let action = SigAction::new(SigHandler::Handler(kick), SaFlags::empty(), SigSet::empty());
    // SAFETY: the handler does nothing, so it is async-signal-safe.
    unsafe { sigaction(Signal::SIGUSR1, &action) }.map_err(|e| {
        KICK_HANDLER_INSTALLED.store(false, Ordering::SeqCst);
        Error::Resource(format!("failed to install SIGUSR1 handler: {}", e))
    })?;
    Ok(())
}

fn resource<E: std::fmt::Display>(what: &str) -> impl FnOnce(E) -> Error + '_ {
    move |e| Error::Resource(format!("failed to {}: {}", what, e))
}

/// Appends the virtio-blk window when a disk is attached.
pub fn compose_cmdline(config: &VmConfig) -> String {
    let mut cmdline = config.cmdline.trim().to_string();
    if config.disk.is_some() {
        if !cmdline.is_empty() {
            cmdline.push(' ');
        }
        cmdline.push_str(&virtio_blk_cmdline_arg());
    }
    cmdline
}

struct DiskDevice {
    device: Arc<Mutex<VirtioBlk>>,
    interrupt: vmm_sys_util::eventfd::EventFd,
}

/// A fully assembled VM that has not run yet.
pub struct Machine {
    vm: Arc<VmFd>,
    memory: Arc<GuestMemoryMmap>,
    io: Arc<IoManager>,
    vcpus: Vec<VcpuFd>,
    serial: Arc<Mutex<SerialDevice>>,
    serial_interrupt: vmm_sys_util::eventfd::EventFd,
    disk: Option<DiskDevice>,
    console_input: OwnedFd,
}

impl Machine {
    pub fn build(config: &VmConfig, console: GuestConsole) -> Result<Self> {
        let kvm = Kvm::new().map_err(resource("open /dev/kvm"))?;
        let vm = kvm.create_vm().map_err(resource("create VM"))?;
        vm.create_irq_chip().map_err(resource("create IRQ chip"))?;
        vm.create_pit2(kvm_pit_config::default())
            .map_err(resource("create PIT"))?;

        let memory = Arc::new(create_guest_memory(config.memory_mb)?);
        register_memory(&vm, &memory)?;

        let (entry, header) = load_kernel(&memory, &config.kernel)?;
        tracing::debug!("Kernel loaded, entry point 0x{:x}", entry);
        let initrd = match &config.initrd {
            Some(path) => {
                let region = load_initrd(&memory, path)?;
                tracing::debug!(
                    "Initrd loaded at 0x{:x}, {} bytes",
                    region.addr,
                    region.size
                );
                Some(region)
            }
            None => None,
        };

        let cmdline = compose_cmdline(config);
        tracing::debug!("Kernel cmdline: {}", cmdline);
        setup_boot_params(
            &memory,
            &cmdline,
            header,
            initrd,
            mib_to_bytes(config.memory_mb),
        )?;
        setup_mptable(&memory, config.cpus as u8)?;

        set_nonblocking(&console.input)?;
        set_nonblocking(&console.output)?;
        let serial = SerialDevice::new(Box::new(ConsolePipeWriter(console.output)))
            .map_err(resource("create serial device"))?;
        let serial_interrupt = serial
            .interrupt_evt()
            .map_err(resource("clone serial eventfd"))?;
        let serial = Arc::new(Mutex::new(serial));

        let mut io = IoManager::new();
        register_pio(
            &mut io,
            SERIAL_PORT_BASE,
            SERIAL_PORT_END - SERIAL_PORT_BASE + 1,
            serial.clone(),
        )?;
        register_pio(
            &mut io,
            RTC_INDEX_PORT,
            RTC_PORT_COUNT,
            Arc::new(Mutex::new(RtcDevice::new())),
        )?;

        let disk = match &config.disk {
            Some(path) => Some(attach_disk(&mut io, path, memory.clone())?),
            None => None,
        };

        let vcpus = (0..config.cpus)
            .map(|id| {
                let vcpu = vm
                    .create_vcpu(id as u64)
                    .map_err(resource("create vCPU"))?;
                configure_vcpu(&vcpu, &kvm, id == 0, entry, BOOT_PARAMS_ADDR)
                    .map_err(resource("configure vCPU"))?;
                Ok(vcpu)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            vm: Arc::new(vm),
            memory,
            io: Arc::new(io),
            vcpus,
            serial,
            serial_interrupt,
            disk,
            console_input: console.input,
        })
    }

    /// Spawns the vCPU threads, the interrupt forwarders and the console
    /// input pump. Must run inside a tokio runtime.
    pub fn boot(self) -> Result<RunningMachine> {
        install_kick_handler()?;

        let mut irqs = vec![
            IrqForwarder::spawn(self.vm.clone(), SERIAL_IRQ, self.serial_interrupt)
                .map_err(resource("spawn serial IRQ thread"))?,
        ];
        let disk = match self.disk {
            Some(disk) => {
                irqs.push(
                    IrqForwarder::spawn(self.vm.clone(), VIRTIO_BLK_IRQ, disk.interrupt)
                        .map_err(resource("spawn virtio-blk IRQ thread"))?,
                );
                Some(disk.device)
            }
            None => None,
        };
        let input_task = spawn_console_input(self.console_input, self.serial)?;

        let running = Arc::new(AtomicBool::new(true));
        let (exit_tx, exit_rx) = sync_channel(1);
        let mut threads = Vec::new();
        let mut handles = Vec::new();

        for (id, vcpu) in self.vcpus.into_iter().enumerate() {
            let io = self.io.clone();
            let running_flag = running.clone();
            let exit_tx = exit_tx.clone();
            let (tid_tx, tid_rx) = std::sync::mpsc::channel();
            let spawned = std::thread::Builder::new()
                .name(format!("vcpu-{}", id))
                .spawn(move || {
                    let _ = tid_tx.send(nix::sys::pthread::pthread_self());
                    run_vcpu(id as u32, vcpu, io, running_flag, exit_tx);
                });
            match spawned {
                Ok(handle) => {
                    if let Ok(tid) = tid_rx.recv() {
                        threads.push(tid);
                    }
                    handles.push(handle);
                }
                Err(e) => {
                    running.store(false, Ordering::Release);
                    kick(&threads);
                    input_task.abort();
                    return Err(Error::Resource(format!(
                        "failed to spawn vCPU thread: {}",
                        e
                    )));
                }
            }
        }

        tracing::info!("KVM guest booting with {} vCPU(s)", handles.len());
        Ok(RunningMachine {
            control: Arc::new(VcpuControl {
                running,
                killed: AtomicBool::new(false),
                threads,
                disk,
                exited: watch::channel(false).0,
            }),
            handles,
            exit_rx,
            irqs,
            input_task,
            _vm: self.vm,
            _memory: self.memory,
        })
    }
}

/// Host-side control of a booted machine, shared with the driver.
pub struct VcpuControl {
    running: Arc<AtomicBool>,
    killed: AtomicBool,
    threads: Vec<Pthread>,
    disk: Option<Arc<Mutex<VirtioBlk>>>,
    exited: watch::Sender<bool>,
}

impl VcpuControl {
    /// Asks every vCPU loop to finish.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.kick();
    }

    /// Stops the vCPUs and releases the disk without waiting for the guest.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.request_stop();
        self.detach_disk();
    }

    /// Resolves once every vCPU thread has been joined, re-kicking threads
    /// that were between loop iterations when the first signal landed.
    pub async fn wait_exited(&self, limit: Duration) -> Result<()> {
        let mut exited = self.exited.subscribe();
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match tokio::time::timeout(KICK_INTERVAL, exited.wait_for(|done| *done)).await {
                Ok(_) => return Ok(()),
                Err(_) if tokio::time::Instant::now() >= deadline => {
                    return Err(Error::Resource(
                        "vCPU threads did not exit in time".to_string(),
                    ));
                }
                Err(_) => self.kick(),
            }
        }
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    fn kick(&self) {
        if self.has_exited() {
            return;
        }
        kick(&self.threads);
    }

    fn detach_disk(&self) {
        if let Some(disk) = &self.disk {
            if let Ok(mut disk) = disk.lock() {
                disk.detach();
            }
        }
    }
}

fn kick(threads: &[Pthread]) {
    for &tid in threads {
        if let Err(e) = pthread_kill(tid, Signal::SIGUSR1) {
            tracing::debug!("Failed to signal vCPU thread: {}", e);
        }
    }
}

/// A booted machine. Consumed by [`RunningMachine::wait`].
pub struct RunningMachine {
    control: Arc<VcpuControl>,
    handles: Vec<JoinHandle<()>>,
    exit_rx: Receiver<VcpuExitReason>,
    irqs: Vec<IrqForwarder>,
    input_task: tokio::task::JoinHandle<()>,
    _vm: Arc<VmFd>,
    _memory: Arc<GuestMemoryMmap>,
}

impl RunningMachine {
    pub fn control(&self) -> Arc<VcpuControl> {
        self.control.clone()
    }

    /// Waits for the first vCPU to finish, winds the rest down and tears
    /// the devices down.
    pub async fn wait(self) -> ExitStatus {
        let RunningMachine {
            control,
            handles,
            exit_rx,
            irqs,
            input_task,
            _vm,
            _memory,
        } = self;

        let joiner = control.clone();
        let reason = tokio::task::spawn_blocking(move || {
            let reason = exit_rx.recv().ok();
            joiner.request_stop();
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!("vCPU thread panicked");
                }
            }
            drop(irqs);
            reason
        })
        .await
        .ok()
        .flatten();

        input_task.abort();
        control.detach_disk();
        control.exited.send_replace(true);

        let killed = control.killed.load(Ordering::Acquire);
        let status = exit_status(reason, killed);
        tracing::info!("KVM guest exited: {:?}", status);
        status
    }
}

fn exit_status(reason: Option<VcpuExitReason>, killed: bool) -> ExitStatus {
    match reason {
        Some(VcpuExitReason::Shutdown) => ExitStatus::Clean,
        Some(VcpuExitReason::Interrupted) if !killed => ExitStatus::Clean,
        Some(VcpuExitReason::Interrupted) => ExitStatus::Failed("killed".to_string()),
        Some(VcpuExitReason::Fault) => ExitStatus::Failed("vCPU fault".to_string()),
        None => ExitStatus::Failed("vCPU threads ended without reporting".to_string()),
    }
}

fn register_memory(vm: &VmFd, memory: &GuestMemoryMmap) -> Result<()> {
    for (slot, region) in memory.iter().enumerate() {
        let region = kvm_userspace_memory_region {
            slot: slot as u32,
            guest_phys_addr: region.start_addr().raw_value(),
            memory_size: region.len(),
            userspace_addr: region.as_ptr() as u64,
            flags: 0,
        };
        // SAFETY: the mapping lives in `memory`, which outlives the VM.
        unsafe { vm.set_user_memory_region(region) }.map_err(resource("map guest memory"))?;
    }
    Ok(())
}

fn load_kernel(memory: &GuestMemoryMmap, path: &Path) -> Result<(u64, Option<setup_header>)> {
    let mut file = File::open(path)
        .map_err(|e| Error::Resource(format!("failed to open kernel {}: {}", path.display(), e)))?;
    let loaded = BzImage::load(memory, Some(GuestAddress(KERNEL_LOAD_ADDR)), &mut file, None)
        .map_err(|e| Error::Resource(format!("failed to load kernel: {:?}", e)))?;
    Ok((
        loaded.kernel_load.raw_value() + ENTRY_64_OFFSET,
        loaded.setup_header,
    ))
}

fn load_initrd(memory: &GuestMemoryMmap, path: &Path) -> Result<InitrdRegion> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Resource(format!("failed to read initrd {}: {}", path.display(), e)))?;
    memory
        .write_slice(&data, GuestAddress(INITRD_LOAD_ADDR))
        .map_err(|e| Error::Resource(format!("initrd does not fit in guest memory: {}", e)))?;
    Ok(InitrdRegion {
        addr: INITRD_LOAD_ADDR,
        size: data.len() as u64,
    })
}

fn register_pio<D: vm_device::MutDevicePio + Send + 'static>(
    io: &mut IoManager,
    base: u16,
    len: u16,
    device: Arc<Mutex<D>>,
) -> Result<()> {
    let range = PioRange::new(PioAddress(base), len)
        .map_err(|e| Error::Resource(format!("invalid PIO range 0x{:x}: {:?}", base, e)))?;
    io.register_pio(range, device)
        .map_err(|e| Error::Resource(format!("failed to register PIO 0x{:x}: {:?}", base, e)))
}

fn attach_disk(
    io: &mut IoManager,
    path: &Path,
    memory: Arc<GuestMemoryMmap>,
) -> Result<DiskDevice> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::Resource(format!("failed to open disk {}: {}", path.display(), e)))?;
    let blk = VirtioBlk::new(file, memory).map_err(resource("create virtio-blk device"))?;
    tracing::debug!(
        "Attached {} as virtio-blk ({} sectors)",
        path.display(),
        blk.capacity()
    );
    let interrupt = blk
        .interrupt_evt()
        .map_err(resource("clone virtio-blk eventfd"))?;
    let device = Arc::new(Mutex::new(blk));

    let range = MmioRange::new(MmioAddress(VIRTIO_MMIO_BASE), VIRTIO_MMIO_SIZE)
        .map_err(|e| Error::Resource(format!("invalid MMIO range: {:?}", e)))?;
    io.register_mmio(range, device.clone())
        .map_err(|e| Error::Resource(format!("failed to register virtio-blk: {:?}", e)))?;
    Ok(DiskDevice { device, interrupt })
}

/// Pumps host console input into the UART until the pipe closes.
fn spawn_console_input(
    input: OwnedFd,
    serial: Arc<Mutex<SerialDevice>>,
) -> Result<tokio::task::JoinHandle<()>> {
    let input = AsyncFd::with_interest(input, Interest::READABLE)?;
    Ok(tokio::spawn(async move {
        let mut buf = [0u8; 256];
        loop {
            let mut guard = match input.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    tracing::debug!("console input: poll failed: {}", e);
                    break;
                }
            };
            let read = guard.try_io(|fd| {
                nix::unistd::read(fd.get_ref().as_raw_fd(), &mut buf).map_err(Into::into)
            });
            match read {
                Ok(Ok(0)) => {
                    tracing::debug!("console input: closed");
                    break;
                }
                Ok(Ok(n)) => {
                    if let Ok(mut serial) = serial.lock() {
                        serial.enqueue_input(&buf[..n]);
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!("console input: read failed: {}", e);
                    break;
                }
                Err(_would_block) => continue,
            }
        }
    }))
}
