//! Builds and drives the `VZVirtualMachine` behind a driver.
//!
//! SAFETY: `VZVirtualMachine` is not thread-safe. The object is created on
//! the main queue, held here only as an address, and every call goes back
//! through `main_queue`.

use crate::delegate::{StopSender, VmStateDelegate};
use crate::device::{MacChoice, SharePlan, network_plan, path_str, share_plans};
use crate::main_queue::{on_main, on_main_sync};
use block2::RcBlock;
use burrow_core::{Error, GuestConsole, Result, VmConfig};
use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2::{AnyThread, MainThreadMarker};
use objc2_foundation::{NSArray, NSError, NSFileHandle, NSString, NSURL};
use objc2_virtualization::{
    VZDirectorySharingDeviceConfiguration, VZDiskImageStorageDeviceAttachment,
    VZEntropyDeviceConfiguration, VZFileHandleSerialPortAttachment,
    VZGenericPlatformConfiguration, VZLinuxBootLoader, VZMACAddress,
    VZNATNetworkDeviceAttachment, VZNetworkDeviceConfiguration, VZSerialPortConfiguration,
    VZSharedDirectory, VZSingleDirectoryShare, VZStorageDeviceConfiguration,
    VZVirtioBlockDeviceConfiguration, VZVirtioConsoleDeviceSerialPortConfiguration,
    VZVirtioEntropyDeviceConfiguration, VZVirtioFileSystemDeviceConfiguration,
    VZVirtioNetworkDeviceConfiguration, VZVirtualMachine, VZVirtualMachineConfiguration,
};
use std::os::fd::IntoRawFd;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

const START_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

fn file_url(path: &str) -> Retained<NSURL> {
    NSURL::fileURLWithPath(&NSString::from_str(path))
}

fn describe(error: &NSError) -> String {
    error.localizedDescription().to_string()
}

/// Sends the completion handler's outcome to `tx` once.
fn completion(tx: oneshot::Sender<std::result::Result<(), String>>) -> RcBlock<dyn Fn(*mut NSError)> {
    let tx = Mutex::new(Some(tx));
    RcBlock::new(move |error: *mut NSError| {
        if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let result = if error.is_null() {
                Ok(())
            } else {
                // SAFETY: the framework passes a valid NSError when non-null.
                Err(describe(unsafe { &*error }))
            };
            let _ = tx.send(result);
        }
    })
}

/// A configured VM and its delegate. Dropping it tears both down on the main
/// queue.
pub struct VirtualMachine {
    vm: usize,
    delegate: usize,
}

impl VirtualMachine {
    /// Configures and validates the VM. The guest console descriptors are
    /// handed to the framework, which closes them when the VM goes away.
    pub async fn create(
        config: VmConfig,
        guest: GuestConsole,
        stop_sender: StopSender,
    ) -> Result<Self> {
        let (vm, delegate) = on_main(move || build(&config, guest, stop_sender)).await??;
        Ok(Self { vm, delegate })
    }

    pub async fn start(&self) -> Result<()> {
        let addr = self.vm;
        let (tx, rx) = oneshot::channel();
        on_main(move || {
            let handler = completion(tx);
            // SAFETY: `addr` is a live VZVirtualMachine owned by `self`; we are
            // on the main queue.
            unsafe { (*(addr as *const VZVirtualMachine)).startWithCompletionHandler(&handler) };
        })
        .await?;

        match tokio::time::timeout(START_TIMEOUT, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(Error::Resource(format!("VM start failed: {}", e))),
            Ok(Err(_)) => Err(Error::Resource("VM start channel closed".to_string())),
            Err(_) => Err(Error::Resource("VM start timed out".to_string())),
        }
    }

    /// Asks the guest to power off. Returns `false` without doing anything
    /// when the framework reports it cannot honor the request.
    pub async fn request_stop(&self) -> Result<bool> {
        let addr = self.vm;
        on_main(move || {
            // SAFETY: see `start`.
            let vm = unsafe { &*(addr as *const VZVirtualMachine) };
            if !unsafe { vm.canRequestStop() } {
                return Ok(false);
            }
            unsafe { vm.requestStopWithError() }
                .map(|_| true)
                .map_err(|e| Error::Resource(format!("request stop failed: {}", describe(&e))))
        })
        .await?
    }

    /// Hard stop. The delegate is not told about it.
    pub async fn stop(&self) -> Result<()> {
        let addr = self.vm;
        let (tx, rx) = oneshot::channel();
        on_main(move || {
            let handler = completion(tx);
            // SAFETY: see `start`.
            unsafe { (*(addr as *const VZVirtualMachine)).stopWithCompletionHandler(&handler) };
        })
        .await?;

        match tokio::time::timeout(STOP_TIMEOUT, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(Error::Resource(format!("VM stop failed: {}", e))),
            Ok(Err(_)) => Err(Error::Resource("VM stop channel closed".to_string())),
            Err(_) => Err(Error::Resource("VM stop timed out".to_string())),
        }
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        let (vm, delegate) = (self.vm, self.delegate);
        // SAFETY: both pointers came from `Retained::into_raw` in `build` and
        // are released exactly once here. The delegate is detached first so
        // the framework never calls into a freed object.
        on_main_sync(move || unsafe {
            if let Some(vm) = Retained::from_raw(vm as *mut VZVirtualMachine) {
                vm.setDelegate(None);
            }
            let _ = Retained::from_raw(delegate as *mut VmStateDelegate);
        });
    }
}

fn build(config: &VmConfig, guest: GuestConsole, stop_sender: StopSender) -> Result<(usize, usize)> {
    let mtm = MainThreadMarker::new()
        .ok_or_else(|| Error::Resource("VM must be configured on the main thread".to_string()))?;
    let kernel = path_str(&config.kernel, "kernel")?;
    let initrd = config
        .initrd
        .as_deref()
        .map(|p| path_str(p, "initrd"))
        .transpose()?;
    let disk = config
        .disk
        .as_deref()
        .map(|p| path_str(p, "disk"))
        .transpose()?;
    let shares = share_plans(&config.shared_dirs)?;
    let network = network_plan(&config.network)?;

    // SAFETY: plain objc2 calls on freshly created framework objects, made
    // on the main thread. The console descriptors are converted to raw fds
    // whose ownership moves to NSFileHandle (closeOnDealloc).
    unsafe {
        let vm_config = VZVirtualMachineConfiguration::new();

        let boot_loader = VZLinuxBootLoader::initWithKernelURL(VZLinuxBootLoader::alloc(), &file_url(kernel));
        if let Some(initrd) = initrd {
            boot_loader.setInitialRamdiskURL(Some(&file_url(initrd)));
        }
        boot_loader.setCommandLine(&NSString::from_str(&config.cmdline));
        vm_config.setBootLoader(Some(&boot_loader));
        vm_config.setPlatform(&VZGenericPlatformConfiguration::new());
        vm_config.setCPUCount(config.cpus as usize);
        vm_config.setMemorySize(config.memory_mb * 1024 * 1024);

        let read_handle = NSFileHandle::initWithFileDescriptor_closeOnDealloc(
            NSFileHandle::alloc(),
            guest.input.into_raw_fd(),
            true,
        );
        let write_handle = NSFileHandle::initWithFileDescriptor_closeOnDealloc(
            NSFileHandle::alloc(),
            guest.output.into_raw_fd(),
            true,
        );
        let serial_attachment =
            VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
                VZFileHandleSerialPortAttachment::alloc(),
                Some(&read_handle),
                Some(&write_handle),
            );
        let serial = VZVirtioConsoleDeviceSerialPortConfiguration::new();
        serial.setAttachment(Some(&serial_attachment));
        let serials: Retained<NSArray<VZSerialPortConfiguration>> =
            NSArray::from_retained_slice(&[Retained::into_super(serial)]);
        vm_config.setSerialPorts(&serials);

        let entropy: Retained<NSArray<VZEntropyDeviceConfiguration>> =
            NSArray::from_retained_slice(&[Retained::into_super(
                VZVirtioEntropyDeviceConfiguration::new(),
            )]);
        vm_config.setEntropyDevices(&entropy);

        if let Some(disk) = disk {
            let attachment = VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
                VZDiskImageStorageDeviceAttachment::alloc(),
                &file_url(disk),
                false,
            )
            .map_err(|e| Error::Resource(format!("disk {}: {}", disk, describe(&e))))?;
            let block = VZVirtioBlockDeviceConfiguration::initWithAttachment(
                VZVirtioBlockDeviceConfiguration::alloc(),
                &attachment,
            );
            let storage: Retained<NSArray<VZStorageDeviceConfiguration>> =
                NSArray::from_retained_slice(&[Retained::into_super(block)]);
            vm_config.setStorageDevices(&storage);
        }

        if !shares.is_empty() {
            let devices: Vec<Retained<VZDirectorySharingDeviceConfiguration>> =
                shares.iter().map(|share| share_device(share)).collect();
            vm_config.setDirectorySharingDevices(&NSArray::from_retained_slice(&devices));
        }

        if let Some(mac) = network {
            let net = VZVirtioNetworkDeviceConfiguration::new();
            net.setAttachment(Some(&VZNATNetworkDeviceAttachment::new()));
            net.setMACAddress(&mac_address(&mac));
            let nets: Retained<NSArray<VZNetworkDeviceConfiguration>> =
                NSArray::from_retained_slice(&[Retained::into_super(net)]);
            vm_config.setNetworkDevices(&nets);
        }

        vm_config
            .validateWithError()
            .map_err(|e| Error::Resource(format!("VM configuration rejected: {}", describe(&e))))?;

        let vm = VZVirtualMachine::initWithConfiguration(VZVirtualMachine::alloc(), &vm_config);
        let delegate = VmStateDelegate::new(mtm, stop_sender);
        vm.setDelegate(Some(ProtocolObject::from_ref(&*delegate)));

        tracing::debug!(
            "VZ VM configured: {} vCPU(s), {} MiB, {} share(s)",
            config.cpus,
            config.memory_mb,
            shares.len()
        );
        Ok((
            Retained::into_raw(vm) as usize,
            Retained::into_raw(delegate) as usize,
        ))
    }
}

unsafe fn share_device(share: &SharePlan) -> Retained<VZDirectorySharingDeviceConfiguration> {
    unsafe {
        let directory = VZSharedDirectory::initWithURL_readOnly(
            VZSharedDirectory::alloc(),
            &file_url(&share.host_path),
            share.read_only,
        );
        let single = VZSingleDirectoryShare::initWithDirectory(
            VZSingleDirectoryShare::alloc(),
            &directory,
        );
        let device = VZVirtioFileSystemDeviceConfiguration::initWithTag(
            VZVirtioFileSystemDeviceConfiguration::alloc(),
            &NSString::from_str(&share.tag),
        );
        device.setShare(Some(&single));
        Retained::into_super(device)
    }
}

unsafe fn mac_address(choice: &MacChoice) -> Retained<VZMACAddress> {
    unsafe {
        match choice {
            MacChoice::Static(mac) => {
                VZMACAddress::initWithString(VZMACAddress::alloc(), &NSString::from_str(mac))
                    .unwrap_or_else(|| VZMACAddress::randomLocallyAdministeredAddress())
            }
            MacChoice::RandomLocal => VZMACAddress::randomLocallyAdministeredAddress(),
        }
    }
}

/// Whether this Mac can run virtual machines at all.
pub fn is_supported() -> bool {
    // SAFETY: class method without preconditions.
    unsafe { VZVirtualMachine::isSupported() }
}
