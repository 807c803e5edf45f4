#![allow(dead_code)]

use async_trait::async_trait;
use burrow::{
    AssetPaths, AssetProvider, BootConfig, DiskProvider, ImageStore, SetupRequirements,
};
use burrow_core::{
    Capabilities, Console, Driver, DriverInfo, DriverState, Error, ExitNotifier, ExitSignal,
    ExitStatus, HostConsole, Result, VmConfig, console_pipes, exit_channel,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// In-process driver that tracks calls and lets tests decide when the VM
/// exits.
#[derive(Default)]
pub struct FakeDriver {
    pub capabilities: Capabilities,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    /// `stop` succeeds but the guest keeps running.
    pub defer_exit: AtomicBool,
    /// The guest powers off on its own just as `stop` arrives.
    pub exit_before_stop: AtomicBool,
    pub validate_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub kill_calls: AtomicUsize,
    state: Mutex<DriverState>,
    notifier: Mutex<Option<ExitNotifier>>,
    console: Mutex<Option<HostConsole>>,
    pub last_config: Mutex<Option<VmConfig>>,
}

impl FakeDriver {
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            ..Self::default()
        }
    }

    /// Simulates the guest exiting on its own.
    pub fn exit(&self, status: ExitStatus) {
        *self.state.lock().unwrap() = DriverState::Stopped;
        if let Some(notifier) = self.notifier.lock().unwrap().take() {
            notifier.notify(status);
        }
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo::new("fake")
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn state(&self) -> DriverState {
        *self.state.lock().unwrap()
    }

    fn validate(&self, config: &VmConfig) -> Result<()> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        config.validate()
    }

    async fn create(&self, config: &VmConfig) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.state().can_create()?;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Resource("create failed".to_string()));
        }
        let (host, _guest) = console_pipes()?;
        *self.console.lock().unwrap() = Some(host);
        *self.last_config.lock().unwrap() = Some(config.clone());
        *self.state.lock().unwrap() = DriverState::Created;
        Ok(())
    }

    async fn start(&self) -> Result<ExitSignal> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.state().can_start()?;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Resource("boot failed".to_string()));
        }
        let (notifier, signal) = exit_channel();
        *self.notifier.lock().unwrap() = Some(notifier);
        *self.state.lock().unwrap() = DriverState::Running;
        Ok(signal)
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.exit_before_stop.load(Ordering::SeqCst) {
            self.exit(ExitStatus::Clean);
            // Let the manager's monitor observe the exit first.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        self.state().can_stop()?;
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(Error::Resource("stop request rejected".to_string()));
        }
        if !self.defer_exit.load(Ordering::SeqCst) {
            self.exit(ExitStatus::Clean);
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.state().can_kill()?;
        self.exit(ExitStatus::Failed("killed".to_string()));
        Ok(())
    }

    fn console(&self) -> Result<Console> {
        self.console
            .lock()
            .unwrap()
            .as_ref()
            .map(HostConsole::handles)
            .ok_or_else(|| Error::Resource("console not initialized".to_string()))
    }

    fn close_console(&self) {
        if let Some(console) = self.console.lock().unwrap().as_ref() {
            console.close();
        }
    }
}

/// Asset provider over files in a directory, counting downloads.
pub struct FakeAssets {
    pub dir: PathBuf,
    pub requirements: SetupRequirements,
    pub with_rootfs: bool,
    pub ensure_calls: AtomicUsize,
}

impl FakeAssets {
    pub fn new(dir: &Path, requirements: SetupRequirements, with_rootfs: bool) -> Self {
        Self {
            dir: dir.to_path_buf(),
            requirements,
            with_rootfs,
            ensure_calls: AtomicUsize::new(0),
        }
    }

    pub fn paths(&self) -> AssetPaths {
        AssetPaths {
            kernel: self.dir.join("vmlinuz"),
            initramfs: self.dir.join("initramfs"),
            rootfs: if self.with_rootfs {
                self.dir.join("rootfs.img")
            } else {
                PathBuf::new()
            },
        }
    }

    /// Writes the asset files, as a previous download would have.
    pub fn populate(&self) {
        let paths = self.paths();
        std::fs::create_dir_all(&self.dir).unwrap();
        std::fs::write(&paths.kernel, b"kernel").unwrap();
        std::fs::write(&paths.initramfs, b"initramfs").unwrap();
        if self.with_rootfs {
            std::fs::write(&paths.rootfs, b"rootfs").unwrap();
        }
    }
}

#[async_trait]
impl AssetProvider for FakeAssets {
    fn assets_exist(&self) -> bool {
        self.paths().kernel.exists()
    }

    fn asset_paths(&self) -> Result<AssetPaths> {
        Ok(self.paths())
    }

    async fn ensure_assets(&self) -> Result<AssetPaths> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        self.populate();
        Ok(self.paths())
    }

    fn boot_config(&self) -> BootConfig {
        BootConfig {
            cmdline: "quiet".to_string(),
            root_device: "/dev/vda".to_string(),
            root_fs_type: "ext4".to_string(),
            console_device: "ttyS0".to_string(),
        }
    }

    fn setup_requirements(&self) -> SetupRequirements {
        self.requirements.clone()
    }
}

/// [`ImageStore`] that counts disk creations.
pub struct CountingDisks {
    pub store: ImageStore,
    pub ensure_calls: AtomicUsize,
}

impl CountingDisks {
    pub fn new(dir: &Path) -> Self {
        Self {
            store: ImageStore::new(dir),
            ensure_calls: AtomicUsize::new(0),
        }
    }
}

impl DiskProvider for CountingDisks {
    fn ensure_disk(&self, name: &str, size_mb: u64) -> Result<PathBuf> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        self.store.ensure_disk(name, size_mb)
    }

    fn disk_exists(&self, name: &str) -> bool {
        self.store.disk_exists(name)
    }

    fn disk_path(&self, name: &str) -> PathBuf {
        self.store.disk_path(name)
    }
}

pub fn extraction() -> SetupRequirements {
    SetupRequirements {
        needs_formatting: true,
        fs_type: "ext4".to_string(),
        needs_extraction: true,
    }
}
