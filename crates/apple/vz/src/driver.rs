use crate::delegate::{StopReason, StopReceiver, StopSender};
use crate::machine::{VirtualMachine, is_supported};
use async_trait::async_trait;
use burrow_core::{
    Capabilities, Console, Driver, DriverInfo, DriverState, Error, ExitSignal, ExitStatus,
    HostConsole, Result, VmConfig, console_pipes, exit_channel,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Shared {
    state: DriverState,
    config: Option<VmConfig>,
    vm: Option<Arc<VirtualMachine>>,
    stop_sender: Option<StopSender>,
    stop_receiver: Option<StopReceiver>,
    console: Option<HostConsole>,
}

/// Runs Linux guests through Apple's Virtualization.framework.
///
/// Offers shared directories (virtio-fs) and NAT networking. Snapshots are
/// handled at the disk level by the snapshot engine, not here.
pub struct VzDriver {
    shared: Arc<Mutex<Shared>>,
}

impl VzDriver {
    /// Fails with `UnsupportedPlatform` when this Mac cannot virtualize.
    pub fn new() -> Result<Self> {
        if !is_supported() {
            return Err(Error::UnsupportedPlatform(
                "Virtualization.framework reports this host unsupported".to_string(),
            ));
        }
        Ok(Self::unchecked())
    }

    fn unchecked() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn assemble(&self, config: &VmConfig) -> Result<()> {
        let (host, guest) = console_pipes()?;
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel(1);
        let vm = VirtualMachine::create(config.clone(), guest, stop_sender.clone()).await?;

        let mut shared = self.lock();
        shared.vm = Some(Arc::new(vm));
        shared.stop_sender = Some(stop_sender);
        shared.stop_receiver = Some(stop_receiver);
        shared.console = Some(host);
        shared.config = Some(config.clone());
        Ok(())
    }

    fn running_vm(&self, allowed: fn(DriverState) -> Result<()>) -> Result<Arc<VirtualMachine>> {
        let shared = self.lock();
        allowed(shared.state)?;
        shared
            .vm
            .clone()
            .ok_or_else(|| Error::Resource("VM not created".to_string()))
    }
}

#[async_trait]
impl Driver for VzDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo::new("vz")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            shared_dirs: true,
            networking: true,
            snapshots: false,
        }
    }

    fn state(&self) -> DriverState {
        self.lock().state
    }

    async fn create(&self, config: &VmConfig) -> Result<()> {
        self.state().can_create()?;
        self.validate(config)?;
        self.assemble(config).await?;
        self.lock().state = DriverState::Created;
        tracing::debug!(
            "VZ VM created: {} vCPU(s), {} MiB",
            config.cpus,
            config.memory_mb
        );
        Ok(())
    }

    async fn start(&self) -> Result<ExitSignal> {
        let state = self.state();
        state.can_start()?;
        if state == DriverState::Stopped {
            let config = self
                .lock()
                .config
                .clone()
                .ok_or_else(|| Error::Resource("no configuration to restart".to_string()))?;
            self.assemble(&config).await?;
        }

        let (vm, receiver) = {
            let mut shared = self.lock();
            let vm = shared
                .vm
                .clone()
                .ok_or_else(|| Error::Resource("VM not created".to_string()))?;
            let receiver = shared
                .stop_receiver
                .take()
                .ok_or_else(|| Error::Resource("exit channel already consumed".to_string()))?;
            (vm, receiver)
        };

        if let Err(e) = vm.start().await {
            // The exit channel is gone; a later start rebuilds the VM.
            self.lock().state = DriverState::Stopped;
            return Err(e);
        }
        self.lock().state = DriverState::Running;
        tracing::debug!("VZ VM running");

        let (notifier, signal) = exit_channel();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let status = match tokio::task::spawn_blocking(move || receiver.recv()).await {
                Ok(Ok(reason)) => ExitStatus::from(reason),
                Ok(Err(_)) => ExitStatus::Failed("VM state channel disconnected".to_string()),
                Err(e) => ExitStatus::Failed(format!("exit watcher failed: {}", e)),
            };
            {
                let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
                shared.state = DriverState::Stopped;
                shared.stop_sender = None;
            }
            // Keeps the VM object alive until it has actually stopped.
            drop(vm);
            notifier.notify(status);
        });
        Ok(signal)
    }

    async fn stop(&self) -> Result<()> {
        let vm = self.running_vm(DriverState::can_stop)?;
        if !vm.request_stop().await? {
            tracing::debug!("VZ VM cannot honor a stop request right now");
            self.lock().state = DriverState::Stopped;
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        let vm = self.running_vm(DriverState::can_kill)?;
        tracing::debug!("Killing VZ VM");
        vm.stop().await?;
        if let Some(sender) = self.lock().stop_sender.take() {
            let _ = sender.try_send(StopReason::Killed);
        }
        Ok(())
    }

    fn console(&self) -> Result<Console> {
        self.lock()
            .console
            .as_ref()
            .map(HostConsole::handles)
            .ok_or_else(|| Error::Resource("console not initialized".to_string()))
    }

    fn close_console(&self) {
        if let Some(console) = self.lock().console.as_ref() {
            console.close();
        }
    }
}
