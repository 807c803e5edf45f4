use crate::machine::{Machine, RunningMachine, VcpuControl};
use async_trait::async_trait;
use burrow_core::{
    Capabilities, Console, Driver, DriverInfo, DriverState, Error, ExitSignal, HostConsole,
    Result, VmConfig, console_pipes, exit_channel,
};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const KVM_DEVICE: &str = "/dev/kvm";
// One APIC ID is reserved for the IOAPIC in the MP table.
const MAX_VCPUS: u32 = 254;
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Shared {
    state: DriverState,
    config: Option<VmConfig>,
    machine: Option<Machine>,
    control: Option<Arc<VcpuControl>>,
    console: Option<HostConsole>,
}

/// Runs Linux guests on `/dev/kvm` (x86_64 hosts).
///
/// `stop` is a cooperative request: every vCPU loop checks it on its next
/// exit and the guest is reported as cleanly stopped. `kill` additionally
/// drops the disk handle and waits until the vCPU threads are gone.
pub struct KvmDriver {
    shared: Arc<Mutex<Shared>>,
}

impl KvmDriver {
    /// Fails with `UnsupportedPlatform` when the host has no KVM device.
    pub fn new() -> Result<Self> {
        if !Self::is_available() {
            return Err(Error::UnsupportedPlatform(format!(
                "{} is not present",
                KVM_DEVICE
            )));
        }
        Ok(Self::unchecked())
    }

    pub fn is_available() -> bool {
        Path::new(KVM_DEVICE).exists()
    }

    fn unchecked() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds a fresh machine and console for `config`, replacing any
    /// previous ones.
    fn assemble(&self, config: &VmConfig) -> Result<()> {
        let (host, guest) = console_pipes()?;
        let machine = Machine::build(config, guest)?;
        let mut shared = self.lock();
        shared.machine = Some(machine);
        shared.console = Some(host);
        shared.config = Some(config.clone());
        Ok(())
    }
}

#[async_trait]
impl Driver for KvmDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo::new("kvm")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn state(&self) -> DriverState {
        self.lock().state
    }

    fn validate(&self, config: &VmConfig) -> Result<()> {
        config.validate()?;
        if config.cpus > MAX_VCPUS {
            return Err(Error::InvalidConfig(format!(
                "KVM supports at most {} vCPUs, got {}",
                MAX_VCPUS, config.cpus
            )));
        }
        match std::fs::metadata(&config.kernel) {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(Error::InvalidConfig(format!(
                "kernel {} is not a file",
                config.kernel.display()
            ))),
            Err(e) => Err(Error::InvalidConfig(format!(
                "kernel {}: {}",
                config.kernel.display(),
                e
            ))),
        }
    }

    async fn create(&self, config: &VmConfig) -> Result<()> {
        self.state().can_create()?;
        self.validate(config)?;
        self.assemble(config)?;
        self.lock().state = DriverState::Created;
        tracing::debug!(
            "KVM VM created: {} vCPU(s), {} MiB",
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
            self.assemble(&config)?;
        }

        let machine = self
            .lock()
            .machine
            .take()
            .ok_or_else(|| Error::Resource("machine not created".to_string()))?;
        let running: RunningMachine = match machine.boot() {
            Ok(running) => running,
            Err(e) => {
                // The half-booted machine is gone; a later start rebuilds it.
                self.lock().state = DriverState::Stopped;
                return Err(e);
            }
        };

        let (notifier, signal) = exit_channel();
        {
            let mut shared = self.lock();
            shared.state = DriverState::Running;
            shared.control = Some(running.control());
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let status = running.wait().await;
            {
                let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
                shared.state = DriverState::Stopped;
                shared.control = None;
            }
            notifier.notify(status);
        });
        Ok(signal)
    }

    async fn stop(&self) -> Result<()> {
        let control = {
            let shared = self.lock();
            shared.state.can_stop()?;
            shared.control.clone()
        };
        if let Some(control) = control {
            tracing::debug!("Requesting KVM guest stop");
            control.request_stop();
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        let control = {
            let shared = self.lock();
            shared.state.can_kill()?;
            shared.control.clone()
        };
        let Some(control) = control else {
            return Ok(());
        };
        tracing::debug!("Killing KVM guest");
        control.kill();
        control.wait_exited(KILL_TIMEOUT).await
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
