//! VM lifecycle manager.
//!
//! A [`Manager`] turns a [`ManagerConfig`] into a running console session:
//!
//! ```text
//! New ──prepare──▶ Ready ──start──▶ Running ──stop──▶ Stopping ──exit──▶ Stopped
//!  ▲                                   │                                    │
//!  └───────────────────────────────────┴──────── prepare ◀──────────────────┘
//! ```
//!
//! `prepare` takes the warm path when the assets and the root disk are
//! already in place, and only calls the driver's `create`. Otherwise it
//! provisions everything (cold path), validates, and creates.
//!
//! After `start`, a background monitor owns the VM's exit: it records the
//! shutdown in the persistent state and moves the manager to `Stopped` or
//! `Error`.

mod config;
mod persistent;
mod prepare;
mod state;

pub use config::{
    DEFAULT_CPUS, DEFAULT_DISK_NAME, DEFAULT_DISK_SIZE_MB, DEFAULT_MEMORY_MB, ManagerConfig,
    SSH_GUEST_PORT,
};
pub use persistent::{PersistentState, StateFile};
pub use state::ManagerState;

use crate::assets::AssetProvider;
use crate::images::DiskProvider;
use crate::layout::VmLayout;
use burrow_core::{
    Capabilities, Console, Driver, DriverInfo, Error, ExitSignal, ExitStatus, Result, VmConfig,
};
use prepare::{DiskPlan, build_vm_config};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

#[derive(Debug, Default)]
struct Inner {
    state: ManagerState,
    last_error: Option<Error>,
    vm_config: Option<VmConfig>,
    exit: Option<watch::Receiver<Option<ExitStatus>>>,
}

impl Inner {
    /// Moves to `Error`, retains `err`, and hands it back for returning.
    fn fail(&mut self, err: Error) -> Error {
        self.state = ManagerState::Error;
        self.last_error = Some(err.clone());
        err
    }
}

pub struct Manager {
    config: ManagerConfig,
    layout: VmLayout,
    driver: Arc<dyn Driver>,
    assets: Arc<dyn AssetProvider>,
    disks: Arc<dyn DiskProvider>,
    state_file: StateFile,
    warnings: Vec<String>,
    inner: Arc<Mutex<Inner>>,
}

impl Manager {
    /// Builds a manager for the VM at `layout`.
    ///
    /// Features the driver cannot provide are dropped here, once, with a
    /// warning each (see [`Manager::warnings`]).
    pub fn new(
        config: ManagerConfig,
        layout: VmLayout,
        driver: Arc<dyn Driver>,
        assets: Arc<dyn AssetProvider>,
        disks: Arc<dyn DiskProvider>,
    ) -> Self {
        let mut config = config;
        let info = driver.info();
        let warnings = config.degrade(&info.name, &driver.capabilities());
        for warning in &warnings {
            tracing::warn!("{}", warning);
        }

        let state_file = StateFile::new(layout.state_file());
        match state_file.load() {
            Ok(state) => tracing::debug!(
                "Loaded state for {}: {} previous boot(s), last shutdown clean: {}",
                layout.name(),
                state.boot_count,
                state.clean_shutdown
            ),
            Err(e) => tracing::warn!("Failed to read {}: {}", state_file.path().display(), e),
        }

        Self {
            config,
            layout,
            driver,
            assets,
            disks,
            state_file,
            warnings,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn layout(&self) -> &VmLayout {
        &self.layout
    }

    /// Capability mismatches found at construction.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn driver_info(&self) -> DriverInfo {
        self.driver.info()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.driver.capabilities()
    }

    pub async fn state(&self) -> ManagerState {
        self.inner.lock().await.state
    }

    pub async fn last_error(&self) -> Option<Error> {
        self.inner.lock().await.last_error.clone()
    }

    /// The configuration handed to the driver by the last successful prepare.
    pub async fn vm_config(&self) -> Option<VmConfig> {
        self.inner.lock().await.vm_config.clone()
    }

    pub fn persistent_state(&self) -> Result<PersistentState> {
        self.state_file.load()
    }

    /// Gets the VM ready to start, reusing prior provisioning when possible.
    pub async fn prepare(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .state
            .require("prepare", &[ManagerState::New, ManagerState::Stopped])?;

        let config = self.config.with_defaults();
        let result = match self.warm_disk(&config) {
            Some((paths, plan)) => self.warm_prepare(&config, &paths, &plan).await,
            None => self.cold_prepare(&config).await,
        };

        match result {
            Ok(vm_config) => {
                if let Err(e) = self
                    .state_file
                    .update(|state| state.disk_size_mb = config.disk_size_mb)
                {
                    tracing::warn!("Failed to record disk size: {}", e);
                }
                inner.vm_config = Some(vm_config);
                // The previous run's exit belongs to the previous cycle.
                inner.exit = None;
                inner.last_error = None;
                inner.state = ManagerState::Ready;
                Ok(())
            }
            Err(e) => Err(inner.fail(e)),
        }
    }

    /// Returns the cached asset paths and disk plan when the warm path applies.
    fn warm_disk(&self, config: &ManagerConfig) -> Option<(crate::AssetPaths, DiskPlan)> {
        if !self.assets.assets_exist() {
            return None;
        }
        let paths = match self.assets.asset_paths() {
            Ok(paths) => paths,
            Err(e) => {
                tracing::debug!("Cached asset paths unavailable, provisioning: {}", e);
                return None;
            }
        };
        let plan = DiskPlan::resolve(&self.assets.setup_requirements(), &paths);
        plan.is_present(self.disks.as_ref(), &config.disk_name)
            .then_some((paths, plan))
    }

    async fn warm_prepare(
        &self,
        config: &ManagerConfig,
        paths: &crate::AssetPaths,
        plan: &DiskPlan,
    ) -> Result<VmConfig> {
        tracing::debug!("Warm start for {}", self.layout.name());
        let disk = plan.existing_path(self.disks.as_ref(), &config.disk_name);
        let vm_config = build_vm_config(config, &self.assets.boot_config(), paths, disk);
        self.driver.create(&vm_config).await?;
        Ok(vm_config)
    }

    async fn cold_prepare(&self, config: &ManagerConfig) -> Result<VmConfig> {
        tracing::info!("Provisioning {}", self.layout.name());
        let paths = self.assets.ensure_assets().await?;
        let plan = DiskPlan::resolve(&self.assets.setup_requirements(), &paths);
        let disk = plan.provision(self.disks.as_ref(), &config.disk_name, config.disk_size_mb)?;

        let vm_config = build_vm_config(config, &self.assets.boot_config(), &paths, disk);
        self.driver.validate(&vm_config)?;
        self.driver.create(&vm_config).await?;
        Ok(vm_config)
    }

    /// Boots the prepared VM and starts watching for its exit.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.state.require("start", &[ManagerState::Ready])?;

        let signal = match self.driver.start().await {
            Ok(signal) => signal,
            Err(e) => return Err(inner.fail(e)),
        };
        inner.state = ManagerState::Running;

        let (exit_tx, exit_rx) = watch::channel(None);
        inner.exit = Some(exit_rx);

        if let Err(e) = self.state_file.record_boot() {
            tracing::warn!("Failed to record boot: {}", e);
        }

        tokio::spawn(monitor(
            signal,
            self.inner.clone(),
            self.state_file.clone(),
            exit_tx,
        ));
        tracing::info!("Started {}", self.layout.name());
        Ok(())
    }

    /// Asks the guest to shut down. The monitor marks the VM stopped once it
    /// actually exits.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.state.require("stop", &[ManagerState::Running])?;
            inner.state = ManagerState::Stopping;
        }

        if let Err(e) = self.driver.stop().await {
            let mut inner = self.inner.lock().await;
            // The guest may have exited on its own while the lock was free.
            if inner.state != ManagerState::Stopping {
                tracing::debug!("Stop raced with VM exit: {}", e);
                return Ok(());
            }
            return Err(inner.fail(e));
        }
        Ok(())
    }

    pub async fn kill(&self) -> Result<()> {
        self.inner
            .lock()
            .await
            .state
            .require("kill", &[ManagerState::Running, ManagerState::Stopping])?;

        if let Err(e) = self.driver.kill().await {
            return Err(self.inner.lock().await.fail(e));
        }
        Ok(())
    }

    pub async fn console(&self) -> Result<Console> {
        self.inner
            .lock()
            .await
            .state
            .require("open console", &[ManagerState::Running])?;
        self.driver.console()
    }

    pub fn close_console(&self) {
        self.driver.close_console();
    }

    /// Waits for the VM started by [`Manager::start`] to exit.
    pub async fn wait(&self) -> Result<()> {
        let exit = {
            let inner = self.inner.lock().await;
            inner.exit.clone().ok_or_else(|| {
                Error::invalid_state("wait", format!("{} (VM not started)", inner.state))
            })?
        };
        let mut exit = exit;
        let status = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Exited("exit monitor went away".to_string()))?
            .clone();
        match status {
            Some(status) => status.into_result(),
            None => Err(Error::Exited("exit monitor went away".to_string())),
        }
    }
}

/// Sole consumer of the driver's exit signal and sole writer of post-boot
/// manager state.
async fn monitor(
    signal: ExitSignal,
    inner: Arc<Mutex<Inner>>,
    state_file: StateFile,
    exit_tx: watch::Sender<Option<ExitStatus>>,
) {
    let status = signal.wait().await;

    if let Err(e) = state_file.record_shutdown(status.is_clean()) {
        tracing::warn!("Failed to record shutdown: {}", e);
    }

    {
        let mut inner = inner.lock().await;
        match &status {
            ExitStatus::Clean => {
                tracing::info!("VM exited cleanly");
                inner.state = ManagerState::Stopped;
            }
            ExitStatus::Failed(reason) => {
                tracing::warn!("VM exited with error: {}", reason);
                inner.fail(Error::Exited(reason.clone()));
            }
        }
    }

    exit_tx.send_replace(Some(status));
}
