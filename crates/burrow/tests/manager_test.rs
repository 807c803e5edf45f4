mod common;

use burrow::{
    Capabilities, DiskProvider, Error, ExitStatus, Manager, ManagerConfig, ManagerState,
    SetupRequirements, SharedDir, VmLayout,
};
use common::{CountingDisks, FakeAssets, FakeDriver, extraction};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

struct Fixture {
    _home: TempDir,
    driver: Arc<FakeDriver>,
    assets: Arc<FakeAssets>,
    disks: Arc<CountingDisks>,
    manager: Manager,
}

fn fixture_with(
    config: ManagerConfig,
    driver: FakeDriver,
    requirements: SetupRequirements,
    with_rootfs: bool,
) -> Fixture {
    let home = tempfile::tempdir().unwrap();
    let layout = VmLayout::new(home.path(), "test-vm").unwrap();
    let driver = Arc::new(driver);
    let assets = Arc::new(FakeAssets::new(
        &home.path().join("cache"),
        requirements,
        with_rootfs,
    ));
    let disks = Arc::new(CountingDisks::new(layout.dir()));
    let manager = Manager::new(
        ManagerConfig {
            disk_size_mb: 1,
            ..config
        },
        layout,
        driver.clone(),
        assets.clone(),
        disks.clone(),
    );
    Fixture {
        _home: home,
        driver,
        assets,
        disks,
        manager,
    }
}

fn fixture() -> Fixture {
    fixture_with(
        ManagerConfig::default(),
        FakeDriver::default(),
        extraction(),
        false,
    )
}

async fn running() -> Fixture {
    let f = fixture();
    f.manager.prepare().await.unwrap();
    f.manager.start().await.unwrap();
    f
}

#[tokio::test]
async fn cold_prepare_provisions_validates_and_creates() {
    let f = fixture();
    assert_eq!(f.manager.state().await, ManagerState::New);

    f.manager.prepare().await.unwrap();

    assert_eq!(f.manager.state().await, ManagerState::Ready);
    assert_eq!(f.assets.ensure_calls.load(Ordering::SeqCst), 1);
    assert_eq!(f.disks.ensure_calls.load(Ordering::SeqCst), 1);
    assert_eq!(FakeDriver::calls(&f.driver.validate_calls), 1);
    assert_eq!(FakeDriver::calls(&f.driver.create_calls), 1);
    assert!(f.disks.store.disk_exists("disk"));

    let config = f.driver.last_config.lock().unwrap().clone().unwrap();
    assert_eq!(config.cpus, 1);
    assert_eq!(config.memory_mb, 512);
    assert_eq!(config.disk, Some(f.manager.layout().disk()));
    assert!(config.cmdline.contains("root=/dev/vda"));
}

#[tokio::test]
async fn warm_prepare_skips_provisioning_and_validation() {
    let f = fixture();
    f.assets.populate();
    f.disks.store.ensure_disk("disk", 1).unwrap();

    f.manager.prepare().await.unwrap();

    assert_eq!(f.manager.state().await, ManagerState::Ready);
    assert_eq!(f.assets.ensure_calls.load(Ordering::SeqCst), 0);
    assert_eq!(f.disks.ensure_calls.load(Ordering::SeqCst), 0);
    assert_eq!(FakeDriver::calls(&f.driver.validate_calls), 0);
    assert_eq!(FakeDriver::calls(&f.driver.create_calls), 1);
}

#[tokio::test]
async fn warm_prepare_boots_distro_image_directly() {
    let f = fixture_with(
        ManagerConfig::default(),
        FakeDriver::default(),
        SetupRequirements::default(),
        true,
    );
    f.assets.populate();

    f.manager.prepare().await.unwrap();

    assert_eq!(f.assets.ensure_calls.load(Ordering::SeqCst), 0);
    assert_eq!(f.disks.ensure_calls.load(Ordering::SeqCst), 0);
    let config = f.manager.vm_config().await.unwrap();
    assert_eq!(config.disk, Some(f.assets.paths().rootfs));
}

#[tokio::test]
async fn assets_without_disk_take_cold_path() {
    let f = fixture();
    f.assets.populate();

    f.manager.prepare().await.unwrap();

    assert_eq!(f.assets.ensure_calls.load(Ordering::SeqCst), 1);
    assert_eq!(f.disks.ensure_calls.load(Ordering::SeqCst), 1);
    assert_eq!(FakeDriver::calls(&f.driver.validate_calls), 1);
}

#[tokio::test]
async fn invalid_config_fails_prepare_before_create() {
    let f = fixture_with(
        ManagerConfig {
            memory_mb: 64,
            ..ManagerConfig::default()
        },
        FakeDriver::default(),
        extraction(),
        false,
    );

    let err = f.manager.prepare().await.unwrap_err();

    assert!(matches!(err, Error::InvalidConfig(_)));
    assert_eq!(f.manager.state().await, ManagerState::Error);
    assert!(matches!(
        f.manager.last_error().await,
        Some(Error::InvalidConfig(_))
    ));
    assert_eq!(FakeDriver::calls(&f.driver.create_calls), 0);
}

#[tokio::test]
async fn create_failure_is_retained() {
    let driver = FakeDriver::default();
    driver.fail_create.store(true, Ordering::SeqCst);
    let f = fixture_with(ManagerConfig::default(), driver, extraction(), false);

    assert!(f.manager.prepare().await.is_err());
    assert_eq!(f.manager.state().await, ManagerState::Error);
    assert!(matches!(
        f.manager.last_error().await,
        Some(Error::Resource(_))
    ));
}

#[tokio::test]
async fn start_requires_ready() {
    let f = fixture();

    let err = f.manager.start().await.unwrap_err();

    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(f.manager.state().await, ManagerState::New);
    assert_eq!(FakeDriver::calls(&f.driver.start_calls), 0);
    assert!(f.manager.last_error().await.is_none());
}

#[tokio::test]
async fn stop_and_kill_require_running() {
    let f = fixture();
    f.manager.prepare().await.unwrap();

    assert!(matches!(
        f.manager.stop().await,
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        f.manager.kill().await,
        Err(Error::InvalidState { .. })
    ));
    assert_eq!(f.manager.state().await, ManagerState::Ready);
    assert_eq!(FakeDriver::calls(&f.driver.stop_calls), 0);
    assert_eq!(FakeDriver::calls(&f.driver.kill_calls), 0);
}

#[tokio::test]
async fn prepare_rejected_while_running() {
    let f = running().await;
    assert!(matches!(
        f.manager.prepare().await,
        Err(Error::InvalidState { .. })
    ));
    assert_eq!(f.manager.state().await, ManagerState::Running);
}

#[tokio::test]
async fn start_records_boot() {
    let f = running().await;

    assert_eq!(f.manager.state().await, ManagerState::Running);
    let state = f.manager.persistent_state().unwrap();
    assert_eq!(state.boot_count, 1);
    assert!(!state.clean_shutdown);
    assert!(state.last_boot.is_some());
    assert_eq!(state.disk_size_mb, 1);
}

#[tokio::test]
async fn stop_then_wait_reaches_stopped() {
    let f = running().await;

    f.manager.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), f.manager.wait())
        .await
        .expect("wait timed out")
        .unwrap();

    assert_eq!(f.manager.state().await, ManagerState::Stopped);
    let state = f.manager.persistent_state().unwrap();
    assert!(state.clean_shutdown);
    assert!(state.last_shutdown.is_some());
}

#[tokio::test]
async fn ignored_stop_leaves_stopping_and_kill_still_works() {
    let f = running().await;
    f.driver.defer_exit.store(true, Ordering::SeqCst);

    f.manager.stop().await.unwrap();
    assert_eq!(f.manager.state().await, ManagerState::Stopping);

    f.manager.kill().await.unwrap();
    assert!(matches!(f.manager.wait().await, Err(Error::Exited(_))));
    assert_eq!(f.manager.state().await, ManagerState::Error);
}

#[tokio::test]
async fn stop_failure_moves_to_error() {
    let f = running().await;
    f.driver.fail_stop.store(true, Ordering::SeqCst);

    assert!(f.manager.stop().await.is_err());
    assert_eq!(f.manager.state().await, ManagerState::Error);
    assert!(f.manager.last_error().await.is_some());
}

#[tokio::test]
async fn kill_reports_unclean_exit() {
    let f = running().await;

    f.manager.kill().await.unwrap();
    let err = f.manager.wait().await.unwrap_err();

    assert!(matches!(err, Error::Exited(_)));
    assert_eq!(f.manager.state().await, ManagerState::Error);
    assert!(!f.manager.persistent_state().unwrap().clean_shutdown);
}

#[tokio::test]
async fn guest_exit_is_observed_by_monitor() {
    let f = running().await;

    f.driver.exit(ExitStatus::Clean);
    f.manager.wait().await.unwrap();

    assert_eq!(f.manager.state().await, ManagerState::Stopped);
}

#[tokio::test]
async fn wait_without_start_fails_fast() {
    let f = fixture();
    f.manager.prepare().await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(1), f.manager.wait())
        .await
        .expect("wait should not block")
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

#[tokio::test]
async fn wait_after_reprepare_fails_fast() {
    let f = running().await;
    f.manager.stop().await.unwrap();
    f.manager.wait().await.unwrap();

    f.manager.prepare().await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(1), f.manager.wait())
        .await
        .expect("wait should not block")
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

#[tokio::test]
async fn stop_racing_guest_exit_stays_stopped() {
    let f = running().await;
    f.driver.exit_before_stop.store(true, Ordering::SeqCst);

    f.manager.stop().await.unwrap();
    f.manager.wait().await.unwrap();

    assert_eq!(f.manager.state().await, ManagerState::Stopped);
    assert!(f.manager.last_error().await.is_none());
}

#[tokio::test]
async fn driver_start_failure_moves_to_error() {
    let driver = FakeDriver::default();
    driver.fail_start.store(true, Ordering::SeqCst);
    let f = fixture_with(ManagerConfig::default(), driver, extraction(), false);
    f.manager.prepare().await.unwrap();

    assert!(f.manager.start().await.is_err());
    assert_eq!(f.manager.state().await, ManagerState::Error);
    assert_eq!(f.manager.persistent_state().unwrap().boot_count, 0);
}

#[tokio::test]
async fn restart_after_stop_takes_warm_path() {
    let f = running().await;
    f.manager.stop().await.unwrap();
    f.manager.wait().await.unwrap();

    f.manager.prepare().await.unwrap();
    f.manager.start().await.unwrap();

    assert_eq!(f.assets.ensure_calls.load(Ordering::SeqCst), 1);
    assert_eq!(f.disks.ensure_calls.load(Ordering::SeqCst), 1);
    assert_eq!(FakeDriver::calls(&f.driver.create_calls), 2);
    assert_eq!(f.manager.persistent_state().unwrap().boot_count, 2);
}

#[tokio::test]
async fn console_requires_running() {
    let f = fixture();
    f.manager.prepare().await.unwrap();
    assert!(matches!(
        f.manager.console().await,
        Err(Error::InvalidState { .. })
    ));

    f.manager.start().await.unwrap();
    let mut console = f.manager.console().await.unwrap();
    f.manager.close_console();
    let mut buf = [0u8; 4];
    assert_eq!(console.output.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn unsupported_features_degrade_with_warnings() {
    let mut config = ManagerConfig {
        network: true,
        ssh_host_port: 2222,
        ..ManagerConfig::default()
    };
    config
        .shared_dirs
        .insert("home".to_string(), SharedDir::new("/home/u", true));
    let f = fixture_with(
        config,
        FakeDriver::with_capabilities(Capabilities::default()),
        extraction(),
        false,
    );

    assert_eq!(f.manager.warnings().len(), 2);
    f.manager.prepare().await.unwrap();

    let vm = f.manager.vm_config().await.unwrap();
    assert!(vm.shared_dirs.is_empty());
    assert!(!vm.network.enabled);
}

#[tokio::test]
async fn supported_features_pass_through() {
    let mut config = ManagerConfig {
        network: true,
        network_mode: "nat".to_string(),
        ssh_host_port: 2222,
        ..ManagerConfig::default()
    };
    config
        .shared_dirs
        .insert("home".to_string(), SharedDir::new("/home/u", true));
    let caps = Capabilities {
        shared_dirs: true,
        networking: true,
        snapshots: false,
    };
    let f = fixture_with(
        config,
        FakeDriver::with_capabilities(caps),
        extraction(),
        false,
    );

    assert!(f.manager.warnings().is_empty());
    f.manager.prepare().await.unwrap();

    let vm = f.manager.vm_config().await.unwrap();
    assert_eq!(vm.shared_dirs.len(), 1);
    assert!(vm.network.enabled);
    assert_eq!(vm.network.port_forwards.get(&2222), Some(&22));
}
