//! The `run` command: prepare, boot and attach to a VM.

use super::{ShareArg, parse_share};
use crate::console;
use anyhow::Context;
use burrow::{ImageStore, LocalAssets, Manager, ManagerConfig, RunningMarker, VmLayout};
use clap::Args;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn parse_existing_file(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if !path.is_file() {
        return Err(format!("file not found: {s}"));
    }
    Ok(path)
}

#[derive(Args)]
pub struct RunArgs {
    /// VM name; its files live under <home>/data/<name>
    #[arg(long)]
    name: String,

    /// Path to the kernel image
    #[arg(long, value_parser = parse_existing_file)]
    kernel: PathBuf,

    /// Path to the initramfs
    #[arg(long, value_parser = parse_existing_file)]
    initrd: Option<PathBuf>,

    /// Boot from this root filesystem image instead of a managed disk
    #[arg(long, value_parser = parse_existing_file)]
    rootfs: Option<PathBuf>,

    /// Kernel command line (root= and console= are added when missing)
    #[arg(long)]
    cmdline: Option<String>,

    /// Number of CPUs
    #[arg(long)]
    cpus: Option<u32>,

    /// Memory in MiB
    #[arg(long)]
    memory: Option<u64>,

    /// Size of the managed disk in MiB
    #[arg(long)]
    disk_size: Option<u64>,

    /// Shared directories (format: tag=path or tag=path:ro)
    #[arg(long, short, value_parser = parse_share)]
    share: Vec<ShareArg>,

    /// Attach a NAT network device
    #[arg(long)]
    network: bool,

    /// Static MAC address for the network device
    #[arg(long)]
    mac: Option<String>,

    /// Host port forwarded to the guest's SSH server
    #[arg(long)]
    ssh_port: Option<u16>,

    /// TOML file with manager settings; flags override it
    #[arg(long, short)]
    config: Option<PathBuf>,
}

fn load_config(path: &Path) -> anyhow::Result<ManagerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

impl RunArgs {
    fn manager_config(&self) -> anyhow::Result<ManagerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ManagerConfig::default(),
        };
        if let Some(cpus) = self.cpus {
            config.cpus = cpus;
        }
        if let Some(memory) = self.memory {
            config.memory_mb = memory;
        }
        if let Some(size) = self.disk_size {
            config.disk_size_mb = size;
        }
        for share in &self.share {
            config.shared_dirs.insert(share.tag.clone(), share.dir.clone());
        }
        if self.network {
            config.network = true;
        }
        if let Some(mac) = &self.mac {
            config.mac_address = Some(mac.clone());
        }
        if let Some(port) = self.ssh_port {
            config.ssh_host_port = port;
        }
        Ok(config)
    }

    fn assets(&self) -> LocalAssets {
        let mut assets = LocalAssets::new(&self.kernel);
        if let Some(initrd) = &self.initrd {
            assets = assets.with_initramfs(initrd);
        }
        if let Some(rootfs) = &self.rootfs {
            assets = assets.with_rootfs(rootfs);
        }
        if let Some(cmdline) = &self.cmdline {
            assets = assets.with_cmdline(cmdline);
        }
        assets
    }
}

pub async fn run(home: &Path, args: RunArgs) -> anyhow::Result<()> {
    let layout = VmLayout::new(home, &args.name)?;
    let config = args.manager_config()?;
    // Keeps `snapshot restore` away from the disk until this command returns.
    let _running = RunningMarker::acquire(&layout)?;
    let disks = ImageStore::new(layout.dir());
    let driver = burrow::platform::new_driver()?;

    let manager = Manager::new(
        config,
        layout,
        driver,
        Arc::new(args.assets()),
        Arc::new(disks),
    );
    for warning in manager.warnings() {
        eprintln!("warning: {warning}");
    }

    manager
        .prepare()
        .await
        .with_context(|| format!("preparing {}", args.name))?;
    manager
        .start()
        .await
        .with_context(|| format!("starting {}", args.name))?;
    eprintln!("Started {} ({}). Ctrl-C stops it.", args.name, manager.driver_info().name);

    console::attach(&manager).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(extra: &[&str], kernel: &Path) -> RunArgs {
        let kernel = kernel.to_str().unwrap();
        let mut argv = vec!["burrow", "--name", "dev", "--kernel", kernel];
        argv.extend_from_slice(extra);
        Harness::try_parse_from(argv).unwrap().run
    }

    #[test]
    fn flags_override_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("vmlinuz");
        std::fs::write(&kernel, b"k").unwrap();
        let file = dir.path().join("vm.toml");
        std::fs::write(&file, "cpus = 2\nmemory_mb = 2048\nnetwork = false\n").unwrap();

        let args = parse(
            &[
                "--config",
                file.to_str().unwrap(),
                "--cpus",
                "4",
                "--network",
                "--ssh-port",
                "2222",
                "--share",
                "src=/home/u/src:ro",
            ],
            &kernel,
        );
        let config = args.manager_config().unwrap();
        assert_eq!(config.cpus, 4);
        assert_eq!(config.memory_mb, 2048);
        assert!(config.network);
        assert_eq!(config.ssh_host_port, 2222);
        assert!(config.shared_dirs["src"].read_only);
    }

    #[test]
    fn zero_values_are_left_for_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("vmlinuz");
        std::fs::write(&kernel, b"k").unwrap();

        let config = parse(&[], &kernel).manager_config().unwrap();
        assert_eq!(config, ManagerConfig::default());
    }

    #[test]
    fn missing_kernel_is_rejected_by_the_parser() {
        let result = Harness::try_parse_from(["burrow", "--name", "dev", "--kernel", "/nonexistent"]);
        assert!(result.is_err());
    }

    #[test]
    fn bad_config_file_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("vm.toml");
        std::fs::write(&file, "cpus = \"many\"").unwrap();
        let err = load_config(&file).unwrap_err();
        assert!(format!("{err:#}").contains("vm.toml"));
    }
}
