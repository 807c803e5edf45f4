mod commands;
mod console;
mod runtime;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "burrow")]
#[command(about = "Lightweight Linux VMs on the host's native hypervisor")]
#[command(version)]
struct Cli {
    /// Log debug output
    #[arg(long, short, global = true)]
    verbose: bool,

    /// State directory (default: ~/.burrow)
    #[arg(long, global = true, env = "BURROW_HOME")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare, boot and attach to a VM
    Run(commands::run::RunArgs),

    /// Show the host driver and what it supports
    Info(commands::info::InfoArgs),

    /// Show a VM's boot history
    State(commands::state::StateArgs),

    /// Create, list, restore, delete or verify disk snapshots
    #[command(subcommand)]
    Snapshot(commands::snapshot::SnapshotCommand),

    /// Print guest commands that mount shared directories
    Mount(commands::mount::MountArgs),
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn default_home() -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .ok_or_else(|| anyhow::anyhow!("HOME is not set; pass --home"))?;
    Ok(PathBuf::from(home).join(".burrow"))
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let home = match cli.home {
        Some(home) => home,
        None => default_home()?,
    };

    match cli.command {
        Commands::Run(args) => commands::run::run(&home, args).await,
        Commands::Info(args) => commands::info::run(args),
        Commands::State(args) => commands::state::run(&home, args),
        Commands::Snapshot(command) => commands::snapshot::run(&home, command),
        Commands::Mount(args) => commands::mount::run(args),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    std::process::exit(runtime::run(dispatch(cli)));
}
