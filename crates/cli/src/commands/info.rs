//! The `info` command: the host driver and its capabilities.

use burrow::{Capabilities, DriverInfo};
use clap::Args;
use serde::Serialize;

#[derive(Args)]
pub struct InfoArgs {
    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    driver: DriverInfo,
    capabilities: Capabilities,
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

fn render_text(report: &Report) -> String {
    let caps = &report.capabilities;
    format!(
        "Driver: {} {} ({})\n\
         Shared directories: {}\n\
         Networking: {}\n\
         Snapshots: {}\n",
        report.driver.name,
        report.driver.version,
        report.driver.arch,
        yes_no(caps.shared_dirs),
        yes_no(caps.networking),
        yes_no(caps.snapshots),
    )
}

pub fn run(args: InfoArgs) -> anyhow::Result<()> {
    let driver = burrow::platform::new_driver()?;
    let report = Report {
        driver: driver.info(),
        capabilities: driver.capabilities(),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_text(&report));
    }
    Ok(())
}
