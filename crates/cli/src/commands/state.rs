//! The `state` command: a VM's persistent boot history.

use anyhow::Context;
use burrow::{StateFile, VmLayout};
use clap::Args;
use std::path::Path;

#[derive(Args)]
pub struct StateArgs {
    /// VM name
    #[arg(long)]
    name: String,
}

pub fn run(home: &Path, args: StateArgs) -> anyhow::Result<()> {
    let layout = VmLayout::new(home, &args.name)?;
    let state = StateFile::new(layout.state_file())
        .load()
        .with_context(|| format!("reading state of {}", args.name))?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}
