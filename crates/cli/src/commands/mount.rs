//! The `mount` command: shell the guest runs to mount virtio-fs shares.

use super::{ShareArg, parse_share};
use burrow::MountHelper;
use clap::Args;

#[derive(Args)]
pub struct MountArgs {
    /// Shared directories (format: tag=path)
    #[arg(long, short, value_parser = parse_share)]
    share: Vec<ShareArg>,

    /// Print only the command for this tag
    #[arg(long)]
    tag: Option<String>,

    /// Guest directory the shares are mounted under
    #[arg(long, default_value = "/mnt")]
    base: String,
}

fn render(args: &MountArgs) -> anyhow::Result<String> {
    let helper = MountHelper::new(
        args.share
            .iter()
            .map(|s| (s.tag.clone(), s.dir.host_path.clone())),
    );
    let base = args.base.trim_end_matches('/');

    match &args.tag {
        Some(tag) => {
            if !helper.tags().contains(&tag.as_str()) {
                anyhow::bail!("no share with tag {tag:?}");
            }
            Ok(format!(
                "{}\n",
                helper.mount_command(tag, &format!("{base}/{tag}"))
            ))
        }
        None => Ok(helper.mount_script(base)),
    }
}

pub fn run(args: MountArgs) -> anyhow::Result<()> {
    print!("{}", render(&args)?);
    Ok(())
}
