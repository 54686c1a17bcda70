// Attach command - one node, this terminal

use anyhow::Result;
use clap::Args;

use super::GlobalOpts;

#[derive(Args)]
pub struct AttachArgs {
    /// Cluster name
    #[arg(short = 'n', long, default_value = "mydc")]
    pub name: String,

    /// Node number
    #[arg(short = 'l', long, default_value = "1")]
    pub node: u32,

    /// Allocate an interactive terminal
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Command to run (default: a shell)
    #[arg(last = true)]
    pub command: Vec<String>,
}

pub async fn execute(args: AttachArgs, opts: &GlobalOpts) -> Result<()> {
    let manager = opts.manager().await?;
    // An empty command opens a shell, which only makes sense interactively.
    let interactive = args.interactive || args.command.is_empty();
    manager
        .attach(&args.name, args.node, &args.command, interactive)
        .await?;
    Ok(())
}
