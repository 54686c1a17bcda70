// Cluster command - lifecycle of lab clusters

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use super::{cancel_on_ctrl_c, parse_names, parse_nodes, ExtraArgs, GlobalOpts, InstallerArgs, VersionArgs};
use clusterlab::{DeployExtra, Error, NodeOutput};

#[derive(Args)]
pub struct ClusterArgs {
    #[command(subcommand)]
    pub action: ClusterAction,
}

#[derive(Subcommand)]
pub enum ClusterAction {
    /// List clusters with their nodes and addresses
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Create a new cluster
    Create(DeployArgs),

    /// Add nodes to an existing cluster
    Grow(DeployArgs),

    /// Start nodes of one or more clusters
    Start(SelectArgs),

    /// Stop nodes of one or more clusters
    Stop(SelectArgs),

    /// Destroy nodes of one or more clusters
    Destroy(SelectArgs),

    /// Run a command on cluster nodes and print each node's output
    Run {
        /// Cluster name
        #[arg(short = 'n', long, default_value = "mydc")]
        name: String,

        /// Comma separated node numbers (default: all)
        #[arg(short = 'l', long)]
        nodes: Option<String>,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Args)]
pub struct DeployArgs {
    /// Cluster name
    #[arg(short = 'n', long, default_value = "mydc")]
    pub name: String,

    /// Number of nodes to add
    #[arg(short = 'c', long, default_value = "1")]
    pub count: u32,

    #[command(flatten)]
    pub version: VersionArgs,

    #[command(flatten)]
    pub installer: InstallerArgs,

    #[command(flatten)]
    pub extra: ExtraArgs,
}

#[derive(Args)]
pub struct SelectArgs {
    /// Comma separated cluster names
    #[arg(short = 'n', long, default_value = "mydc")]
    pub name: String,

    /// Comma separated node numbers (default: all)
    #[arg(short = 'l', long)]
    pub nodes: Option<String>,
}

pub async fn execute(args: ClusterArgs, opts: &GlobalOpts) -> Result<()> {
    let manager = opts.manager().await?;

    match args.action {
        ClusterAction::List { json } => {
            let clusters = manager.list_full().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&clusters)?);
                return Ok(());
            }
            if clusters.is_empty() {
                println!("{}", "No clusters found".yellow());
                return Ok(());
            }
            println!(
                "{:<20} {:<6} {:<7} {:<18} {:<18}",
                "CLUSTER", "NODE", "ARCH", "PUBLIC IP", "PRIVATE IP"
            );
            for cluster in &clusters {
                for node in &cluster.nodes {
                    println!(
                        "{:<20} {:<6} {:<7} {:<18} {:<18}",
                        cluster.name.cyan(),
                        node.node,
                        node.arch,
                        node.public_ip.as_deref().unwrap_or("-"),
                        node.private_ip.as_deref().unwrap_or("-"),
                    );
                }
            }
        }

        ClusterAction::Create(deploy) | ClusterAction::Grow(deploy) if deploy.count == 0 => {
            bail!("Cluster '{}' needs at least one node", deploy.name);
        }

        ClusterAction::Create(deploy) => {
            let version = deploy.version.to_version()?;
            let installer = deploy.installer.load().await?;
            let extra = DeployExtra::from(deploy.extra);
            let cancel = cancel_on_ctrl_c();
            println!(
                "{} Creating cluster {} ({} nodes, {})",
                "🚀".cyan(),
                deploy.name.bold(),
                deploy.count,
                version
            );
            let nodes = manager
                .create(&deploy.name, &version, deploy.count, installer.as_ref(), &extra, &cancel)
                .await
                .map_err(report_growth)?;
            println!("{} Created nodes {:?}", "✅".green(), nodes);
        }

        ClusterAction::Grow(deploy) => {
            let version = deploy.version.to_version()?;
            let installer = deploy.installer.load().await?;
            let extra = DeployExtra::from(deploy.extra);
            let cancel = cancel_on_ctrl_c();
            println!(
                "{} Growing cluster {} by {} nodes",
                "🚀".cyan(),
                deploy.name.bold(),
                deploy.count
            );
            let nodes = manager
                .grow(&deploy.name, &version, deploy.count, installer.as_ref(), &extra, &cancel)
                .await
                .map_err(report_growth)?;
            println!("{} Added nodes {:?}", "✅".green(), nodes);
        }

        ClusterAction::Start(select) => {
            let nodes = parse_nodes(select.nodes.as_deref())?;
            manager.start(&parse_names(&select.name), nodes.as_deref()).await?;
            println!("{} Started {}", "✅".green(), select.name);
        }

        ClusterAction::Stop(select) => {
            let nodes = parse_nodes(select.nodes.as_deref())?;
            manager.stop(&parse_names(&select.name), nodes.as_deref()).await?;
            println!("{} Stopped {}", "✅".green(), select.name);
        }

        ClusterAction::Destroy(select) => {
            let nodes = parse_nodes(select.nodes.as_deref())?;
            manager.destroy(&parse_names(&select.name), nodes.as_deref()).await?;
            println!("{} Destroyed {}", "✅".green(), select.name);
        }

        ClusterAction::Run { name, nodes, command } => {
            let nodes = parse_nodes(nodes.as_deref())?;
            match manager.run(&name, &[command], nodes.as_deref()).await {
                Ok(outputs) => print_outputs(&name, &outputs),
                Err(Error::RunFailure { cluster, outputs, failures }) => {
                    print_outputs(&name, &outputs);
                    return Err(Error::RunFailure {
                        cluster,
                        outputs: Vec::new(),
                        failures,
                    }
                    .into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}

fn print_outputs(name: &str, outputs: &[NodeOutput]) {
    for output in outputs {
        println!("{}", format!("--- {} node {} ---", name, output.node).blue().bold());
        for out in &output.outputs {
            print!("{}", String::from_utf8_lossy(out));
        }
    }
}

/// Nodes created before a failed grow are still running; say which.
fn report_growth(err: Error) -> anyhow::Error {
    if let Error::ClusterGrowth { cluster, created, .. } = &err {
        if !created.is_empty() {
            eprintln!(
                "{} Cluster {} kept nodes {:?} created before the failure",
                "⚠️".yellow(),
                cluster,
                created
            );
        }
    }
    err.into()
}
