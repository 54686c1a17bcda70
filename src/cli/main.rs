// Clusterlab CLI - Command Line Interface

use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;

use commands::{attach, cluster, template, GlobalOpts};

/// Clusterlab CLI - lab database clusters on cloud, docker or lxc
#[derive(Parser)]
#[command(name = "clusterlab")]
#[command(version)]
#[command(about = "Create, grow and tear down lab database clusters", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine config file (JSON)
    #[arg(long, global = true, env = "CLUSTERLAB_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Backend to use, overriding config and environment (aws, docker, lxc, gcp)
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Work on client machines instead of server clusters
    #[arg(long, global = true)]
    client: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster lifecycle - list, create, grow, start, stop, destroy, run
    Cluster(cluster::ClusterArgs),

    /// Template management - list, create, destroy, vacuum
    Template(template::TemplateArgs),

    /// Run a command on one node attached to this terminal
    Attach(attach::AttachArgs),
}

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let opts = GlobalOpts {
        verbose: cli.verbose,
        config: cli.config,
        backend: cli.backend,
        client: cli.client,
    };

    let result = match cli.command {
        Commands::Cluster(args) => cluster::execute(args, &opts).await,
        Commands::Template(args) => template::execute(args, &opts).await,
        Commands::Attach(args) => attach::execute(args, &opts).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
