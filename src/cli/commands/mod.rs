// CLI commands module

pub mod attach;
pub mod cluster;
pub mod template;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use clusterlab::{
    connect, load_config, Arch, ClusterManager, DeployExtra, EngineConfig, FileEntry,
    Installer, Namespace, TemplateVersion,
};

/// Flags shared by every command
pub struct GlobalOpts {
    pub verbose: bool,
    pub config: Option<PathBuf>,
    pub backend: Option<String>,
    pub client: bool,
}

impl GlobalOpts {
    pub fn namespace(&self) -> Namespace {
        if self.client {
            Namespace::Client
        } else {
            Namespace::Server
        }
    }

    /// Config file, then environment, then command line
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => EngineConfig::default(),
        };
        let mut config = config.from_env().context("Invalid environment overrides")?;
        if let Some(backend) = &self.backend {
            config.backend = backend.parse()?;
        }
        Ok(config)
    }

    pub async fn manager(&self) -> Result<ClusterManager> {
        let config = self.engine_config()?;
        if self.verbose {
            println!(
                "  Backend: {} ({} namespace)",
                config.backend.to_string().cyan(),
                self.namespace()
            );
        }
        let backend = connect(&config)
            .await
            .with_context(|| format!("Failed to initialise {} backend", config.backend))?;
        Ok(ClusterManager::new(backend, self.namespace()))
    }
}

/// Template identity flags
#[derive(Args, Clone)]
pub struct VersionArgs {
    /// Distribution name (ubuntu, debian, centos, amazon)
    #[arg(short = 'd', long, default_value = "ubuntu")]
    pub distro: String,

    /// Distribution version
    #[arg(short = 'i', long, default_value = "22.04")]
    pub distro_version: String,

    /// Database product version
    #[arg(long = "product-version")]
    pub product_version: String,

    /// Architecture (amd64, arm64); defaults to this machine's
    #[arg(long)]
    pub arch: Option<String>,
}

impl VersionArgs {
    pub fn to_version(&self) -> Result<TemplateVersion> {
        let arch = match &self.arch {
            Some(a) => match Arch::parse(a) {
                Some(arch) => arch,
                None => bail!("Unknown architecture '{}'", a),
            },
            None => Arch::parse(std::env::consts::ARCH).unwrap_or(Arch::Amd64),
        };
        let version = TemplateVersion::new(
            self.distro.as_str(),
            self.distro_version.as_str(),
            self.product_version.as_str(),
            arch,
        );
        version.validate()?;
        Ok(version)
    }
}

/// Provider knobs for deploy and bake
#[derive(Args, Clone, Default)]
pub struct ExtraArgs {
    /// Extra key=value tags or labels (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Cloud instance type
    #[arg(long)]
    pub instance_type: Option<String>,

    /// Cloud disk sizes in GB (repeatable, first is root)
    #[arg(long = "disk")]
    pub disk_sizes_gb: Vec<u32>,

    /// Cloud security group id (repeatable)
    #[arg(long = "security-group")]
    pub security_group_ids: Vec<String>,

    /// Cloud subnet id
    #[arg(long)]
    pub subnet_id: Option<String>,

    /// Use the public address of cloud nodes
    #[arg(long)]
    pub public_ip: Option<bool>,

    /// Container CPU limit, e.g. 1.5
    #[arg(long)]
    pub cpus: Option<String>,

    /// Container memory limit, e.g. 2g
    #[arg(long)]
    pub ram: Option<String>,

    /// Container swap limit
    #[arg(long)]
    pub swap: Option<String>,

    /// Exposed ports host:container (repeatable)
    #[arg(short = 'p', long = "port")]
    pub ports: Vec<String>,

    /// Container network
    #[arg(long)]
    pub network: Option<String>,

    /// Run containers privileged
    #[arg(long)]
    pub privileged: bool,

    /// Hostname base for containers
    #[arg(long)]
    pub hostname: Option<String>,
}

impl From<ExtraArgs> for DeployExtra {
    fn from(args: ExtraArgs) -> Self {
        DeployExtra {
            tags: args.tags,
            instance_type: args.instance_type,
            disk_sizes_gb: args.disk_sizes_gb,
            security_group_ids: args.security_group_ids,
            subnet_id: args.subnet_id,
            public_ip: args.public_ip,
            cpu_limit: args.cpus,
            ram_limit: args.ram,
            swap_limit: args.swap,
            exposed_ports: args.ports,
            network: args.network,
            privileged: args.privileged,
            hostname: args.hostname,
        }
    }
}

/// Installer script and extra files to bake a missing template
#[derive(Args, Clone, Default)]
pub struct InstallerArgs {
    /// Local installer script, run on the template as /root/installer.sh
    #[arg(long)]
    pub installer: Option<PathBuf>,

    /// Extra file to place on the template, as local:remote (repeatable)
    #[arg(long = "file")]
    pub files: Vec<String>,
}

impl InstallerArgs {
    pub async fn load(&self) -> Result<Option<Installer>> {
        let path = match &self.installer {
            Some(path) => path,
            None => {
                if !self.files.is_empty() {
                    bail!("--file requires --installer");
                }
                return Ok(None);
            }
        };
        let script = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read installer {}", path.display()))?;
        let mut files = Vec::with_capacity(self.files.len());
        for spec in &self.files {
            let (local, remote) = match spec.split_once(':') {
                Some((l, r)) if !l.is_empty() && r.starts_with('/') => (l, r),
                _ => bail!("Invalid --file '{}', expected local:/absolute/remote", spec),
            };
            let contents = tokio::fs::read(local)
                .await
                .with_context(|| format!("Failed to read {}", local))?;
            files.push(FileEntry::new(remote, contents));
        }
        Ok(Some(Installer { script, files }))
    }
}

/// Comma separated cluster names
pub fn parse_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Comma separated node numbers; empty means all nodes
pub fn parse_nodes(raw: Option<&str>) -> Result<Option<Vec<u32>>> {
    let raw = match raw {
        Some(r) if !r.trim().is_empty() => r,
        _ => return Ok(None),
    };
    let nodes = raw
        .split(',')
        .map(|n| {
            n.trim()
                .parse::<u32>()
                .with_context(|| format!("Invalid node number '{}'", n.trim()))
        })
        .collect::<Result<Vec<u32>>>()?;
    Ok(Some(nodes))
}

/// Token cancelled by Ctrl-C so bakes and deploys can clean up
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, cleaning up...".yellow());
            trigger.cancel();
        }
    });
    token
}
