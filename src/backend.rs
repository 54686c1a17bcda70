// Backend Trait
//
// Abstracts the underlying infrastructure provider (cloud, docker, lxc)
// behind one cluster lifecycle contract.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::aws::AwsBackend;
use crate::config::{BackendKind, EngineConfig};
use crate::docker::DockerBackend;
use crate::ec2::AwsCli;
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, ExecStreams, LocalRunner, SshExec};
use crate::gcp::GcpBackend;
use crate::lxc::LxcBackend;
use crate::namespace::Namespace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    pub fn from_is_arm(is_arm: bool) -> Self {
        if is_arm {
            Self::Arm64
        } else {
            Self::Amd64
        }
    }

    pub fn is_arm(self) -> bool {
        self == Self::Arm64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
        }
    }

    /// Short form stored in the cloud `Arch` tag
    pub fn tag_value(self) -> &'static str {
        match self {
            Self::Amd64 => "amd",
            Self::Arm64 => "arm",
        }
    }

    /// Accepts the spellings used by docker, lxc, uname and the cloud API
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amd64" | "amd" | "x86_64" | "x86-64" => Some(Self::Amd64),
            "arm64" | "arm" | "aarch64" => Some(Self::Arm64),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a baked template
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub distro: String,
    pub distro_version: String,
    pub product_version: String,
    pub arch: Arch,
}

impl TemplateVersion {
    pub fn new(
        distro: impl Into<String>,
        distro_version: impl Into<String>,
        product_version: impl Into<String>,
        arch: Arch,
    ) -> Self {
        Self {
            distro: distro.into(),
            distro_version: distro_version.into(),
            product_version: product_version.into(),
            arch,
        }
    }

    /// Components end up inside resource names, so separators are off limits
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("distro", &self.distro),
            ("distro version", &self.distro_version),
            ("product version", &self.product_version),
        ] {
            if value.is_empty() {
                return Err(Error::invalid(format!("template {} must not be empty", field)));
            }
            if value
                .chars()
                .any(|c| c == '_' || c == ':' || c == '/' || c.is_whitespace())
            {
                return Err(Error::invalid(format!(
                    "template {} '{}' may not contain '_', ':', '/' or whitespace",
                    field, value
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for TemplateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.distro, self.distro_version, self.product_version, self.arch
        )
    }
}

/// A file to place on a node, by absolute path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub contents: Vec<u8>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// Provider-specific knobs for deploy and bake. Backends ignore what they
/// have no concept of.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployExtra {
    /// `key=value` pairs applied as tags (cloud) or labels (docker)
    pub tags: Vec<String>,

    // Cloud
    pub instance_type: Option<String>,
    pub disk_sizes_gb: Vec<u32>,
    pub security_group_ids: Vec<String>,
    pub subnet_id: Option<String>,
    pub public_ip: Option<bool>,

    // Containers
    pub cpu_limit: Option<String>,
    pub ram_limit: Option<String>,
    pub swap_limit: Option<String>,
    pub exposed_ports: Vec<String>,
    pub network: Option<String>,
    pub privileged: bool,
    pub hostname: Option<String>,
}

/// Captured output of every command that ran on one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutput {
    pub node: u32,
    pub outputs: Vec<Vec<u8>>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Distinct cluster names in the namespace
    async fn cluster_list(&self, ns: Namespace) -> Result<Vec<String>>;

    /// Node numbers of a cluster, ascending
    async fn node_list_in_cluster(&self, ns: Namespace, name: &str) -> Result<Vec<u32>>;

    /// Node number to address; `internal` selects the private address
    async fn get_node_ip_map(
        &self,
        ns: Namespace,
        name: &str,
        internal: bool,
    ) -> Result<BTreeMap<u32, String>>;

    /// Architecture a node runs on
    async fn node_arch(&self, ns: Namespace, name: &str, node: u32) -> Result<Arch>;

    /// Create `count` nodes numbered after the current maximum
    async fn deploy_cluster(
        &self,
        ns: Namespace,
        version: &TemplateVersion,
        name: &str,
        count: u32,
        extra: &DeployExtra,
        cancel: &CancellationToken,
    ) -> Result<Vec<u32>>;

    async fn cluster_start(&self, ns: Namespace, name: &str, nodes: Option<&[u32]>) -> Result<()>;

    async fn cluster_stop(&self, ns: Namespace, name: &str, nodes: Option<&[u32]>) -> Result<()>;

    async fn cluster_destroy(&self, ns: Namespace, name: &str, nodes: Option<&[u32]>)
        -> Result<()>;

    /// Run commands in order on each node; a failure stops that node only
    async fn run_commands(
        &self,
        ns: Namespace,
        name: &str,
        commands: &[Vec<String>],
        nodes: Option<&[u32]>,
    ) -> Result<Vec<NodeOutput>>;

    async fn copy_files_to_cluster(
        &self,
        ns: Namespace,
        name: &str,
        files: &[FileEntry],
        nodes: Option<&[u32]>,
    ) -> Result<()>;

    async fn list_templates(&self, ns: Namespace) -> Result<Vec<TemplateVersion>>;

    /// Bake a template by running `script` inside a fresh base image
    async fn deploy_template(
        &self,
        ns: Namespace,
        version: &TemplateVersion,
        script: &[u8],
        files: &[FileEntry],
        extra: &DeployExtra,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn template_destroy(&self, ns: Namespace, version: &TemplateVersion) -> Result<()>;

    /// Remove ephemeral bake resources left behind by an interrupted bake
    async fn vacuum_templates(&self, ns: Namespace) -> Result<()>;

    /// Run one command on one node with the given stdio wiring
    async fn run_custom_out(
        &self,
        ns: Namespace,
        name: &str,
        node: u32,
        command: &[String],
        streams: ExecStreams,
        interactive: bool,
    ) -> Result<()>;

    /// Run one command on one node attached to the caller's terminal
    async fn attach_and_run(
        &self,
        ns: Namespace,
        name: &str,
        node: u32,
        command: &[String],
        interactive: bool,
    ) -> Result<()> {
        self.run_custom_out(ns, name, node, command, ExecStreams::inherit(), interactive)
            .await
    }

    /// Private key used to reach the cluster's nodes
    async fn get_key_path(&self, ns: Namespace, name: &str) -> Result<PathBuf>;
}

/// Expand `None` to every node and check explicit lists against discovery
pub(crate) async fn resolve_nodes(
    backend: &(impl Backend + ?Sized),
    ns: Namespace,
    name: &str,
    nodes: Option<&[u32]>,
) -> Result<Vec<u32>> {
    let existing = backend.node_list_in_cluster(ns, name).await?;
    if existing.is_empty() {
        return Err(Error::not_found(format!("cluster {}", name)));
    }
    match nodes {
        None => Ok(existing),
        Some(requested) => {
            if let Some(missing) = requested.iter().find(|n| !existing.contains(n)) {
                return Err(Error::not_found(format!("node {} in cluster {}", missing, name)));
            }
            let mut requested = requested.to_vec();
            requested.sort_unstable();
            requested.dedup();
            Ok(requested)
        }
    }
}

/// Build the backend selected by configuration
pub async fn connect(config: &EngineConfig) -> Result<Arc<dyn Backend>> {
    config.validate()?;
    let runner: Arc<dyn CommandRunner> = Arc::new(LocalRunner);

    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Aws => {
            let api = Arc::new(AwsCli::new(
                Arc::clone(&runner),
                &config.aws.cli_binary,
                &config.region,
            ));
            let remote = Arc::new(SshExec::new(Arc::clone(&runner)));
            Arc::new(AwsBackend::new(api, remote, config))
        }
        BackendKind::Docker => Arc::new(DockerBackend::connect(runner, config).await?),
        BackendKind::Lxc => Arc::new(LxcBackend::connect(runner, config).await?),
        BackendKind::Gcp => Arc::new(GcpBackend::new()),
    };

    Ok(backend)
}
