// Cluster Lifecycle Manager
//
// Public operations over whichever backend is configured. Cluster-level
// checks (exists / does not exist, template present) live here; everything
// provider specific stays behind the `Backend` trait.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{Arch, Backend, DeployExtra, FileEntry, NodeOutput, TemplateVersion};
use crate::error::{Error, Result};
use crate::namespace::Namespace;

/// Installer used to bake a template that does not exist yet
#[derive(Debug, Clone, Default)]
pub struct Installer {
    pub script: Vec<u8>,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub node: u32,
    pub arch: Arch,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterSummary {
    pub name: String,
    pub nodes: Vec<NodeSummary>,
}

pub struct ClusterManager {
    backend: Arc<dyn Backend>,
    ns: Namespace,
}

impl ClusterManager {
    pub fn new(backend: Arc<dyn Backend>, ns: Namespace) -> Self {
        Self { backend, ns }
    }

    pub fn namespace(&self) -> Namespace {
        self.ns
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        self.backend.cluster_list(self.ns).await
    }

    /// Every cluster with its nodes and addresses
    pub async fn list_full(&self) -> Result<Vec<ClusterSummary>> {
        let mut summaries = Vec::new();
        for name in self.backend.cluster_list(self.ns).await? {
            let nodes = self.backend.node_list_in_cluster(self.ns, &name).await?;
            let public = self.backend.get_node_ip_map(self.ns, &name, false).await?;
            let private = self.backend.get_node_ip_map(self.ns, &name, true).await?;
            let mut summary = Vec::with_capacity(nodes.len());
            for node in nodes {
                summary.push(NodeSummary {
                    node,
                    arch: self.backend.node_arch(self.ns, &name, node).await?,
                    public_ip: public.get(&node).cloned(),
                    private_ip: private.get(&node).cloned(),
                });
            }
            summaries.push(ClusterSummary {
                nodes: summary,
                name,
            });
        }
        Ok(summaries)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .backend
            .cluster_list(self.ns)
            .await?
            .iter()
            .any(|c| c == name))
    }

    /// Bake the template first when it is missing and an installer is given
    async fn ensure_template(
        &self,
        version: &TemplateVersion,
        installer: Option<&Installer>,
        extra: &DeployExtra,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.backend.list_templates(self.ns).await?.contains(version) {
            return Ok(());
        }
        let installer = installer.ok_or_else(|| {
            Error::not_found(format!("template {} (no installer given to bake it)", version))
        })?;
        info!(template = %version, "template missing, baking it first");
        self.backend
            .deploy_template(
                self.ns,
                version,
                &installer.script,
                &installer.files,
                extra,
                cancel,
            )
            .await
    }

    /// Create a new cluster of `count` nodes
    pub async fn create(
        &self,
        name: &str,
        version: &TemplateVersion,
        count: u32,
        installer: Option<&Installer>,
        extra: &DeployExtra,
        cancel: &CancellationToken,
    ) -> Result<Vec<u32>> {
        if self.exists(name).await? {
            return Err(Error::AlreadyExists(format!(
                "cluster {}; use grow to add nodes",
                name
            )));
        }
        self.ensure_template(version, installer, extra, cancel)
            .await?;
        let nodes = self
            .backend
            .deploy_cluster(self.ns, version, name, count, extra, cancel)
            .await?;
        info!(cluster = name, namespace = %self.ns, nodes = ?nodes, "cluster created");
        Ok(nodes)
    }

    /// Add `count` nodes to an existing cluster
    pub async fn grow(
        &self,
        name: &str,
        version: &TemplateVersion,
        count: u32,
        installer: Option<&Installer>,
        extra: &DeployExtra,
        cancel: &CancellationToken,
    ) -> Result<Vec<u32>> {
        if !self.exists(name).await? {
            return Err(Error::not_found(format!("cluster {}; use create first", name)));
        }
        self.ensure_template(version, installer, extra, cancel)
            .await?;
        let nodes = self
            .backend
            .deploy_cluster(self.ns, version, name, count, extra, cancel)
            .await?;
        info!(cluster = name, namespace = %self.ns, nodes = ?nodes, "cluster grown");
        Ok(nodes)
    }

    /// Apply one operation to each cluster in turn. A single cluster's error
    /// is returned as is; several are combined.
    async fn each_cluster<'a, F, Fut>(&self, operation: &str, names: &'a [String], op: F) -> Result<()>
    where
        F: Fn(&'a str) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if names.is_empty() {
            return Err(Error::invalid("at least one cluster name is required"));
        }
        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = op(name.as_str()).await {
                warn!(cluster = %name, operation, error = %e, "cluster operation failed");
                failures.push((name.clone(), e));
            }
        }
        match failures.len() {
            0 => Ok(()),
            1 if names.len() == 1 => Err(failures.remove(0).1),
            _ => Err(Error::MultiCluster {
                operation: operation.to_string(),
                failures,
            }),
        }
    }

    pub async fn start(&self, names: &[String], nodes: Option<&[u32]>) -> Result<()> {
        self.each_cluster("start", names, |name| {
            self.backend.cluster_start(self.ns, name, nodes)
        })
        .await
    }

    pub async fn stop(&self, names: &[String], nodes: Option<&[u32]>) -> Result<()> {
        self.each_cluster("stop", names, |name| {
            self.backend.cluster_stop(self.ns, name, nodes)
        })
        .await
    }

    pub async fn destroy(&self, names: &[String], nodes: Option<&[u32]>) -> Result<()> {
        self.each_cluster("destroy", names, |name| {
            self.backend.cluster_destroy(self.ns, name, nodes)
        })
        .await
    }

    pub async fn run(
        &self,
        name: &str,
        commands: &[Vec<String>],
        nodes: Option<&[u32]>,
    ) -> Result<Vec<NodeOutput>> {
        self.backend.run_commands(self.ns, name, commands, nodes).await
    }

    pub async fn copy(&self, name: &str, files: &[FileEntry], nodes: Option<&[u32]>) -> Result<()> {
        self.backend
            .copy_files_to_cluster(self.ns, name, files, nodes)
            .await
    }

    pub async fn attach(
        &self,
        name: &str,
        node: u32,
        command: &[String],
        interactive: bool,
    ) -> Result<()> {
        self.backend
            .attach_and_run(self.ns, name, node, command, interactive)
            .await
    }

    pub async fn key_path(&self, name: &str) -> Result<PathBuf> {
        self.backend.get_key_path(self.ns, name).await
    }

    pub async fn templates(&self) -> Result<Vec<TemplateVersion>> {
        self.backend.list_templates(self.ns).await
    }

    pub async fn bake_template(
        &self,
        version: &TemplateVersion,
        installer: &Installer,
        extra: &DeployExtra,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.backend
            .deploy_template(
                self.ns,
                version,
                &installer.script,
                &installer.files,
                extra,
                cancel,
            )
            .await
    }

    pub async fn destroy_template(&self, version: &TemplateVersion) -> Result<()> {
        self.backend.template_destroy(self.ns, version).await
    }

    pub async fn vacuum_templates(&self) -> Result<()> {
        self.backend.vacuum_templates(self.ns).await
    }
}
