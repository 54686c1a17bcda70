// Second cloud backend. Selectable so configuration round-trips, but none of
// its operations exist yet.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::backend::{Arch, Backend, DeployExtra, FileEntry, NodeOutput, TemplateVersion};
use crate::config::BackendKind;
use crate::error::{Error, Result};
use crate::exec::ExecStreams;
use crate::namespace::Namespace;

fn unimplemented(operation: &'static str) -> Error {
    Error::NotImplemented {
        backend: "gcp",
        operation,
    }
}

#[derive(Debug, Default)]
pub struct GcpBackend;

impl GcpBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Backend for GcpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gcp
    }

    async fn cluster_list(&self, _ns: Namespace) -> Result<Vec<String>> {
        Err(unimplemented("cluster_list"))
    }

    async fn node_list_in_cluster(&self, _ns: Namespace, _name: &str) -> Result<Vec<u32>> {
        Err(unimplemented("node_list_in_cluster"))
    }

    async fn get_node_ip_map(
        &self,
        _ns: Namespace,
        _name: &str,
        _internal: bool,
    ) -> Result<BTreeMap<u32, String>> {
        Err(unimplemented("get_node_ip_map"))
    }

    async fn node_arch(&self, _ns: Namespace, _name: &str, _node: u32) -> Result<Arch> {
        Err(unimplemented("node_arch"))
    }

    async fn deploy_cluster(
        &self,
        _ns: Namespace,
        _version: &TemplateVersion,
        _name: &str,
        _count: u32,
        _extra: &DeployExtra,
        _cancel: &CancellationToken,
    ) -> Result<Vec<u32>> {
        Err(unimplemented("deploy_cluster"))
    }

    async fn cluster_start(&self, _ns: Namespace, _name: &str, _nodes: Option<&[u32]>) -> Result<()> {
        Err(unimplemented("cluster_start"))
    }

    async fn cluster_stop(&self, _ns: Namespace, _name: &str, _nodes: Option<&[u32]>) -> Result<()> {
        Err(unimplemented("cluster_stop"))
    }

    async fn cluster_destroy(
        &self,
        _ns: Namespace,
        _name: &str,
        _nodes: Option<&[u32]>,
    ) -> Result<()> {
        Err(unimplemented("cluster_destroy"))
    }

    async fn run_commands(
        &self,
        _ns: Namespace,
        _name: &str,
        _commands: &[Vec<String>],
        _nodes: Option<&[u32]>,
    ) -> Result<Vec<NodeOutput>> {
        Err(unimplemented("run_commands"))
    }

    async fn copy_files_to_cluster(
        &self,
        _ns: Namespace,
        _name: &str,
        _files: &[FileEntry],
        _nodes: Option<&[u32]>,
    ) -> Result<()> {
        Err(unimplemented("copy_files_to_cluster"))
    }

    async fn list_templates(&self, _ns: Namespace) -> Result<Vec<TemplateVersion>> {
        Err(unimplemented("list_templates"))
    }

    async fn deploy_template(
        &self,
        _ns: Namespace,
        _version: &TemplateVersion,
        _script: &[u8],
        _files: &[FileEntry],
        _extra: &DeployExtra,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Err(unimplemented("deploy_template"))
    }

    async fn template_destroy(&self, _ns: Namespace, _version: &TemplateVersion) -> Result<()> {
        Err(unimplemented("template_destroy"))
    }

    async fn vacuum_templates(&self, _ns: Namespace) -> Result<()> {
        Err(unimplemented("vacuum_templates"))
    }

    async fn run_custom_out(
        &self,
        _ns: Namespace,
        _name: &str,
        _node: u32,
        _command: &[String],
        _streams: ExecStreams,
        _interactive: bool,
    ) -> Result<()> {
        Err(unimplemented("run_custom_out"))
    }

    async fn get_key_path(&self, _ns: Namespace, _name: &str) -> Result<PathBuf> {
        Err(unimplemented("get_key_path"))
    }
}
