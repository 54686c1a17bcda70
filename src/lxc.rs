// LXC Backend
//
// Drives the classic `lxc-*` tools on the local host. Nodes are containers
// named `<prefix><cluster>_<node>`; a template is a stopped container named
// `<template prefix><distro>_<version>_<arch>_<product>` that new nodes are
// cloned from with `lxc-copy`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{
    resolve_nodes, Arch, Backend, DeployExtra, FileEntry, NodeOutput, TemplateVersion,
};
use crate::bake::{bake_files, installer_commands, run_bake};
use crate::bootstrap::poll_attempts;
use crate::config::{BackendKind, EngineConfig, LxcConfig};
use crate::discovery::{
    allocate_node_numbers, distinct_clusters, node_in_cluster, node_name, split_node_name,
    validate_cluster_name,
};
use crate::error::{Error, ExitKind, Result};
use crate::exec::{shell_join, shell_quote, CommandOutput, CommandRunner, ExecStreams};
use crate::fanout::{collect, collect_outputs, fan_out};
use crate::namespace::Namespace;

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// One row of `lxc-ls -f -F NAME,STATE,IPV4`
#[derive(Debug, Clone, PartialEq, Eq)]
struct LxcEntry {
    name: String,
    running: bool,
    ipv4: Option<String>,
}

fn parse_listing(out: &str) -> Vec<LxcEntry> {
    out.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let name = cols.next()?;
            if name == "NAME" {
                return None;
            }
            let running = cols.next().map(|s| s == "RUNNING").unwrap_or(false);
            let ipv4 = cols
                .map(|c| c.trim_end_matches(','))
                .find(|c| c.parse::<Ipv4Addr>().is_ok())
                .map(str::to_string);
            Some(LxcEntry {
                name: name.to_string(),
                running,
                ipv4,
            })
        })
        .collect()
}

/// Distro and release names understood by the download template
fn download_image(version: &TemplateVersion) -> (String, String) {
    let distro = match version.distro.as_str() {
        "el" | "rhel" => "centos",
        other => other,
    };
    let release = match (distro, version.distro_version.as_str()) {
        ("ubuntu", "24.04") => "noble",
        ("ubuntu", "22.04") => "jammy",
        ("ubuntu", "20.04") => "focal",
        ("ubuntu", "18.04") => "bionic",
        ("debian", "10") => "buster",
        ("debian", "11") => "bullseye",
        ("debian", "12") => "bookworm",
        (_, v) => v,
    };
    (distro.to_string(), release.to_string())
}

fn template_suffix(version: &TemplateVersion) -> String {
    format!(
        "{}_{}_{}_{}",
        version.distro, version.distro_version, version.arch, version.product_version
    )
}

pub fn template_container(ns: Namespace, version: &TemplateVersion) -> String {
    format!("{}{}", ns.lxc_template_prefix(), template_suffix(version))
}

fn bake_container(ns: Namespace, version: &TemplateVersion) -> String {
    format!("{}{}", ns.lxc_bake_prefix(), template_suffix(version))
}

fn parse_template_name(ns: Namespace, name: &str) -> Option<TemplateVersion> {
    let rest = name.strip_prefix(ns.lxc_template_prefix())?;
    let parts: Vec<&str> = rest.split('_').collect();
    match parts.as_slice() {
        [distro, version, arch, product] => Some(TemplateVersion::new(
            *distro,
            *version,
            *product,
            Arch::parse(arch)?,
        )),
        _ => None,
    }
}

/// cgroup v2 settings for the container limits
fn cgroup_limits(extra: &DeployExtra) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    if let Some(cpus) = &extra.cpu_limit {
        let cpus: f64 = cpus
            .trim()
            .parse()
            .ok()
            .filter(|c: &f64| *c > 0.0)
            .ok_or_else(|| Error::invalid(format!("cpu limit '{}' is not a positive number", cpus)))?;
        lines.push(format!(
            "lxc.cgroup2.cpu.max = {} 100000",
            (cpus * 100_000.0).round() as u64
        ));
    }
    if let Some(ram) = &extra.ram_limit {
        lines.push(format!("lxc.cgroup2.memory.max = {}", ram.to_uppercase()));
    }
    if let Some(swap) = &extra.swap_limit {
        lines.push(format!("lxc.cgroup2.memory.swap.max = {}", swap.to_uppercase()));
    }
    Ok(lines)
}

async fn lxc(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
) -> Result<CommandOutput> {
    debug!(program, args = %args.join(" "), "lxc");
    runner
        .run(program, args, stdin)
        .await?
        .check(program, &args.join(" "))
}

/// Write each file through `lxc-attach`, creating parent directories
async fn push_files(runner: &dyn CommandRunner, container: &str, files: &[FileEntry]) -> Result<()> {
    for file in files {
        let mut script = String::new();
        if let Some(dir) = Path::new(&file.path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            script.push_str(&format!("mkdir -p {} && ", shell_quote(&dir.to_string_lossy())));
        }
        script.push_str(&format!("cat > {}", shell_quote(&file.path)));

        let args = argv(&["-n", container, "--", "/bin/sh", "-c", &script]);
        lxc(runner, "lxc-attach", &args, Some(&file.contents))
            .await
            .map_err(|e| Error::transfer(container, e.to_string()))?;
    }
    Ok(())
}

pub struct LxcBackend {
    runner: Arc<dyn CommandRunner>,
    settings: LxcConfig,
    arch: Arch,
    address_attempts: u32,
    address_interval: Duration,
    parallelism: usize,
}

impl LxcBackend {
    /// Check the tools are installed and learn the host architecture
    pub async fn connect(runner: Arc<dyn CommandRunner>, config: &EngineConfig) -> Result<Self> {
        let version = runner.run("lxc-ls", &argv(&["--version"]), None).await?;
        if !version.success() {
            return Err(Error::config(format!(
                "lxc tools are not usable: {}",
                String::from_utf8_lossy(&version.combined()).trim()
            )));
        }

        let arch = match config.lxc.arch {
            Some(arch) => arch,
            None => {
                let uname = lxc(runner.as_ref(), "uname", &argv(&["-m"]), None).await?;
                Arch::parse(&uname.stdout_str()).unwrap_or(Arch::Amd64)
            }
        };
        info!(version = %version.stdout_str().trim(), arch = %arch, "connected to lxc");
        Ok(Self::new(runner, config, arch))
    }

    pub fn new(runner: Arc<dyn CommandRunner>, config: &EngineConfig, arch: Arch) -> Self {
        Self {
            runner,
            settings: config.lxc.clone(),
            arch,
            address_attempts: config.timing.address_wait_attempts.max(1),
            address_interval: config.timing.ssh_poll_interval(),
            parallelism: config.parallelism,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        lxc(self.runner.as_ref(), program, args, None).await
    }

    async fn listing(&self) -> Result<Vec<LxcEntry>> {
        let out = self
            .run("lxc-ls", &argv(&["-f", "-F", "NAME,STATE,IPV4"]))
            .await
            .map_err(|e| Error::discovery(e.to_string()))?;
        Ok(parse_listing(&out.stdout_str()))
    }

    /// Addresses of the cluster's nodes that have one
    async fn addresses(&self, ns: Namespace, name: &str) -> Result<BTreeMap<u32, String>> {
        let mut ips = BTreeMap::new();
        for entry in self.listing().await? {
            if let Some(node) = node_in_cluster(ns.lxc_prefix(), name, &entry.name)? {
                if let Some(ip) = entry.ipv4 {
                    ips.insert(node, ip);
                }
            }
        }
        Ok(ips)
    }

    fn address_budget_secs(&self) -> u64 {
        (self.address_interval * self.address_attempts).as_secs()
    }

    /// Wait until every listed node has been handed an address
    async fn wait_for_addresses(
        &self,
        ns: Namespace,
        name: &str,
        nodes: &[u32],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let this = self;
        let found = poll_attempts(
            self.address_attempts,
            self.address_interval,
            cancel,
            &format!("address wait for cluster {}", name),
            move || async move {
                let ips = this.addresses(ns, name).await?;
                Ok(nodes.iter().all(|n| ips.contains_key(n)).then_some(()))
            },
        )
        .await?;
        if found.is_some() {
            return Ok(());
        }

        let ips = self.addresses(ns, name).await?;
        let (ready, not_ready): (Vec<u32>, Vec<u32>) =
            nodes.iter().copied().partition(|n| ips.contains_key(n));
        Err(Error::BootstrapTimeout {
            cluster: name.to_string(),
            ready,
            not_ready,
            budget_secs: self.address_budget_secs(),
        })
    }

    async fn wait_for_bake_address(&self, container: &str, cancel: &CancellationToken) -> Result<()> {
        let this = self;
        let found = poll_attempts(
            self.address_attempts,
            self.address_interval,
            cancel,
            &format!("address wait for {}", container),
            move || async move {
                let listing = this.listing().await?;
                Ok(listing
                    .into_iter()
                    .find(|e| e.name == container && e.ipv4.is_some())
                    .map(|_| ()))
            },
        )
        .await?;
        found.ok_or_else(|| {
            Error::Exec {
                target: container.to_string(),
                command: "lxc-start".to_string(),
                exit: ExitKind::Transport,
                output: format!("no address after {}s", self.address_budget_secs()),
            }
        })
    }

    fn with_backing_store(&self, mut args: Vec<String>) -> Vec<String> {
        if let Some(store) = &self.settings.backing_store {
            args.push("-B".to_string());
            args.push(store.clone());
        }
        args
    }

    fn config_path(&self, container: &str) -> PathBuf {
        self.settings.lxc_path.join(container).join("config")
    }

    /// Clone one node from the template, apply limits and boot it
    async fn create_node(&self, template: &str, container: &str, limits: &[String]) -> Result<()> {
        let args = self.with_backing_store(argv(&["-n", template, "-N", container]));
        self.run("lxc-copy", &args).await?;

        if !limits.is_empty() {
            let config = self.config_path(container);
            let body = format!("{}\n", limits.join("\n"));
            lxc(
                self.runner.as_ref(),
                "tee",
                &argv(&["-a", &config.to_string_lossy()]),
                Some(body.as_bytes()),
            )
            .await?;
        }

        self.run("lxc-start", &argv(&["-n", container])).await?;
        Ok(())
    }

    async fn each_node(
        &self,
        ns: Namespace,
        name: &str,
        numbers: &[u32],
        operation: &'static str,
        program: &'static str,
        flags: &[&str],
    ) -> Result<()> {
        info!(cluster = name, namespace = %ns, nodes = ?numbers, operation, "lxc node operation");

        let results = fan_out(numbers, self.parallelism, |node| {
            let runner = Arc::clone(&self.runner);
            let mut args = argv(flags);
            args.push("-n".to_string());
            args.push(node_name(ns.lxc_prefix(), name, node));
            async move { lxc(runner.as_ref(), program, &args, None).await.map(|_| ()) }
        })
        .await;
        collect(name, operation, results).map(|_| ())
    }

    async fn bake(
        &self,
        container: &str,
        template: &str,
        version: &TemplateVersion,
        script: &[u8],
        files: &[FileEntry],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (distro, release) = download_image(version);
        let mut args = self.with_backing_store(argv(&["-t", "download", "-n", container]));
        args.extend(argv(&["--", "-d", &distro, "-r", &release, "-a", version.arch.as_str()]));
        if let Some(server) = &self.settings.download_server {
            args.push("--server".to_string());
            args.push(server.clone());
        }
        self.run("lxc-create", &args).await?;

        self.run("lxc-start", &argv(&["-n", container])).await?;
        self.wait_for_bake_address(container, cancel).await?;

        push_files(self.runner.as_ref(), container, &bake_files(script, files)).await?;
        for command in installer_commands() {
            let mut args = argv(&["-n", container, "--"]);
            args.extend(command);
            self.run("lxc-attach", &args).await?;
        }

        self.run("lxc-stop", &argv(&["-n", container])).await?;
        // The rename makes the template visible only once it is complete
        self.run("lxc-copy", &argv(&["-R", "-n", container, "-N", template]))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for LxcBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lxc
    }

    async fn cluster_list(&self, ns: Namespace) -> Result<Vec<String>> {
        let listing = self.listing().await?;
        Ok(distinct_clusters(
            listing
                .iter()
                .filter_map(|e| split_node_name(ns.lxc_prefix(), &e.name))
                .map(|(cluster, _)| cluster),
        ))
    }

    async fn node_list_in_cluster(&self, ns: Namespace, name: &str) -> Result<Vec<u32>> {
        let mut nodes = Vec::new();
        for entry in self.listing().await? {
            if let Some(node) = node_in_cluster(ns.lxc_prefix(), name, &entry.name)? {
                nodes.push(node);
            }
        }
        nodes.sort_unstable();
        Ok(nodes)
    }

    /// Containers share the host kernel, so every node runs the host arch
    async fn node_arch(&self, ns: Namespace, name: &str, node: u32) -> Result<Arch> {
        resolve_nodes(self, ns, name, Some(&[node])).await?;
        Ok(self.arch)
    }

    async fn get_node_ip_map(
        &self,
        ns: Namespace,
        name: &str,
        internal: bool,
    ) -> Result<BTreeMap<u32, String>> {
        if internal {
            return Ok(BTreeMap::new());
        }
        self.addresses(ns, name).await
    }

    async fn deploy_cluster(
        &self,
        ns: Namespace,
        version: &TemplateVersion,
        name: &str,
        count: u32,
        extra: &DeployExtra,
        cancel: &CancellationToken,
    ) -> Result<Vec<u32>> {
        validate_cluster_name(name)?;
        version.validate()?;
        if count == 0 {
            return Err(Error::invalid("node count must be at least 1"));
        }
        let limits = cgroup_limits(extra)?;
        if !extra.exposed_ports.is_empty() {
            warn!(cluster = name, "lxc does not expose ports; add a PREROUTING rule on the host instead");
        }
        if !self.list_templates(ns).await?.contains(version) {
            return Err(Error::not_found(format!("template {}", version)));
        }

        let existing = self.node_list_in_cluster(ns, name).await?;
        let numbers = allocate_node_numbers(&existing, count)?;
        let template = template_container(ns, version);
        info!(cluster = name, namespace = %ns, nodes = ?numbers, template = %template, "cloning containers");

        let mut created = Vec::with_capacity(numbers.len());
        for &node in &numbers {
            let container = node_name(ns.lxc_prefix(), name, node);
            let launched = if cancel.is_cancelled() {
                Err(Error::Cancelled(format!("deploy of cluster {}", name)))
            } else {
                self.create_node(&template, &container, &limits).await
            };
            if let Err(e) = launched {
                return Err(Error::ClusterGrowth {
                    cluster: name.to_string(),
                    created,
                    failed_node: node,
                    source: Box::new(e),
                });
            }
            created.push(node);
        }

        self.wait_for_addresses(ns, name, &numbers, cancel).await?;
        Ok(numbers)
    }

    async fn cluster_start(&self, ns: Namespace, name: &str, nodes: Option<&[u32]>) -> Result<()> {
        let numbers = resolve_nodes(self, ns, name, nodes).await?;
        let mut stopped = Vec::with_capacity(numbers.len());
        for entry in self.listing().await? {
            if let Some(node) = node_in_cluster(ns.lxc_prefix(), name, &entry.name)? {
                if !entry.running && numbers.contains(&node) {
                    stopped.push(node);
                }
            }
        }
        stopped.sort_unstable();

        self.each_node(ns, name, &stopped, "start", "lxc-start", &[])
            .await?;
        self.wait_for_addresses(ns, name, &numbers, &CancellationToken::new())
            .await
    }

    async fn cluster_stop(&self, ns: Namespace, name: &str, nodes: Option<&[u32]>) -> Result<()> {
        let numbers = resolve_nodes(self, ns, name, nodes).await?;
        self.each_node(ns, name, &numbers, "stop", "lxc-stop", &[])
            .await
    }

    async fn cluster_destroy(
        &self,
        ns: Namespace,
        name: &str,
        nodes: Option<&[u32]>,
    ) -> Result<()> {
        let numbers = resolve_nodes(self, ns, name, nodes).await?;
        self.each_node(ns, name, &numbers, "destroy", "lxc-destroy", &["-f"])
            .await
    }

    async fn run_commands(
        &self,
        ns: Namespace,
        name: &str,
        commands: &[Vec<String>],
        nodes: Option<&[u32]>,
    ) -> Result<Vec<NodeOutput>> {
        let numbers = resolve_nodes(self, ns, name, nodes).await?;
        let commands: Arc<Vec<Vec<String>>> = Arc::new(commands.to_vec());

        let results = fan_out(&numbers, self.parallelism, |node| {
            let runner = Arc::clone(&self.runner);
            let container = node_name(ns.lxc_prefix(), name, node);
            let commands = Arc::clone(&commands);
            async move {
                let mut outputs = Vec::with_capacity(commands.len());
                for command in commands.iter() {
                    let mut args = argv(&["-n", &container, "-v", &format!("NODE={}", node), "--"]);
                    args.extend(command.iter().cloned());
                    let out = lxc(runner.as_ref(), "lxc-attach", &args, None).await?;
                    outputs.push(out.combined());
                }
                Ok(NodeOutput { node, outputs })
            }
        })
        .await;

        collect_outputs(name, results)
    }

    async fn copy_files_to_cluster(
        &self,
        ns: Namespace,
        name: &str,
        files: &[FileEntry],
        nodes: Option<&[u32]>,
    ) -> Result<()> {
        let numbers = resolve_nodes(self, ns, name, nodes).await?;
        let files: Arc<Vec<FileEntry>> = Arc::new(files.to_vec());

        let results = fan_out(&numbers, self.parallelism, |node| {
            let runner = Arc::clone(&self.runner);
            let container = node_name(ns.lxc_prefix(), name, node);
            let files = Arc::clone(&files);
            async move { push_files(runner.as_ref(), &container, &files).await }
        })
        .await;
        collect(name, "copy", results).map(|_| ())
    }

    async fn list_templates(&self, ns: Namespace) -> Result<Vec<TemplateVersion>> {
        let mut versions: Vec<TemplateVersion> = self
            .listing()
            .await?
            .iter()
            .filter_map(|e| parse_template_name(ns, &e.name))
            .collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    async fn deploy_template(
        &self,
        ns: Namespace,
        version: &TemplateVersion,
        script: &[u8],
        files: &[FileEntry],
        _extra: &DeployExtra,
        cancel: &CancellationToken,
    ) -> Result<()> {
        version.validate()?;
        if self.list_templates(ns).await?.contains(version) {
            return Err(Error::AlreadyExists(format!("template {}", version)));
        }

        let container = bake_container(ns, version);
        let template = template_container(ns, version);
        run_bake(
            version,
            cancel,
            self.bake(&container, &template, version, script, files, cancel),
            async {
                self.run("lxc-destroy", &argv(&["-f", "-n", &container]))
                    .await
                    .map(|_| ())
            },
        )
        .await
    }

    async fn template_destroy(&self, ns: Namespace, version: &TemplateVersion) -> Result<()> {
        let template = template_container(ns, version);
        if !self.listing().await?.iter().any(|e| e.name == template) {
            return Err(Error::not_found(format!("template {}", version)));
        }
        self.run("lxc-destroy", &argv(&["-f", "-n", &template]))
            .await?;
        info!(template = %version, container = %template, "template destroyed");
        Ok(())
    }

    async fn vacuum_templates(&self, ns: Namespace) -> Result<()> {
        let mut failures = Vec::new();
        for entry in self.listing().await? {
            if !entry.name.starts_with(ns.lxc_bake_prefix()) {
                continue;
            }
            info!(container = %entry.name, "removing leftover bake container");
            if let Err(e) = self.run("lxc-destroy", &argv(&["-f", "-n", &entry.name])).await {
                failures.push((entry.name, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::MultiCluster {
                operation: "vacuum".to_string(),
                failures,
            })
        }
    }

    async fn run_custom_out(
        &self,
        ns: Namespace,
        name: &str,
        node: u32,
        command: &[String],
        streams: ExecStreams,
        _interactive: bool,
    ) -> Result<()> {
        resolve_nodes(self, ns, name, Some(&[node])).await?;
        let container = node_name(ns.lxc_prefix(), name, node);
        let mut args = argv(&["-n", &container, "-v", &format!("NODE={}", node), "--"]);
        if command.is_empty() {
            args.push("/bin/bash".to_string());
        } else {
            args.extend(command.iter().cloned());
        }

        match self.runner.run_attached("lxc-attach", &args, streams).await? {
            Some(0) => Ok(()),
            status => Err(Error::Exec {
                target: container,
                command: shell_join(command),
                exit: status.map(ExitKind::Code).unwrap_or(ExitKind::Signal),
                output: String::new(),
            }),
        }
    }

    async fn get_key_path(&self, _ns: Namespace, _name: &str) -> Result<PathBuf> {
        Err(Error::NotSupported {
            backend: "lxc",
            operation: "ssh keys",
        })
    }
}
