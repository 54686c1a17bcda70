// Docker Backend
//
// Nodes are containers named `<prefix><cluster>_<node>`. Templates are
// committed images named `<prefix><distro>_<version>_<arch>:<product>`.
// Everything goes through the `docker` command line client.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{
    resolve_nodes, Arch, Backend, DeployExtra, FileEntry, NodeOutput, TemplateVersion,
};
use crate::bake::{bake_files, installer_commands, parse_extra_tags, run_bake};
use crate::config::{BackendKind, EngineConfig};
use crate::discovery::{
    allocate_node_numbers, distinct_clusters, node_in_cluster, node_name, split_node_name,
    validate_cluster_name,
};
use crate::error::{Error, ExitKind, Result};
use crate::exec::{shell_join, CommandOutput, CommandRunner, ExecStreams};
use crate::fanout::{collect, collect_outputs, fan_out};
use crate::namespace::Namespace;

/// Keeps a node container alive until `/tmp/poweroff.now` appears
const KEEPALIVE: &str =
    "while true; do [ -f /tmp/poweroff.now ] && rm -f /tmp/poweroff.now && exit; sleep 1; done";

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// `docker ... --format {{json .X}}` lines come back quoted
fn clean_line(line: &str) -> &str {
    line.trim().trim_matches(|c| c == '"' || c == '\'')
}

fn arch_from_info(info: &str) -> Option<Arch> {
    info.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("Architecture:"))
        .map(|arch| {
            let arch = arch.trim();
            Arch::from_is_arm(arch.contains("arm") || arch.contains("aarch"))
        })
}

/// Distros without a usable container image are mapped onto one that has it
fn real_version(version: &TemplateVersion) -> Result<TemplateVersion> {
    match version.distro.as_str() {
        "ubuntu" | "centos" | "debian" => Ok(version.clone()),
        "amazon" => Ok(TemplateVersion::new(
            "centos",
            "7",
            version.product_version.clone(),
            version.arch,
        )),
        other => Err(Error::invalid(format!(
            "distro '{}' is not supported on docker",
            other
        ))),
    }
}

fn base_image(version: &TemplateVersion) -> String {
    let repo_arch = match version.arch {
        Arch::Amd64 => "amd64",
        Arch::Arm64 => "arm64v8",
    };
    match (version.distro.as_str(), version.distro_version.as_str()) {
        ("centos", v @ ("6" | "7")) => format!("quay.io/centos/centos:{}", v),
        ("centos", v) => format!("quay.io/centos/{}:stream{}", repo_arch, v),
        (distro, v) => format!("{}/{}:{}", repo_arch, distro, v),
    }
}

/// Image reference of a baked template
pub fn template_image(ns: Namespace, version: &TemplateVersion) -> String {
    format!(
        "{}{}_{}_{}:{}",
        ns.docker_prefix(),
        version.distro,
        version.distro_version,
        version.arch,
        version.product_version
    )
}

fn bake_container(ns: Namespace, version: &TemplateVersion) -> String {
    format!(
        "{}{}-{}-{}-{}",
        ns.docker_bake_prefix(),
        version.distro,
        version.distro_version,
        version.product_version,
        version.arch
    )
}

/// Parse one `"<repository>";<tag>` image listing line
/// Arch encoded in a template image reference such as
/// `aerolab-ubuntu_22.04_arm64:7.0`
fn image_arch(image: &str) -> Option<Arch> {
    let repo = image.rsplit_once(':').map_or(image, |(repo, _)| repo);
    let repo = repo.rsplit('/').next().unwrap_or(repo);
    Arch::parse(repo.rsplit('_').next()?)
}

fn parse_template_line(ns: Namespace, line: &str) -> Option<TemplateVersion> {
    let (repo, tag) = line.split_once(';')?;
    let repo = clean_line(repo);
    let repo = repo.strip_prefix("localhost/").unwrap_or(repo);
    let rest = repo.strip_prefix(ns.docker_prefix())?;
    let tag = clean_line(tag);
    if tag.is_empty() || tag == "<none>" {
        return None;
    }

    let mut parts = rest.split('_');
    let (distro, version, arch) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    Some(TemplateVersion::new(distro, version, tag, Arch::parse(arch)?))
}

async fn docker(runner: &dyn CommandRunner, binary: &str, args: &[String]) -> Result<CommandOutput> {
    debug!(args = %args.join(" "), "docker");
    runner
        .run(binary, args, None)
        .await?
        .check("docker", &args.join(" "))
}

/// A file written to the scratch directory, waiting for `docker cp`
#[derive(Debug, Clone)]
struct StagedFile {
    local: PathBuf,
    remote: String,
}

fn unstage(staged: &[StagedFile]) {
    for file in staged {
        if let Err(e) = fs::remove_file(&file.local) {
            warn!(path = %file.local.display(), error = %e, "could not remove staged file");
        }
    }
}

async fn push_files(
    runner: &dyn CommandRunner,
    binary: &str,
    container: &str,
    staged: &[StagedFile],
) -> Result<()> {
    for file in staged {
        let parent = Path::new(&file.remote)
            .parent()
            .filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = parent {
            let dir = dir.to_string_lossy();
            docker(runner, binary, &argv(&["exec", container, "mkdir", "-p", &dir]))
                .await
                .map_err(|e| Error::transfer(container, e.to_string()))?;
        }
        let local = file.local.to_string_lossy();
        let dest = format!("{}:{}", container, file.remote);
        docker(runner, binary, &argv(&["cp", &local, &dest]))
            .await
            .map_err(|e| Error::transfer(container, e.to_string()))?;
    }
    Ok(())
}

pub struct DockerBackend {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    arch: Arch,
    scratch_dir: PathBuf,
    parallelism: usize,
}

impl DockerBackend {
    /// Check the daemon answers and learn its architecture
    pub async fn connect(runner: Arc<dyn CommandRunner>, config: &EngineConfig) -> Result<Self> {
        let info = runner
            .run(&config.docker.binary, &argv(&["info"]), None)
            .await?;
        if !info.success() {
            return Err(Error::config(format!(
                "docker appears to be unreachable or down: {}",
                String::from_utf8_lossy(&info.combined()).trim()
            )));
        }
        let arch = config
            .docker
            .arch
            .or_else(|| arch_from_info(&info.stdout_str()))
            .unwrap_or(Arch::Amd64);
        info!(arch = %arch, "connected to docker");
        Ok(Self::new(runner, config, arch))
    }

    pub fn new(runner: Arc<dyn CommandRunner>, config: &EngineConfig, arch: Arch) -> Self {
        Self {
            runner,
            binary: config.docker.binary.clone(),
            arch,
            scratch_dir: config.scratch_dir(),
            parallelism: config.parallelism,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    async fn cmd(&self, args: &[String]) -> Result<CommandOutput> {
        docker(self.runner.as_ref(), &self.binary, args).await
    }

    /// Every container, stopped ones included
    async fn container_names(&self) -> Result<Vec<String>> {
        let out = self
            .cmd(&argv(&["container", "list", "-a", "--format", "{{json .Names}}"]))
            .await
            .map_err(|e| Error::discovery(e.to_string()))?;
        Ok(out
            .stdout_str()
            .lines()
            .map(clean_line)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn stage(&self, files: &[FileEntry]) -> Result<Vec<StagedFile>> {
        fs::create_dir_all(&self.scratch_dir)?;
        let mut staged = Vec::with_capacity(files.len());
        for file in files {
            let local = self
                .scratch_dir
                .join(format!("clusterlab-{}", Uuid::new_v4().simple()));
            if let Err(e) = fs::write(&local, &file.contents) {
                unstage(&staged);
                return Err(e.into());
            }
            staged.push(StagedFile {
                local,
                remote: file.path.clone(),
            });
        }
        Ok(staged)
    }

    fn run_args(
        &self,
        container: &str,
        image: &str,
        node: u32,
        extra: &DeployExtra,
        labels: &[(String, String)],
    ) -> Vec<String> {
        let mut args = argv(&["run"]);
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(hostname) = &extra.hostname {
            args.push("--hostname".to_string());
            args.push(format!("{}-{}", hostname, node));
        }
        for port in &extra.exposed_ports {
            args.push("-p".to_string());
            args.push(port.clone());
        }
        if let Some(cpus) = &extra.cpu_limit {
            args.push(format!("--cpus={}", cpus));
        }
        if let Some(ram) = &extra.ram_limit {
            args.push("-m".to_string());
            args.push(ram.clone());
        }
        if let Some(swap) = &extra.swap_limit {
            args.push("--memory-swap".to_string());
            args.push(swap.clone());
        }
        if let Some(network) = &extra.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if extra.privileged {
            warn!(container, "starting privileged container");
            args.extend(argv(&["--device-cgroup-rule=b 7:* rmw", "--privileged=true"]));
        }
        args.extend(argv(&[
            "--cap-add=NET_ADMIN",
            "--cap-add=NET_RAW",
            "-td",
            "--name",
            container,
            image,
            "/bin/bash",
            "-c",
            KEEPALIVE,
        ]));
        args
    }

    /// Run one docker verb against each selected node container
    async fn each_node(
        &self,
        ns: Namespace,
        name: &str,
        nodes: Option<&[u32]>,
        operation: &'static str,
        verb: &[&str],
    ) -> Result<()> {
        let numbers = resolve_nodes(self, ns, name, nodes).await?;
        info!(cluster = name, namespace = %ns, nodes = ?numbers, operation, "docker node operation");

        let results = fan_out(&numbers, self.parallelism, |node| {
            let runner = Arc::clone(&self.runner);
            let binary = self.binary.clone();
            let mut args = argv(verb);
            args.push(node_name(ns.docker_prefix(), name, node));
            async move { docker(runner.as_ref(), &binary, &args).await.map(|_| ()) }
        })
        .await;
        collect(name, operation, results).map(|_| ())
    }

    async fn bake(
        &self,
        container: &str,
        image: &str,
        version: &TemplateVersion,
        script: &[u8],
        files: &[FileEntry],
        labels: &[(String, String)],
    ) -> Result<()> {
        self.cmd(&argv(&["run", "-td", "--name", container, &base_image(version)]))
            .await?;

        let staged = self.stage(&bake_files(script, files))?;
        let pushed = push_files(self.runner.as_ref(), &self.binary, container, &staged).await;
        unstage(&staged);
        pushed?;

        for command in installer_commands() {
            let mut args = argv(&["exec", container]);
            args.extend(command);
            self.cmd(&args).await?;
        }

        self.cmd(&argv(&["stop", container])).await?;
        let mut commit = argv(&["container", "commit"]);
        for (key, value) in labels {
            commit.push("--change".to_string());
            commit.push(format!("LABEL {}={}", key, value));
        }
        commit.push(container.to_string());
        commit.push(image.to_string());
        self.cmd(&commit).await?;
        self.cmd(&argv(&["rm", container])).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn cluster_list(&self, ns: Namespace) -> Result<Vec<String>> {
        let names = self.container_names().await?;
        Ok(distinct_clusters(
            names
                .iter()
                .filter_map(|n| split_node_name(ns.docker_prefix(), n))
                .map(|(cluster, _)| cluster),
        ))
    }

    async fn node_list_in_cluster(&self, ns: Namespace, name: &str) -> Result<Vec<u32>> {
        let mut nodes = Vec::new();
        for container in self.container_names().await? {
            if let Some(node) = node_in_cluster(ns.docker_prefix(), name, &container)? {
                nodes.push(node);
            }
        }
        nodes.sort_unstable();
        Ok(nodes)
    }

    async fn node_arch(&self, ns: Namespace, name: &str, node: u32) -> Result<Arch> {
        resolve_nodes(self, ns, name, Some(&[node])).await?;
        let container = node_name(ns.docker_prefix(), name, node);
        let out = self
            .cmd(&argv(&["container", "inspect", "--format", "{{.Config.Image}}", &container]))
            .await
            .map_err(|e| Error::discovery(e.to_string()))?;
        // Templates carry their arch in the image name; anything else runs natively
        Ok(image_arch(clean_line(&out.stdout_str())).unwrap_or(self.arch))
    }

    async fn get_node_ip_map(
        &self,
        ns: Namespace,
        name: &str,
        internal: bool,
    ) -> Result<BTreeMap<u32, String>> {
        // Containers only have the one bridge address
        if internal {
            return Ok(BTreeMap::new());
        }
        let mut ips = BTreeMap::new();
        for node in self.node_list_in_cluster(ns, name).await? {
            let container = node_name(ns.docker_prefix(), name, node);
            let out = self
                .cmd(&argv(&[
                    "container",
                    "inspect",
                    "--format",
                    "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}",
                    &container,
                ]))
                .await
                .map_err(|e| Error::discovery(e.to_string()))?;
            // Stopped containers have no address and are left out
            let ip = out
                .stdout_str()
                .split_whitespace()
                .next()
                .map(|ip| clean_line(ip).to_string())
                .filter(|ip| !ip.is_empty());
            if let Some(ip) = ip {
                ips.insert(node, ip);
            }
        }
        Ok(ips)
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
        let labels = parse_extra_tags(&extra.tags, &[])?;
        let real = real_version(version)?;
        if !self.list_templates(ns).await?.contains(&real) {
            return Err(Error::not_found(format!("template {}", real)));
        }

        let existing = self.node_list_in_cluster(ns, name).await?;
        let numbers = allocate_node_numbers(&existing, count)?;
        let image = template_image(ns, &real);
        info!(cluster = name, namespace = %ns, nodes = ?numbers, image = %image, "deploying containers");

        let mut created = Vec::with_capacity(numbers.len());
        for &node in &numbers {
            let container = node_name(ns.docker_prefix(), name, node);
            let launched = if cancel.is_cancelled() {
                Err(Error::Cancelled(format!("deploy of cluster {}", name)))
            } else {
                self.cmd(&self.run_args(&container, &image, node, extra, &labels))
                    .await
                    .map(|_| ())
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
        Ok(numbers)
    }

    async fn cluster_start(&self, ns: Namespace, name: &str, nodes: Option<&[u32]>) -> Result<()> {
        self.each_node(ns, name, nodes, "start", &["start"]).await
    }

    async fn cluster_stop(&self, ns: Namespace, name: &str, nodes: Option<&[u32]>) -> Result<()> {
        self.each_node(ns, name, nodes, "stop", &["stop", "-t", "1"])
            .await
    }

    async fn cluster_destroy(
        &self,
        ns: Namespace,
        name: &str,
        nodes: Option<&[u32]>,
    ) -> Result<()> {
        self.each_node(ns, name, nodes, "destroy", &["rm", "-f"]).await
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
            let binary = self.binary.clone();
            let container = node_name(ns.docker_prefix(), name, node);
            let commands = Arc::clone(&commands);
            async move {
                let mut outputs = Vec::with_capacity(commands.len());
                for command in commands.iter() {
                    let mut args = argv(&["exec", "-e", &format!("NODE={}", node), &container]);
                    args.extend(command.iter().cloned());
                    let out = docker(runner.as_ref(), &binary, &args).await?;
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
        let staged = Arc::new(self.stage(files)?);

        let results = fan_out(&numbers, self.parallelism, |node| {
            let runner = Arc::clone(&self.runner);
            let binary = self.binary.clone();
            let container = node_name(ns.docker_prefix(), name, node);
            let staged = Arc::clone(&staged);
            async move { push_files(runner.as_ref(), &binary, &container, &staged).await }
        })
        .await;

        unstage(&staged);
        collect(name, "copy", results).map(|_| ())
    }

    async fn list_templates(&self, ns: Namespace) -> Result<Vec<TemplateVersion>> {
        let out = self
            .cmd(&argv(&[
                "image",
                "list",
                "-a",
                "--format",
                "{{json .Repository}};{{.Tag}}",
            ]))
            .await
            .map_err(|e| Error::discovery(e.to_string()))?;
        let mut versions: Vec<TemplateVersion> = out
            .stdout_str()
            .lines()
            .filter_map(|line| parse_template_line(ns, line))
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
        extra: &DeployExtra,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let real = real_version(version)?;
        real.validate()?;
        let labels = parse_extra_tags(&extra.tags, &[])?;
        if self.list_templates(ns).await?.contains(&real) {
            return Err(Error::AlreadyExists(format!("template {}", real)));
        }

        let container = bake_container(ns, &real);
        let image = template_image(ns, &real);
        run_bake(
            &real,
            cancel,
            self.bake(&container, &image, &real, script, files, &labels),
            async { self.cmd(&argv(&["rm", "-f", &container])).await.map(|_| ()) },
        )
        .await
    }

    async fn template_destroy(&self, ns: Namespace, version: &TemplateVersion) -> Result<()> {
        let real = real_version(version)?;
        let image = template_image(ns, &real);
        let out = self
            .cmd(&argv(&[
                "image",
                "list",
                "--format",
                "{{json .ID}}",
                &format!("--filter=reference={}", image),
            ]))
            .await
            .map_err(|e| Error::discovery(e.to_string()))?;
        if out.stdout_str().lines().all(|l| clean_line(l).is_empty()) {
            return Err(Error::not_found(format!("template {}", real)));
        }
        self.cmd(&argv(&["rmi", &image])).await?;
        info!(template = %real, image = %image, "template destroyed");
        Ok(())
    }

    async fn vacuum_templates(&self, ns: Namespace) -> Result<()> {
        let leftovers: Vec<String> = self
            .container_names()
            .await?
            .into_iter()
            .filter(|n| n.starts_with(ns.docker_bake_prefix()))
            .collect();

        let mut failures = Vec::new();
        for container in &leftovers {
            info!(container = %container, "removing leftover bake container");
            if let Err(e) = self.cmd(&argv(&["rm", "-f", container])).await {
                failures.push((container.clone(), e));
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
        interactive: bool,
    ) -> Result<()> {
        resolve_nodes(self, ns, name, Some(&[node])).await?;
        let container = node_name(ns.docker_prefix(), name, node);
        let mut args = argv(&[
            "exec",
            "-e",
            &format!("NODE={}", node),
            if interactive { "-ti" } else { "-t" },
            &container,
        ]);
        if command.is_empty() {
            args.push("/bin/bash".to_string());
        } else {
            args.extend(command.iter().cloned());
        }

        match self.runner.run_attached(&self.binary, &args, streams).await? {
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
            backend: "docker",
            operation: "ssh keys",
        })
    }
}
