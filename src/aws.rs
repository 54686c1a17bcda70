// Cloud Backend
//
// Clusters are tagged compute instances and templates are machine images
// carrying the identity tags. Nodes are reached over SSH: first as the base
// image's login user, then as root once the post-boot fix has run.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{Arch, Backend, DeployExtra, FileEntry, NodeOutput, TemplateVersion};
use crate::bake::{bake_files, installer_commands, parse_extra_tags, run_bake};
use crate::bootstrap::{poll_attempts, transition, BootstrapState, Bootstrapper, SshWaitTarget};
use crate::config::{AwsConfig, BackendKind, EngineConfig, TimingConfig};
use crate::discovery::{
    allocate_node_numbers, decode_node_number, distinct_clusters, validate_cluster_name,
    ADDRESS_NOT_ASSIGNED,
};
use crate::ec2::{
    base_image_user, find_base_image, Ec2Api, Filter, Image, Instance, RunInstanceRequest,
    WaitState,
};
use crate::error::{Error, ExitKind, Result};
use crate::exec::{shell_join, ExecStreams, RemoteExec, SshTarget};
use crate::fanout::{collect, collect_outputs, fan_out};
use crate::keys::KeyManager;
use crate::namespace::{Namespace, ARCH_TAG, NAME_TAG, USED_BY_TAG};
use crate::retry::{retry_when, RetryPolicy};

/// Everything a single bake needs besides the payload
struct BakeJob<'a> {
    ns: Namespace,
    version: &'a TemplateVersion,
    build: &'a str,
    key_cluster: &'a str,
    base_image: &'a str,
    extra: &'a DeployExtra,
    extra_tags: &'a [(String, String)],
}

pub struct AwsBackend {
    api: Arc<dyn Ec2Api>,
    remote: Arc<dyn RemoteExec>,
    keys: KeyManager,
    bootstrap: Arc<Bootstrapper>,
    settings: AwsConfig,
    timing: TimingConfig,
    retry: RetryPolicy,
    parallelism: usize,
}

/// Instance lifecycle transitions applied to whole nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateChange {
    Start,
    Stop,
    Destroy,
}

impl StateChange {
    fn as_str(self) -> &'static str {
        match self {
            StateChange::Start => "start",
            StateChange::Stop => "stop",
            StateChange::Destroy => "destroy",
        }
    }

    /// State the instances settle in once the change is done
    fn settled(self) -> WaitState {
        match self {
            StateChange::Start => WaitState::Running,
            StateChange::Stop => WaitState::Stopped,
            StateChange::Destroy => WaitState::Terminated,
        }
    }
}

fn no_address(node: u32) -> Error {
    Error::Exec {
        target: format!("node {}", node),
        command: "ssh".to_string(),
        exit: ExitKind::Transport,
        output: "no address assigned".to_string(),
    }
}

/// Tags that identify a template image
fn identity_tags(ns: Namespace, version: &TemplateVersion) -> Vec<(String, String)> {
    let tags = ns.tags();
    vec![
        (USED_BY_TAG.to_string(), tags.used_by_value.to_string()),
        (tags.operating_system.to_string(), version.distro.clone()),
        (tags.os_version.to_string(), version.distro_version.clone()),
        (tags.product_version.to_string(), version.product_version.clone()),
        (ARCH_TAG.to_string(), version.arch.tag_value().to_string()),
    ]
}

fn template_of(ns: Namespace, image: &Image) -> Option<TemplateVersion> {
    let tags = ns.tags();
    Some(TemplateVersion::new(
        image.tag(tags.operating_system)?,
        image.tag(tags.os_version)?,
        image.tag(tags.product_version)?,
        Arch::parse(image.tag(ARCH_TAG)?)?,
    ))
}

/// Prefix shared by every image name a bake produces in `ns`
fn image_name_prefix(ns: Namespace) -> String {
    format!("{}-template-", ns.tags().used_by_value)
}

fn image_name(ns: Namespace, version: &TemplateVersion, build: &str) -> String {
    format!(
        "{}{}_{}_{}_{}-{}",
        image_name_prefix(ns),
        version.distro,
        version.distro_version,
        version.product_version,
        version.arch,
        build
    )
}

impl AwsBackend {
    pub fn new(api: Arc<dyn Ec2Api>, remote: Arc<dyn RemoteExec>, config: &EngineConfig) -> Self {
        let bootstrap =
            Bootstrapper::new(Arc::clone(&remote), &config.timing).with_parallelism(config.parallelism);
        Self {
            keys: KeyManager::new(Arc::clone(&api), config.ssh_key_dir.clone(), &config.region),
            api,
            remote,
            bootstrap: Arc::new(bootstrap),
            settings: config.aws.clone(),
            timing: config.timing.clone(),
            retry: RetryPolicy::from_timing(&config.timing),
            parallelism: config.parallelism,
        }
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let api = self.api.as_ref();
        retry_when(&self.retry, what, move |e| api.is_retryable(e), operation).await
    }

    /// Live (non-terminated) instances matching `filters`
    async fn describe(&self, filters: &[Filter]) -> Result<Vec<Instance>> {
        let api = self.api.as_ref();
        let found = self
            .with_retry("describe-instances", move || api.describe_instances(filters))
            .await?;
        Ok(found.into_iter().filter(|i| !i.is_terminated()).collect())
    }

    async fn cluster_instances(&self, ns: Namespace, name: &str) -> Result<BTreeMap<u32, Instance>> {
        let tags = ns.tags();
        let found = self
            .describe(&[
                Filter::tag(USED_BY_TAG, tags.used_by_value),
                Filter::tag(tags.cluster_name, name),
            ])
            .await?;

        let mut nodes = BTreeMap::new();
        for instance in found {
            let raw = instance.tag(tags.node_number).ok_or_else(|| {
                Error::corrupt(
                    &instance.instance_id,
                    format!("tag {} is missing", tags.node_number),
                )
            })?;
            let node = decode_node_number(&instance.instance_id, raw)?;
            nodes.insert(node, instance);
        }
        Ok(nodes)
    }

    /// Instances for the requested nodes, or every node when `nodes` is None
    async fn select(
        &self,
        ns: Namespace,
        name: &str,
        nodes: Option<&[u32]>,
    ) -> Result<Vec<(u32, Instance)>> {
        let mut all = self.cluster_instances(ns, name).await?;
        if all.is_empty() {
            return Err(Error::not_found(format!("cluster {}", name)));
        }
        let requested = match nodes {
            None => return Ok(all.into_iter().collect()),
            Some(requested) => requested,
        };

        let mut wanted = requested.to_vec();
        wanted.sort_unstable();
        wanted.dedup();
        wanted
            .into_iter()
            .map(|node| {
                all.remove(&node)
                    .map(|instance| (node, instance))
                    .ok_or_else(|| Error::not_found(format!("node {} in cluster {}", node, name)))
            })
            .collect()
    }

    fn address_of(&self, instance: &Instance) -> Option<String> {
        if self.settings.public_ip {
            instance.public_ip.clone()
        } else {
            instance.private_ip.clone()
        }
    }

    fn address_attempts(&self) -> u32 {
        let budget = self.timing.ssh_budget().as_millis();
        let step = self.timing.address_poll_interval().as_millis().max(1);
        (budget / step).clamp(1, u32::MAX as u128) as u32
    }

    fn security_groups(&self, extra: &DeployExtra) -> Vec<String> {
        if !extra.security_group_ids.is_empty() {
            return extra.security_group_ids.clone();
        }
        if self.settings.security_group_id.is_empty() {
            Vec::new()
        } else {
            vec![self.settings.security_group_id.clone()]
        }
    }

    fn subnet(&self, extra: &DeployExtra) -> Option<String> {
        extra.subnet_id.clone().or_else(|| {
            (!self.settings.subnet_id.is_empty()).then(|| self.settings.subnet_id.clone())
        })
    }

    fn login_user<'a>(&'a self, version: &TemplateVersion) -> &'a str {
        self.settings
            .login_user
            .as_deref()
            .unwrap_or_else(|| base_image_user(version))
    }

    fn instance_type(&self, extra: &DeployExtra, arch: Arch, template: bool) -> String {
        if let Some(t) = &extra.instance_type {
            return t.clone();
        }
        match (arch, template) {
            (Arch::Arm64, _) => self.settings.arm_instance_type.clone(),
            (Arch::Amd64, true) => self.settings.template_instance_type.clone(),
            (Arch::Amd64, false) => self.settings.instance_type.clone(),
        }
    }

    async fn find_template(&self, ns: Namespace, version: &TemplateVersion) -> Result<Option<Image>> {
        let filters: Vec<Filter> = identity_tags(ns, version)
            .iter()
            .map(|(k, v)| Filter::tag(k, v))
            .collect();
        let images = self.own_images(&filters).await?;
        Ok(images.into_iter().next())
    }

    async fn own_images(&self, filters: &[Filter]) -> Result<Vec<Image>> {
        let api = self.api.as_ref();
        let owners = ["self".to_string()];
        let owners = &owners[..];
        self.with_retry("describe-images", move || api.describe_images(owners, filters))
            .await
    }

    /// Wait for the running state, then for an address
    async fn resolve_address(
        &self,
        cluster: &str,
        node: u32,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let api = self.api.as_ref();
        transition(cluster, node, BootstrapState::WaitingForRunningState);
        let ids = [instance_id.to_string()];
        let ids = &ids[..];
        self.with_retry("wait-instance-running", move || {
            api.wait_instances(ids, WaitState::Running)
        })
        .await?;

        transition(cluster, node, BootstrapState::WaitingForAddress);
        let found = poll_attempts(
            self.address_attempts(),
            self.timing.address_poll_interval(),
            cancel,
            "address wait",
            move || async move {
                let instance = self
                    .with_retry("describe-instances", move || api.describe_instance(instance_id))
                    .await?;
                Ok(self.address_of(&instance))
            },
        )
        .await?;

        found.ok_or_else(|| Error::BootstrapTimeout {
            cluster: cluster.to_string(),
            ready: Vec::new(),
            not_ready: vec![node],
            budget_secs: self.timing.ssh_timeout_secs,
        })
    }

    async fn current_addresses(
        &self,
        ns: Namespace,
        name: &str,
        nodes: &[u32],
    ) -> Result<BTreeMap<u32, Option<String>>> {
        let instances = self.cluster_instances(ns, name).await?;
        Ok(nodes
            .iter()
            .map(|n| (*n, instances.get(n).and_then(|i| self.address_of(i))))
            .collect())
    }

    /// Poll until every listed node has an address; addresses can change
    /// across a stop and start.
    async fn wait_for_addresses(
        &self,
        ns: Namespace,
        name: &str,
        nodes: &[u32],
    ) -> Result<BTreeMap<u32, String>> {
        let cancel = CancellationToken::new();
        let found = poll_attempts(
            self.address_attempts(),
            self.timing.address_poll_interval(),
            &cancel,
            "address wait",
            move || async move {
                let current = self.current_addresses(ns, name, nodes).await?;
                if current.values().all(Option::is_some) {
                    Ok(Some(
                        current
                            .into_iter()
                            .filter_map(|(n, a)| a.map(|a| (n, a)))
                            .collect::<BTreeMap<_, _>>(),
                    ))
                } else {
                    Ok(None)
                }
            },
        )
        .await?;

        if let Some(addresses) = found {
            return Ok(addresses);
        }
        let current = self.current_addresses(ns, name, nodes).await?;
        let (ready, not_ready): (Vec<_>, Vec<_>) =
            current.into_iter().partition(|(_, a)| a.is_some());
        Err(Error::BootstrapTimeout {
            cluster: name.to_string(),
            ready: ready.into_iter().map(|(n, _)| n).collect(),
            not_ready: not_ready.into_iter().map(|(n, _)| n).collect(),
            budget_secs: self.timing.ssh_timeout_secs,
        })
    }

    /// Post-boot fix on every node at once
    async fn fix_root(
        &self,
        cluster: &str,
        waits: &[SshWaitTarget],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let nodes: Vec<u32> = waits.iter().map(|w| w.node).collect();
        let results = fan_out(&nodes, self.parallelism, |node| {
            let bootstrap = Arc::clone(&self.bootstrap);
            let cluster = cluster.to_string();
            let login = waits.iter().find(|w| w.node == node).map(|w| w.target.clone());
            let cancel = cancel.clone();
            async move {
                let login = login.ok_or_else(|| no_address(node))?;
                bootstrap.post_boot_fix(&cluster, node, &login, &cancel).await
            }
        })
        .await;
        collect(cluster, "post-boot fix", results).map(|_| ())
    }

    /// Run a per-instance state change on the selected nodes
    async fn change_state(
        &self,
        ns: Namespace,
        name: &str,
        nodes: Option<&[u32]>,
        change: StateChange,
    ) -> Result<()> {
        let selected = self.select(ns, name, nodes).await?;
        let numbers: Vec<u32> = selected.iter().map(|(n, _)| *n).collect();
        let ids: BTreeMap<u32, String> = selected
            .into_iter()
            .map(|(n, i)| (n, i.instance_id))
            .collect();
        info!(
            cluster = name,
            namespace = %ns,
            nodes = ?numbers,
            operation = change.as_str(),
            "changing node state"
        );

        let results = fan_out(&numbers, self.parallelism, |node| {
            let api = Arc::clone(&self.api);
            let id = ids.get(&node).cloned();
            async move {
                let ids = [id.ok_or_else(|| Error::not_found(format!("node {}", node)))?];
                match change {
                    StateChange::Start => api.start_instances(&ids).await?,
                    StateChange::Stop => api.stop_instances(&ids).await?,
                    StateChange::Destroy => api.terminate_instances(&ids).await?,
                }
                api.wait_instances(&ids, change.settled()).await
            }
        })
        .await;
        collect(name, change.as_str(), results).map(|_| ())
    }

    async fn bake(
        &self,
        job: &BakeJob<'_>,
        script: &[u8],
        files: &[FileEntry],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tags = job.ns.tags();
        let label = format!("template {}", job.version);
        let name = image_name(job.ns, job.version, job.build);
        let key = self.keys.make_key(job.ns, job.key_cluster).await?;

        let request = RunInstanceRequest {
            image_id: job.base_image.to_string(),
            instance_type: self.instance_type(job.extra, job.version.arch, true),
            key_name: key.name.clone(),
            security_group_ids: self.security_groups(job.extra),
            subnet_id: self.subnet(job.extra),
            disk_sizes_gb: vec![self.settings.disk_size_gb],
            public_ip: job.extra.public_ip.unwrap_or(self.settings.public_ip),
            tags: vec![
                (NAME_TAG.to_string(), name.clone()),
                (tags.template_build.to_string(), job.build.to_string()),
            ],
        };
        transition(&label, 1, BootstrapState::Launching);
        let instance = self.api.run_instance(&request).await?;
        let address = self
            .resolve_address(&label, 1, &instance.instance_id, cancel)
            .await?;

        let login = SshWaitTarget {
            node: 1,
            target: SshTarget::new(self.login_user(job.version), address.clone(), &key.path),
        };
        self.bootstrap
            .wait_for_ssh(&label, std::slice::from_ref(&login), cancel)
            .await?;
        self.bootstrap
            .post_boot_fix(&label, 1, &login.target, cancel)
            .await?;

        let root = SshTarget::new("root", address, &key.path);
        self.remote.copy(&root, &bake_files(script, files)).await?;
        for command in installer_commands() {
            self.remote.exec(&root, &shell_join(&command)).await?;
        }

        let ids = [instance.instance_id.clone()];
        self.api.stop_instances(&ids).await?;
        self.api.wait_instances(&ids, WaitState::Stopped).await?;
        let image_id = self.api.create_image(&instance.instance_id, &name).await?;
        self.api.wait_image_available(&image_id).await?;

        // Identity tags make the image visible as a template; they go on last
        let mut image_tags = identity_tags(job.ns, job.version);
        image_tags.push((NAME_TAG.to_string(), name));
        image_tags.extend(job.extra_tags.iter().cloned());
        self.api.create_tags(&[image_id.clone()], &image_tags).await?;

        if let Err(e) = self.api.terminate_instances(&ids).await {
            warn!(instance = %instance.instance_id, error = %e, "could not terminate bake instance");
        }
        self.keys.kill_key(job.ns, job.key_cluster).await;
        info!(template = %job.version, image = %image_id, "template image tagged");
        Ok(())
    }

    /// Remove bake instances and untagged bake images. `build` narrows the
    /// sweep to one bake.
    async fn sweep_bakes(&self, ns: Namespace, build: Option<&str>) -> Result<()> {
        let tags = ns.tags();
        let filter = match build {
            Some(b) => Filter::tag(tags.template_build, b),
            None => Filter::new("tag-key", &[tags.template_build]),
        };
        let ids: Vec<String> = self
            .describe(&[filter])
            .await?
            .into_iter()
            .filter(|i| match (i.tag(tags.template_build), build) {
                (Some(found), Some(want)) => found == want,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .map(|i| i.instance_id)
            .collect();
        if !ids.is_empty() {
            info!(namespace = %ns, instances = ?ids, "terminating bake instances");
            self.api.terminate_instances(&ids).await?;
        }

        let prefix = image_name_prefix(ns);
        let pattern = format!("{}*", prefix);
        let images = self.own_images(&[Filter::new("name", &[&pattern])]).await?;
        for image in images {
            let leftover = image.name.starts_with(&prefix)
                && image.tag(USED_BY_TAG).is_none()
                && build.map_or(true, |b| image.name.ends_with(b));
            if leftover {
                info!(image = %image.image_id, name = %image.name, "deregistering unfinished template image");
                self.api.deregister_image(&image.image_id).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for AwsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Aws
    }

    async fn cluster_list(&self, ns: Namespace) -> Result<Vec<String>> {
        let tags = ns.tags();
        let instances = self
            .describe(&[Filter::tag(USED_BY_TAG, tags.used_by_value)])
            .await?;
        Ok(distinct_clusters(
            instances
                .iter()
                .filter_map(|i| i.tag(tags.cluster_name)),
        ))
    }

    async fn node_list_in_cluster(&self, ns: Namespace, name: &str) -> Result<Vec<u32>> {
        Ok(self.cluster_instances(ns, name).await?.into_keys().collect())
    }

    async fn node_arch(&self, ns: Namespace, name: &str, node: u32) -> Result<Arch> {
        let (_, instance) = self
            .select(ns, name, Some(&[node]))
            .await?
            .pop()
            .ok_or_else(|| Error::not_found(format!("node {} in cluster {}", node, name)))?;
        // Nodes from other tooling may lack the tag; the instance attribute is always set
        instance
            .tag(ARCH_TAG)
            .and_then(Arch::parse)
            .or_else(|| instance.architecture.as_deref().and_then(Arch::parse))
            .ok_or_else(|| Error::corrupt(&instance.instance_id, "architecture unknown"))
    }

    async fn get_node_ip_map(
        &self,
        ns: Namespace,
        name: &str,
        internal: bool,
    ) -> Result<BTreeMap<u32, String>> {
        Ok(self
            .cluster_instances(ns, name)
            .await?
            .into_iter()
            .map(|(node, i)| {
                let ip = if internal { i.private_ip } else { i.public_ip };
                (node, ip.unwrap_or_else(|| ADDRESS_NOT_ASSIGNED.to_string()))
            })
            .collect())
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
        let tags = ns.tags();
        let extra_tags = parse_extra_tags(&extra.tags, &tags.reserved_keys())?;

        let image = self
            .find_template(ns, version)
            .await?
            .ok_or_else(|| Error::not_found(format!("template {}", version)))?;
        let key = self.keys.make_key(ns, name).await?;
        let existing: Vec<u32> = self.cluster_instances(ns, name).await?.into_keys().collect();
        let numbers = allocate_node_numbers(&existing, count)?;
        info!(cluster = name, namespace = %ns, nodes = ?numbers, template = %version, "deploying nodes");

        let mut created: Vec<(u32, String)> = Vec::with_capacity(numbers.len());
        for &node in &numbers {
            transition(name, node, BootstrapState::Launching);
            let mut request_tags = identity_tags(ns, version);
            request_tags.push((tags.cluster_name.to_string(), name.to_string()));
            request_tags.push((tags.node_number.to_string(), node.to_string()));
            request_tags.push((
                NAME_TAG.to_string(),
                format!("{}-{}_{}", tags.used_by_value, name, node),
            ));
            request_tags.extend(extra_tags.iter().cloned());
            let request = RunInstanceRequest {
                image_id: image.image_id.clone(),
                instance_type: self.instance_type(extra, version.arch, false),
                key_name: key.name.clone(),
                security_group_ids: self.security_groups(extra),
                subnet_id: self.subnet(extra),
                disk_sizes_gb: if extra.disk_sizes_gb.is_empty() {
                    vec![self.settings.disk_size_gb]
                } else {
                    extra.disk_sizes_gb.clone()
                },
                public_ip: extra.public_ip.unwrap_or(self.settings.public_ip),
                tags: request_tags,
            };

            let launched = if cancel.is_cancelled() {
                Err(Error::Cancelled(format!("deploy of cluster {}", name)))
            } else {
                self.api.run_instance(&request).await
            };
            match launched {
                Ok(instance) => created.push((node, instance.instance_id)),
                Err(e) => {
                    return Err(Error::ClusterGrowth {
                        cluster: name.to_string(),
                        created: created.iter().map(|(n, _)| *n).collect(),
                        failed_node: node,
                        source: Box::new(e),
                    })
                }
            }
        }

        let mut waits = Vec::with_capacity(created.len());
        for (node, id) in &created {
            let address = self.resolve_address(name, *node, id, cancel).await?;
            waits.push(SshWaitTarget {
                node: *node,
                target: SshTarget::new(self.login_user(version), address, &key.path),
            });
        }
        self.bootstrap.wait_for_ssh(name, &waits, cancel).await?;
        self.fix_root(name, &waits, cancel).await?;

        info!(cluster = name, nodes = ?numbers, "nodes ready");
        Ok(numbers)
    }

    async fn cluster_start(&self, ns: Namespace, name: &str, nodes: Option<&[u32]>) -> Result<()> {
        let key = self.keys.get_key(ns, name).await?;
        self.change_state(ns, name, nodes, StateChange::Start).await?;

        let numbers: Vec<u32> = self
            .select(ns, name, nodes)
            .await?
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        let addresses = self.wait_for_addresses(ns, name, &numbers).await?;
        let waits: Vec<SshWaitTarget> = addresses
            .into_iter()
            .map(|(node, host)| SshWaitTarget {
                node,
                target: SshTarget::new("root", host, &key.path),
            })
            .collect();
        self.bootstrap
            .wait_for_ssh(name, &waits, &CancellationToken::new())
            .await
    }

    async fn cluster_stop(&self, ns: Namespace, name: &str, nodes: Option<&[u32]>) -> Result<()> {
        self.change_state(ns, name, nodes, StateChange::Stop).await
    }

    async fn cluster_destroy(
        &self,
        ns: Namespace,
        name: &str,
        nodes: Option<&[u32]>,
    ) -> Result<()> {
        let outcome = self.change_state(ns, name, nodes, StateChange::Destroy).await;

        let remaining = self.cluster_instances(ns, name).await?;
        if remaining.is_empty() {
            self.keys.kill_key(ns, name).await;
        } else {
            info!(cluster = name, remaining = remaining.len(), "cluster still has nodes, keeping key");
        }
        outcome
    }

    async fn run_commands(
        &self,
        ns: Namespace,
        name: &str,
        commands: &[Vec<String>],
        nodes: Option<&[u32]>,
    ) -> Result<Vec<NodeOutput>> {
        let selected = self.select(ns, name, nodes).await?;
        let key = self.keys.get_key(ns, name).await?;
        let targets: BTreeMap<u32, Option<SshTarget>> = selected
            .iter()
            .map(|(n, i)| {
                let target = self
                    .address_of(i)
                    .map(|host| SshTarget::new("root", host, &key.path));
                (*n, target)
            })
            .collect();
        let numbers: Vec<u32> = targets.keys().copied().collect();
        let lines: Arc<Vec<String>> = Arc::new(commands.iter().map(|c| shell_join(c)).collect());

        let results = fan_out(&numbers, self.parallelism, |node| {
            let remote = Arc::clone(&self.remote);
            let target = targets.get(&node).cloned().flatten();
            let lines = Arc::clone(&lines);
            async move {
                let target = target.ok_or_else(|| no_address(node))?;
                let mut outputs = Vec::with_capacity(lines.len());
                for line in lines.iter() {
                    outputs.push(remote.exec(&target, line).await?);
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
        let selected = self.select(ns, name, nodes).await?;
        let key = self.keys.get_key(ns, name).await?;
        let targets: BTreeMap<u32, Option<SshTarget>> = selected
            .iter()
            .map(|(n, i)| {
                let target = self
                    .address_of(i)
                    .map(|host| SshTarget::new("root", host, &key.path));
                (*n, target)
            })
            .collect();
        let numbers: Vec<u32> = targets.keys().copied().collect();
        let files: Arc<Vec<FileEntry>> = Arc::new(files.to_vec());

        let results = fan_out(&numbers, self.parallelism, |node| {
            let remote = Arc::clone(&self.remote);
            let target = targets.get(&node).cloned().flatten();
            let files = Arc::clone(&files);
            async move {
                let target = target.ok_or_else(|| no_address(node))?;
                remote.copy(&target, &files).await
            }
        })
        .await;
        collect(name, "copy", results).map(|_| ())
    }

    async fn list_templates(&self, ns: Namespace) -> Result<Vec<TemplateVersion>> {
        let images = self
            .own_images(&[Filter::tag(USED_BY_TAG, ns.tags().used_by_value)])
            .await?;
        let mut versions = Vec::with_capacity(images.len());
        for image in &images {
            match template_of(ns, image) {
                Some(v) => versions.push(v),
                None => warn!(image = %image.image_id, "image has incomplete template tags, skipping"),
            }
        }
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
        version.validate()?;
        let extra_tags = parse_extra_tags(&extra.tags, &ns.tags().reserved_keys())?;
        if self.find_template(ns, version).await?.is_some() {
            return Err(Error::AlreadyExists(format!("template {}", version)));
        }

        let build = Uuid::new_v4().simple().to_string();
        let key_cluster = format!("template-{}", &build[..8]);
        let base_image = find_base_image(self.api.as_ref(), version).await?;
        let job = BakeJob {
            ns,
            version,
            build: &build,
            key_cluster: &key_cluster,
            base_image: &base_image,
            extra,
            extra_tags: &extra_tags,
        };

        run_bake(
            version,
            cancel,
            self.bake(&job, script, files, cancel),
            async {
                let swept = self.sweep_bakes(ns, Some(&build)).await;
                self.keys.kill_key(ns, &key_cluster).await;
                swept
            },
        )
        .await
    }

    async fn template_destroy(&self, ns: Namespace, version: &TemplateVersion) -> Result<()> {
        let image = self
            .find_template(ns, version)
            .await?
            .ok_or_else(|| Error::not_found(format!("template {}", version)))?;
        self.api.deregister_image(&image.image_id).await?;
        info!(template = %version, image = %image.image_id, "template destroyed");
        Ok(())
    }

    async fn vacuum_templates(&self, ns: Namespace) -> Result<()> {
        self.sweep_bakes(ns, None).await
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
        let selected = self.select(ns, name, Some(&[node])).await?;
        let host = selected
            .first()
            .and_then(|(_, i)| self.address_of(i))
            .ok_or_else(|| no_address(node))?;
        let key = self.keys.get_key(ns, name).await?;
        let target = SshTarget::new("root", host, &key.path);
        self.remote
            .attach(&target, &shell_join(command), streams, interactive)
            .await
    }

    async fn get_key_path(&self, ns: Namespace, name: &str) -> Result<PathBuf> {
        Ok(self.keys.get_key(ns, name).await?.path)
    }
}
