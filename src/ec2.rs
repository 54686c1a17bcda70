// EC2 API
//
// The slice of the compute API the cloud backend needs, plus an
// implementation that drives the `aws` command line tool and parses its
// JSON output.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::backend::{Arch, TemplateVersion};
use crate::discovery::STATE_TERMINATED;
use crate::error::{Error, ExitKind, Result};
use crate::exec::CommandRunner;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instance {
    pub instance_id: String,
    pub state_code: i64,
    pub state_name: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub architecture: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl Instance {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn is_terminated(&self) -> bool {
        // The low byte is the state; the high byte is provider-internal
        self.state_code & 0xff == STATE_TERMINATED
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub image_id: String,
    pub name: String,
    pub state: String,
    pub architecture: Option<String>,
    pub creation_date: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl Image {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// `Name=<name>,Values=<v1>,<v2>` filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn tag(key: &str, value: &str) -> Self {
        Self::new(format!("tag:{}", key), &[value])
    }

    /// True if `tags` satisfies this filter. Only `tag:` filters are
    /// evaluated; others always match.
    pub fn matches_tags(&self, tags: &BTreeMap<String, String>) -> bool {
        match self.name.strip_prefix("tag:") {
            Some(key) => tags
                .get(key)
                .map(|v| self.values.iter().any(|want| want == v))
                .unwrap_or(false),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunInstanceRequest {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub security_group_ids: Vec<String>,
    pub subnet_id: Option<String>,
    pub disk_sizes_gb: Vec<u32>,
    pub public_ip: bool,
    pub tags: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Running,
    Stopped,
    Terminated,
}

impl WaitState {
    fn waiter(self) -> &'static str {
        match self {
            Self::Running => "instance-running",
            Self::Stopped => "instance-stopped",
            Self::Terminated => "instance-terminated",
        }
    }
}

#[async_trait]
pub trait Ec2Api: Send + Sync {
    async fn describe_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>>;

    async fn describe_instance(&self, instance_id: &str) -> Result<Instance> {
        self.describe_instances(&[Filter::new("instance-id", &[instance_id])])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("instance {}", instance_id)))
    }

    async fn run_instance(&self, request: &RunInstanceRequest) -> Result<Instance>;

    async fn start_instances(&self, ids: &[String]) -> Result<()>;

    async fn stop_instances(&self, ids: &[String]) -> Result<()>;

    async fn terminate_instances(&self, ids: &[String]) -> Result<()>;

    /// Block until every instance reaches `state`
    async fn wait_instances(&self, ids: &[String], state: WaitState) -> Result<()>;

    async fn describe_images(&self, owners: &[String], filters: &[Filter]) -> Result<Vec<Image>>;

    async fn create_image(&self, instance_id: &str, name: &str) -> Result<String>;

    async fn wait_image_available(&self, image_id: &str) -> Result<()>;

    async fn deregister_image(&self, image_id: &str) -> Result<()>;

    async fn create_tags(&self, resource_ids: &[String], tags: &[(String, String)]) -> Result<()>;

    async fn key_pair_exists(&self, name: &str) -> Result<bool>;

    /// Returns the private key material
    async fn create_key_pair(&self, name: &str) -> Result<String>;

    async fn delete_key_pair(&self, name: &str) -> Result<()>;

    /// Errors worth retrying with backoff
    fn is_retryable(&self, err: &Error) -> bool {
        err.is_rate_limit()
    }
}

/// Owner account and name pattern of the public base image for a version
pub fn base_image_query(version: &TemplateVersion) -> Result<(String, String)> {
    let (deb_arch, rpm_arch) = match version.arch {
        Arch::Amd64 => ("amd64", "x86_64"),
        Arch::Arm64 => ("arm64", "aarch64"),
    };
    let major = version
        .distro_version
        .split('.')
        .next()
        .unwrap_or(&version.distro_version);

    let query = match version.distro.as_str() {
        "ubuntu" => (
            "099720109477",
            format!(
                "ubuntu/images/hvm-ssd*/ubuntu-*-{}-{}-server-*",
                version.distro_version, deb_arch
            ),
        ),
        "debian" => ("136693071363", format!("debian-{}-{}-*", major, deb_arch)),
        "amazon" => (
            "137112412989",
            match version.arch {
                Arch::Amd64 => "al2023-ami-2023*-kernel-*-x86_64".to_string(),
                Arch::Arm64 => "al2023-ami-2023*-kernel-*-arm64".to_string(),
            },
        ),
        "rocky" | "centos" => (
            "792107900819",
            format!("Rocky-{}-EC2-Base-*{}", major, rpm_arch),
        ),
        other => {
            return Err(Error::invalid(format!(
                "no base image known for distro '{}'",
                other
            )))
        }
    };
    Ok((query.0.to_string(), query.1))
}

/// Account the public base image of a distro accepts keys for. Rocky images
/// back both rocky and centos.
pub fn base_image_user(version: &TemplateVersion) -> &'static str {
    match version.distro.as_str() {
        "debian" => "admin",
        "amazon" => "ec2-user",
        "rocky" | "centos" => "rocky",
        _ => "ubuntu",
    }
}

/// Newest available public image matching the template's distro and arch
pub async fn find_base_image(api: &dyn Ec2Api, version: &TemplateVersion) -> Result<String> {
    let (owner, pattern) = base_image_query(version)?;
    let images = api
        .describe_images(
            &[owner],
            &[
                Filter::new("name", &[&pattern]),
                Filter::new("state", &["available"]),
            ],
        )
        .await?;

    newest_image(&images)
        .map(|img| img.image_id.clone())
        .ok_or_else(|| Error::not_found(format!("base image for {}", version)))
}

fn newest_image(images: &[Image]) -> Option<&Image> {
    let created = |img: &Image| -> Option<DateTime<Utc>> {
        img.creation_date
            .as_deref()
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&Utc))
    };
    images.iter().max_by_key(|img| created(img))
}

// Raw CLI output shapes

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawState {
    code: i64,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInstance {
    instance_id: String,
    state: RawState,
    public_ip_address: Option<String>,
    private_ip_address: Option<String>,
    architecture: Option<String>,
    #[serde(default)]
    tags: Vec<Tag>,
}

impl From<RawInstance> for Instance {
    fn from(raw: RawInstance) -> Self {
        Self {
            instance_id: raw.instance_id,
            state_code: raw.state.code,
            state_name: raw.state.name,
            public_ip: raw.public_ip_address,
            private_ip: raw.private_ip_address,
            architecture: raw.architecture,
            tags: raw.tags.into_iter().map(|t| (t.key, t.value)).collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<RawInstance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    #[serde(default)]
    instances: Vec<RawInstance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawImage {
    image_id: String,
    name: Option<String>,
    state: Option<String>,
    architecture: Option<String>,
    creation_date: Option<String>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImagesOutput {
    #[serde(default)]
    images: Vec<RawImage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateImageOutput {
    image_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateKeyPairOutput {
    key_material: String,
}

/// `aws ec2 ...` through a command runner
pub struct AwsCli {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    region: String,
}

fn is_throttle_message(stderr: &str) -> bool {
    stderr.contains("RequestLimitExceeded") || stderr.contains("Request limit exceeded")
}

fn filter_args(filters: &[Filter]) -> Vec<String> {
    if filters.is_empty() {
        return Vec::new();
    }
    let mut args = vec!["--filters".to_string()];
    for f in filters {
        args.push(format!("Name={},Values={}", f.name, f.values.join(",")));
    }
    args
}

fn tag_json(tags: &[(String, String)]) -> Vec<serde_json::Value> {
    tags.iter()
        .map(|(k, v)| json!({ "Key": k, "Value": v }))
        .collect()
}

impl AwsCli {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: &str, region: &str) -> Self {
        Self {
            runner,
            binary: binary.to_string(),
            region: region.to_string(),
        }
    }

    async fn call(&self, operation: &str, args: Vec<String>) -> Result<String> {
        let mut full = vec![
            "ec2".to_string(),
            operation.to_string(),
            "--region".to_string(),
            self.region.clone(),
            "--output".to_string(),
            "json".to_string(),
        ];
        full.extend(args);
        debug!(operation, region = %self.region, "aws ec2 call");

        let output = self.runner.run(&self.binary, &full, None).await?;
        if output.success() {
            return Ok(output.stdout_str());
        }

        let stderr = output.stderr_str();
        if is_throttle_message(&stderr) {
            return Err(Error::RateLimit(format!("{}: {}", operation, stderr.trim())));
        }
        Err(Error::Exec {
            target: format!("aws ec2 ({})", self.region),
            command: operation.to_string(),
            exit: output.status.map(ExitKind::Code).unwrap_or(ExitKind::Signal),
            output: stderr.trim().to_string(),
        })
    }

    /// Listing failures are discovery failures; throttling stays retryable
    async fn describe(&self, operation: &str, args: Vec<String>) -> Result<String> {
        self.call(operation, args).await.map_err(|e| match e {
            Error::RateLimit(_) => e,
            other => Error::discovery(other.to_string()),
        })
    }
}

#[async_trait]
impl Ec2Api for AwsCli {
    async fn describe_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>> {
        let out = self.describe("describe-instances", filter_args(filters)).await?;
        let parsed: DescribeInstancesOutput = serde_json::from_str(&out)?;
        Ok(parsed
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(Instance::from)
            .collect())
    }

    async fn run_instance(&self, request: &RunInstanceRequest) -> Result<Instance> {
        let mut args = vec![
            "--image-id".to_string(),
            request.image_id.clone(),
            "--instance-type".to_string(),
            request.instance_type.clone(),
            "--key-name".to_string(),
            request.key_name.clone(),
            "--count".to_string(),
            "1".to_string(),
        ];
        if !request.security_group_ids.is_empty() {
            args.push("--security-group-ids".to_string());
            args.extend(request.security_group_ids.iter().cloned());
        }
        if let Some(subnet) = &request.subnet_id {
            args.push("--subnet-id".to_string());
            args.push(subnet.clone());
            args.push(if request.public_ip {
                "--associate-public-ip-address".to_string()
            } else {
                "--no-associate-public-ip-address".to_string()
            });
        }
        if !request.disk_sizes_gb.is_empty() {
            let mappings: Vec<serde_json::Value> = request
                .disk_sizes_gb
                .iter()
                .enumerate()
                .map(|(i, size)| {
                    let device = if i == 0 {
                        "/dev/sda1".to_string()
                    } else {
                        format!("/dev/xvd{}", (b'a' + i as u8) as char)
                    };
                    json!({
                        "DeviceName": device,
                        "Ebs": { "VolumeSize": size, "VolumeType": "gp3", "DeleteOnTermination": true }
                    })
                })
                .collect();
            args.push("--block-device-mappings".to_string());
            args.push(serde_json::to_string(&mappings)?);
        }
        if !request.tags.is_empty() {
            let tags = tag_json(&request.tags);
            let specs = json!([
                { "ResourceType": "instance", "Tags": tags },
                { "ResourceType": "volume", "Tags": tags },
            ]);
            args.push("--tag-specifications".to_string());
            args.push(specs.to_string());
        }

        let out = self.call("run-instances", args).await?;
        let parsed: RunInstancesOutput = serde_json::from_str(&out)?;
        parsed
            .instances
            .into_iter()
            .next()
            .map(Instance::from)
            .ok_or_else(|| Error::discovery("run-instances returned no instance"))
    }

    async fn start_instances(&self, ids: &[String]) -> Result<()> {
        let mut args = vec!["--instance-ids".to_string()];
        args.extend(ids.iter().cloned());
        self.call("start-instances", args).await?;
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String]) -> Result<()> {
        let mut args = vec!["--instance-ids".to_string()];
        args.extend(ids.iter().cloned());
        self.call("stop-instances", args).await?;
        Ok(())
    }

    async fn terminate_instances(&self, ids: &[String]) -> Result<()> {
        let mut args = vec!["--instance-ids".to_string()];
        args.extend(ids.iter().cloned());
        self.call("terminate-instances", args).await?;
        Ok(())
    }

    async fn wait_instances(&self, ids: &[String], state: WaitState) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec![
            "ec2".to_string(),
            "wait".to_string(),
            state.waiter().to_string(),
            "--region".to_string(),
            self.region.clone(),
            "--instance-ids".to_string(),
        ];
        args.extend(ids.iter().cloned());
        let output = self.runner.run(&self.binary, &args, None).await?;
        if is_throttle_message(&output.stderr_str()) {
            return Err(Error::RateLimit(format!("{}: {}", state.waiter(), output.stderr_str().trim())));
        }
        output.check(&format!("aws ec2 ({})", self.region), state.waiter())?;
        Ok(())
    }

    async fn describe_images(&self, owners: &[String], filters: &[Filter]) -> Result<Vec<Image>> {
        let mut args = Vec::new();
        if !owners.is_empty() {
            args.push("--owners".to_string());
            args.extend(owners.iter().cloned());
        }
        args.extend(filter_args(filters));
        let out = self.describe("describe-images", args).await?;
        let parsed: DescribeImagesOutput = serde_json::from_str(&out)?;
        Ok(parsed
            .images
            .into_iter()
            .map(|raw| Image {
                image_id: raw.image_id,
                name: raw.name.unwrap_or_default(),
                state: raw.state.unwrap_or_default(),
                architecture: raw.architecture,
                creation_date: raw.creation_date,
                tags: raw.tags.into_iter().map(|t| (t.key, t.value)).collect(),
            })
            .collect())
    }

    async fn create_image(&self, instance_id: &str, name: &str) -> Result<String> {
        let out = self
            .call(
                "create-image",
                vec![
                    "--instance-id".to_string(),
                    instance_id.to_string(),
                    "--name".to_string(),
                    name.to_string(),
                ],
            )
            .await?;
        let parsed: CreateImageOutput = serde_json::from_str(&out)?;
        Ok(parsed.image_id)
    }

    async fn wait_image_available(&self, image_id: &str) -> Result<()> {
        let args = vec![
            "ec2".to_string(),
            "wait".to_string(),
            "image-available".to_string(),
            "--region".to_string(),
            self.region.clone(),
            "--image-ids".to_string(),
            image_id.to_string(),
        ];
        let output = self.runner.run(&self.binary, &args, None).await?;
        output.check(&format!("aws ec2 ({})", self.region), "image-available")?;
        Ok(())
    }

    async fn deregister_image(&self, image_id: &str) -> Result<()> {
        self.call(
            "deregister-image",
            vec!["--image-id".to_string(), image_id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[(String, String)]) -> Result<()> {
        let mut args = vec!["--resources".to_string()];
        args.extend(resource_ids.iter().cloned());
        args.push("--tags".to_string());
        args.push(serde_json::to_string(&tag_json(tags))?);
        self.call("create-tags", args).await?;
        Ok(())
    }

    async fn key_pair_exists(&self, name: &str) -> Result<bool> {
        match self
            .call(
                "describe-key-pairs",
                vec!["--key-names".to_string(), name.to_string()],
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::Exec { output, .. }) if output.contains("InvalidKeyPair.NotFound") => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_key_pair(&self, name: &str) -> Result<String> {
        let out = self
            .call(
                "create-key-pair",
                vec!["--key-name".to_string(), name.to_string()],
            )
            .await?;
        let parsed: CreateKeyPairOutput = serde_json::from_str(&out)?;
        Ok(parsed.key_material)
    }

    async fn delete_key_pair(&self, name: &str) -> Result<()> {
        self.call(
            "delete-key-pair",
            vec!["--key-name".to_string(), name.to_string()],
        )
        .await?;
        Ok(())
    }
}
