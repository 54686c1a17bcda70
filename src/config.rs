// Engine Configuration
//
// Loaded from a JSON file, then overlaid with environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::Arch;
use crate::error::{Error, Result};
use crate::fanout::DEFAULT_PARALLELISM;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Aws,
    Docker,
    Lxc,
    Gcp,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Docker
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "docker" => Ok(Self::Docker),
            "lxc" | "lxd" => Ok(Self::Lxc),
            "gcp" => Ok(Self::Gcp),
            other => Err(Error::config(format!("unknown backend '{}'", other))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Aws => "aws",
            Self::Docker => "docker",
            Self::Lxc => "lxc",
            Self::Gcp => "gcp",
        };
        f.write_str(name)
    }
}

/// Polling and retry budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wall-clock budget for a whole batch to become reachable over SSH
    pub ssh_timeout_secs: u64,
    pub ssh_poll_interval_ms: u64,
    pub address_poll_interval_ms: u64,
    /// Attempts for rate-limited describe calls
    pub rate_limit_attempts: u32,
    /// Backoff step; attempt N sleeps N times this
    pub rate_limit_backoff_secs: u64,
    /// Container address waits (one second apart)
    pub address_wait_attempts: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ssh_timeout_secs: 600,
            ssh_poll_interval_ms: 1000,
            address_poll_interval_ms: 10_000,
            rate_limit_attempts: 3,
            rate_limit_backoff_secs: 10,
            address_wait_attempts: 20,
        }
    }
}

impl TimingConfig {
    pub fn ssh_budget(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }

    pub fn ssh_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ssh_poll_interval_ms)
    }

    pub fn address_poll_interval(&self) -> Duration {
        Duration::from_millis(self.address_poll_interval_ms)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_secs(self.rate_limit_backoff_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub cli_binary: String,
    pub security_group_id: String,
    pub subnet_id: String,
    pub instance_type: String,
    pub arm_instance_type: String,
    pub template_instance_type: String,
    pub disk_size_gb: u32,
    /// Login user for the root fix-up; unset means the distro's default
    pub login_user: Option<String>,
    pub public_ip: bool,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            cli_binary: "aws".to_string(),
            security_group_id: String::new(),
            subnet_id: String::new(),
            instance_type: "t3.large".to_string(),
            arm_instance_type: "t4g.large".to_string(),
            template_instance_type: "t3.medium".to_string(),
            disk_size_gb: 20,
            login_user: None,
            public_ip: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub binary: String,
    /// Force an architecture instead of asking `docker info`
    pub arch: Option<Arch>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            arch: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LxcConfig {
    /// Backing store passed to lxc-create and lxc-copy (e.g. "btrfs")
    pub backing_store: Option<String>,
    /// Image server used by the download template
    pub download_server: Option<String>,
    pub arch: Option<Arch>,
    /// Where container configs live
    pub lxc_path: PathBuf,
}

impl Default for LxcConfig {
    fn default() -> Self {
        Self {
            backing_store: None,
            download_server: None,
            arch: None,
            lxc_path: PathBuf::from("/var/lib/lxc"),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendKind,
    pub region: String,
    pub ssh_key_dir: PathBuf,
    pub tmp_dir: Option<PathBuf>,
    /// Fan-out ceiling for per-node work
    pub parallelism: usize,
    pub timing: TimingConfig,
    pub aws: AwsConfig,
    pub docker: DockerConfig,
    pub lxc: LxcConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            backend: BackendKind::default(),
            region: "us-east-1".to_string(),
            ssh_key_dir: Path::new(&home).join(".clusterlab").join("keys"),
            tmp_dir: None,
            parallelism: DEFAULT_PARALLELISM,
            timing: TimingConfig::default(),
            aws: AwsConfig::default(),
            docker: DockerConfig::default(),
            lxc: LxcConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Overlay process environment variables
    pub fn from_env(self) -> Result<Self> {
        self.with_env(|key| std::env::var(key).ok())
    }

    /// Overlay variables from an arbitrary lookup
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("CLUSTERLAB_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Some(region) = lookup("CLUSTERLAB_REGION").or_else(|| lookup("AWS_REGION")) {
            self.region = region;
        }
        if let Some(dir) = lookup("CLUSTERLAB_SSH_KEY_DIR") {
            self.ssh_key_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CLUSTERLAB_TMP_DIR") {
            self.tmp_dir = Some(PathBuf::from(dir));
        }
        if let Some(threads) = lookup("CLUSTERLAB_PARALLELISM") {
            self.parallelism = threads.trim().parse().map_err(|_| {
                Error::config(format!("CLUSTERLAB_PARALLELISM must be a number, got '{}'", threads))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::config("parallelism must be at least 1"));
        }
        if self.region.trim().is_empty() {
            return Err(Error::config("region must not be empty"));
        }
        Ok(())
    }

    /// Directory for staging files before they are pushed into containers
    pub fn scratch_dir(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Load engine config from file
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!("failed to read config file {}: {}", path.display(), e))
    })?;

    let config: EngineConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Save engine config to file
pub fn save_config(path: &Path, config: &EngineConfig) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content).map_err(|e| {
        Error::config(format!("failed to write config file {}: {}", path.display(), e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_documented_budgets() {
        let config = EngineConfig::default();
        assert_eq!(config.timing.ssh_budget(), Duration::from_secs(600));
        assert_eq!(config.timing.rate_limit_attempts, 3);
        assert_eq!(config.timing.rate_limit_backoff(), Duration::from_secs(10));
        assert_eq!(config.parallelism, DEFAULT_PARALLELISM);
        assert!(config.aws.login_user.is_none());
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("CLUSTERLAB_BACKEND", "aws"),
            ("AWS_REGION", "eu-west-1"),
            ("CLUSTERLAB_SSH_KEY_DIR", "/tmp/keys"),
            ("CLUSTERLAB_PARALLELISM", "8"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::default()
            .with_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.backend, BackendKind::Aws);
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.ssh_key_dir, PathBuf::from("/tmp/keys"));
        assert_eq!(config.parallelism, 8);
    }

    #[test]
    fn test_explicit_region_wins_over_aws_region() {
        let config = EngineConfig::default()
            .with_env(|k| match k {
                "CLUSTERLAB_REGION" => Some("ap-south-1".to_string()),
                "AWS_REGION" => Some("eu-west-1".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.region, "ap-south-1");
    }

    #[test]
    fn test_bad_env_values_are_rejected() {
        let err = EngineConfig::default()
            .with_env(|k| (k == "CLUSTERLAB_PARALLELISM").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CLUSTERLAB_PARALLELISM"));

        let err = EngineConfig::default()
            .with_env(|k| (k == "CLUSTERLAB_PARALLELISM").then(|| "0".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("at least 1"));

        assert!("vmware".parse::<BackendKind>().is_err());
        assert_eq!("LXC".parse::<BackendKind>().unwrap(), BackendKind::Lxc);
    }

    #[test]
    fn test_save_and_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = EngineConfig::default();
        config.backend = BackendKind::Lxc;
        config.timing.ssh_timeout_secs = 30;
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.backend, BackendKind::Lxc);
        assert_eq!(loaded.timing.ssh_timeout_secs, 30);

        // Missing sections fall back to defaults
        std::fs::write(&path, r#"{"backend":"aws","aws":{"subnet_id":"subnet-1"}}"#).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.backend, BackendKind::Aws);
        assert_eq!(loaded.aws.subnet_id, "subnet-1");
        assert_eq!(loaded.aws.instance_type, "t3.large");
        assert_eq!(loaded.timing.ssh_timeout_secs, 600);
    }
}
