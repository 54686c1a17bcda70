// SSH Key Lifecycle
//
// One keypair per cluster and region on the cloud backend: the public half
// registered with the provider, the private half in the local key
// directory. Both halves must exist for a key to be usable.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::ec2::Ec2Api;
use crate::error::{Error, Result};
use crate::namespace::Namespace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub name: String,
    pub path: PathBuf,
}

pub struct KeyManager {
    api: Arc<dyn Ec2Api>,
    dir: PathBuf,
    region: String,
}

impl KeyManager {
    pub fn new(api: Arc<dyn Ec2Api>, dir: impl Into<PathBuf>, region: &str) -> Self {
        Self {
            api,
            dir: dir.into(),
            region: region.to_string(),
        }
    }

    pub fn key_name(&self, ns: Namespace, cluster: &str) -> String {
        let prefix = match ns {
            Namespace::Server => "aerolab-",
            Namespace::Client => "aerolab_c-",
        };
        format!("{}{}_{}", prefix, cluster, self.region)
    }

    pub fn key_path(&self, ns: Namespace, cluster: &str) -> PathBuf {
        self.dir.join(self.key_name(ns, cluster))
    }

    /// Both halves must be present; nothing is repaired here
    pub async fn get_key(&self, ns: Namespace, cluster: &str) -> Result<KeyMaterial> {
        let name = self.key_name(ns, cluster);
        let path = self.key_path(ns, cluster);

        if !self.api.key_pair_exists(&name).await? {
            return Err(Error::key(format!(
                "key pair {} is not registered in {}",
                name, self.region
            )));
        }
        let on_disk = match fs::metadata(&path).await {
            Ok(meta) => meta.is_file(),
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !on_disk {
            return Err(Error::key(format!(
                "private key for {} missing at {}",
                name,
                path.display()
            )));
        }
        Ok(KeyMaterial { name, path })
    }

    /// Return the existing key or create a fresh pair. Callers must not
    /// race this for the same cluster.
    pub async fn make_key(&self, ns: Namespace, cluster: &str) -> Result<KeyMaterial> {
        if let Ok(existing) = self.get_key(ns, cluster).await {
            return Ok(existing);
        }

        let name = self.key_name(ns, cluster);
        let path = self.key_path(ns, cluster);

        // Clear any stale half before creating a new pair
        match fs::remove_file(&path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        if self.api.key_pair_exists(&name).await? {
            self.api.delete_key_pair(&name).await?;
        }

        create_private_dir(&self.dir).await?;
        let material = self.api.create_key_pair(&name).await?;
        write_private_file(&path, material.as_bytes()).await?;

        info!(key = %name, path = %path.display(), "created key pair");
        Ok(KeyMaterial { name, path })
    }

    /// Best effort; failures are logged and swallowed
    pub async fn kill_key(&self, ns: Namespace, cluster: &str) {
        let name = self.key_name(ns, cluster);
        let path = self.key_path(ns, cluster);

        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(key = %name, path = %path.display(), error = %e, "could not remove private key");
            }
        }
        match self.api.delete_key_pair(&name).await {
            Ok(()) => info!(key = %name, "deleted key pair"),
            Err(e) => warn!(key = %name, error = %e, "could not delete key pair"),
        }
    }
}

#[cfg(unix)]
async fn create_private_dir(dir: &Path) -> Result<()> {
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).await?;
    Ok(())
}

async fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEc2;

    fn manager(api: Arc<FakeEc2>, dir: &std::path::Path) -> KeyManager {
        KeyManager::new(api, dir.join("keys"), "us-east-1")
    }

    #[tokio::test]
    async fn test_make_key_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeEc2::new());
        let keys = manager(api.clone(), dir.path());

        let first = keys.make_key(Namespace::Server, "mydc").await.unwrap();
        let second = keys.make_key(Namespace::Server, "mydc").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.name, "aerolab-mydc_us-east-1");
        assert!(first.path.is_file());
        api.with_state(|s| assert_eq!(s.created_key_pairs.len(), 1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let keys = manager(Arc::new(FakeEc2::new()), dir.path());

        let key = keys.make_key(Namespace::Server, "mydc").await.unwrap();
        let mode = std::fs::metadata(&key.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_get_key_requires_both_halves() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeEc2::new());
        let keys = manager(api.clone(), dir.path());

        assert!(matches!(
            keys.get_key(Namespace::Server, "mydc").await,
            Err(Error::Key(_))
        ));

        // Provider half only
        api.with_state(|s| s.key_pairs.insert("aerolab-mydc_us-east-1".to_string()));
        let err = keys.get_key(Namespace::Server, "mydc").await.unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_make_key_replaces_stale_half() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeEc2::new());
        let keys = manager(api.clone(), dir.path());
        api.with_state(|s| s.key_pairs.insert("aerolab-mydc_us-east-1".to_string()));

        let key = keys.make_key(Namespace::Server, "mydc").await.unwrap();
        assert!(key.path.is_file());
        api.with_state(|s| {
            assert_eq!(s.deleted_key_pairs, vec!["aerolab-mydc_us-east-1".to_string()]);
            assert!(s.key_pairs.contains("aerolab-mydc_us-east-1"));
        });
    }

    #[tokio::test]
    async fn test_make_key_replaces_stale_private_file() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeEc2::new());
        let keys = manager(api.clone(), dir.path());
        let path = keys.key_path(Namespace::Server, "mydc");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, "old key").await.unwrap();

        let key = keys.make_key(Namespace::Server, "mydc").await.unwrap();
        let contents = tokio::fs::read_to_string(&key.path).await.unwrap();
        assert!(contents.contains("BEGIN RSA PRIVATE KEY"));
        assert!(keys.get_key(Namespace::Server, "mydc").await.is_ok());
    }

    #[tokio::test]
    async fn test_namespaces_get_separate_keys() {
        let dir = tempfile::tempdir().unwrap();
        let keys = manager(Arc::new(FakeEc2::new()), dir.path());
        let server = keys.make_key(Namespace::Server, "mydc").await.unwrap();
        let client = keys.make_key(Namespace::Client, "mydc").await.unwrap();
        assert_ne!(server.path, client.path);
        assert_eq!(client.name, "aerolab_c-mydc_us-east-1");
    }

    #[tokio::test]
    async fn test_kill_key_removes_both_halves_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeEc2::new());
        let keys = manager(api.clone(), dir.path());

        let key = keys.make_key(Namespace::Server, "mydc").await.unwrap();
        keys.kill_key(Namespace::Server, "mydc").await;
        assert!(!key.path.exists());
        api.with_state(|s| assert!(s.key_pairs.is_empty()));

        // Second call has nothing to remove and must not panic
        keys.kill_key(Namespace::Server, "mydc").await;
    }
}
