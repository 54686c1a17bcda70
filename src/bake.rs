// Template Bake Pipeline
//
// Shared pieces of the bake: extra-tag validation, installer placement, and
// the scoped run that vacuums the ephemeral resource whenever the bake does
// not finish, including on cancellation.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{FileEntry, TemplateVersion};
use crate::error::{Error, Result};

/// Where the installer script is placed inside the ephemeral resource
pub const INSTALLER_PATH: &str = "/root/installer.sh";

/// Split `key=value` tags, rejecting malformed and reserved keys. The value
/// keeps any further `=`.
pub fn parse_extra_tags(tags: &[String], reserved: &[&str]) -> Result<Vec<(String, String)>> {
    tags.iter()
        .map(|tag| {
            let (key, value) = tag
                .split_once('=')
                .ok_or_else(|| Error::invalid(format!("tag '{}' must follow key=value format", tag)))?;
            if key.is_empty() {
                return Err(Error::invalid(format!("tag '{}' has an empty key", tag)));
            }
            if reserved.contains(&key) {
                return Err(Error::invalid(format!(
                    "tag key '{}' is used internally and cannot be set",
                    key
                )));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Caller files plus the installer script
pub fn bake_files(script: &[u8], files: &[FileEntry]) -> Vec<FileEntry> {
    let mut all = files.to_vec();
    all.push(FileEntry::new(INSTALLER_PATH, script));
    all
}

/// argv steps that make the installer executable and run it
pub fn installer_commands() -> [Vec<String>; 2] {
    [
        vec!["chmod".to_string(), "755".to_string(), INSTALLER_PATH.to_string()],
        vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            INSTALLER_PATH.to_string(),
        ],
    ]
}

/// Run `work`; if it fails or `cancel` fires first, run `vacuum` and report
/// a `Bake` error wrapping the cause.
pub async fn run_bake<T, W, V>(
    version: &TemplateVersion,
    cancel: &CancellationToken,
    work: W,
    vacuum: V,
) -> Result<T>
where
    W: Future<Output = Result<T>>,
    V: Future<Output = Result<()>>,
{
    info!(template = %version, "baking template");

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled(format!("bake of {}", version))),
        result = work => result,
    };

    match outcome {
        Ok(value) => {
            info!(template = %version, "template ready");
            Ok(value)
        }
        Err(cause) => {
            warn!(template = %version, error = %cause, "bake failed, vacuuming");
            if let Err(e) = vacuum.await {
                error!(template = %version, error = %e, "vacuum after failed bake also failed");
            }
            Err(Error::Bake {
                template: version.to_string(),
                source: Box::new(cause),
            })
        }
    }
}
