// Error Types
//
// One error enum for the whole library. Per-node failures keep their node
// numbers so callers can report or retry exactly the nodes that failed.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::backend::NodeOutput;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// How a remote or local command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// The command ran and exited with a non-zero code
    Code(i32),
    /// The command was killed by a signal
    Signal,
    /// The command never ran: connection refused, auth failure, missing binary
    Transport,
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Code(code) => write!(f, "exit code {}", code),
            ExitKind::Signal => write!(f, "killed by signal"),
            ExitKind::Transport => write!(f, "transport failure"),
        }
    }
}

/// Main error type for engine operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Provider listing failed
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Provider throttled the request
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// A resource carries a discovery marker that cannot be decoded
    #[error("corrupt resource {resource}: {detail}; investigate manually")]
    CorruptResource { resource: String, detail: String },

    /// SSH did not come up on every node within the shared budget
    #[error(
        "cluster {cluster}: nodes {not_ready:?} not reachable over ssh within {budget_secs}s (ready: {ready:?})"
    )]
    BootstrapTimeout {
        cluster: String,
        ready: Vec<u32>,
        not_ready: Vec<u32>,
        budget_secs: u64,
    },

    /// One or more nodes failed during a fan-out
    #[error("{operation} failed on cluster {cluster}: {}", render_nodes(.failures))]
    PartialFailure {
        cluster: String,
        operation: String,
        failures: BTreeMap<u32, Error>,
    },

    /// Commands failed on some nodes; the outputs of the others are kept
    #[error("run failed on cluster {cluster}: {}", render_nodes(.failures))]
    RunFailure {
        cluster: String,
        outputs: Vec<NodeOutput>,
        failures: BTreeMap<u32, Error>,
    },

    /// One or more clusters failed during a multi-cluster operation
    #[error("{operation} failed: {}", render_clusters(.failures))]
    MultiCluster {
        operation: String,
        failures: Vec<(String, Error)>,
    },

    /// Node creation stopped mid-batch
    #[error("cluster {cluster}: creating node {failed_node} failed (created: {created:?}): {source}")]
    ClusterGrowth {
        cluster: String,
        created: Vec<u32>,
        failed_node: u32,
        #[source]
        source: Box<Error>,
    },

    /// A command ran but did not succeed
    #[error("command `{command}` on {target} failed ({exit}): {output}")]
    Exec {
        target: String,
        command: String,
        exit: ExitKind,
        output: String,
    },

    /// File copy to a node failed
    #[error("transfer to {target} failed: {detail}")]
    Transfer { target: String, detail: String },

    /// Template bake failed; the ephemeral resource has been vacuumed
    #[error("bake of template {template} failed: {source}")]
    Bake {
        template: String,
        #[source]
        source: Box<Error>,
    },

    /// Key material is missing or unusable
    #[error("key error: {0}")]
    Key(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The backend has no such capability
    #[error("{backend} backend does not support {operation}")]
    NotSupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// The backend exists but the operation has not been written yet
    #[error("{backend} backend: {operation} is not implemented")]
    NotImplemented {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn render_nodes(failures: &BTreeMap<u32, Error>) -> String {
    failures
        .iter()
        .map(|(node, err)| format!("node {}: {}", node, err))
        .collect::<Vec<_>>()
        .join("; ")
}

fn render_clusters(failures: &[(String, Error)]) -> String {
    failures
        .iter()
        .map(|(cluster, err)| format!("{}: {}", cluster, err))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a discovery error with the given message
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create an input validation error with the given message
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a key error with the given message
    pub fn key(msg: impl Into<String>) -> Self {
        Self::Key(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn corrupt(resource: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::CorruptResource {
            resource: resource.into(),
            detail: detail.into(),
        }
    }

    pub fn transfer(target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Transfer {
            target: target.into(),
            detail: detail.into(),
        }
    }

    /// True when the provider asked us to slow down
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimit(_))
    }

    /// True when the operation was stopped through its cancellation token
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Node numbers that failed, for errors that carry per-node detail
    pub fn failed_nodes(&self) -> Vec<u32> {
        match self {
            Error::PartialFailure { failures, .. } | Error::RunFailure { failures, .. } => {
                failures.keys().copied().collect()
            }
            Error::BootstrapTimeout { not_ready, .. } => not_ready.clone(),
            Error::ClusterGrowth { failed_node, .. } => vec![*failed_node],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a fan-out reports every failing node, not just the first
    #[test]
    fn story_partial_failure_names_every_node() {
        let mut failures = BTreeMap::new();
        failures.insert(
            2,
            Error::Exec {
                target: "10.0.0.2".to_string(),
                command: "systemctl restart db".to_string(),
                exit: ExitKind::Code(3),
                output: "unit not found".to_string(),
            },
        );
        failures.insert(5, Error::transfer("10.0.0.5", "no space left on device"));

        let err = Error::PartialFailure {
            cluster: "mydc".to_string(),
            operation: "run_commands".to_string(),
            failures,
        };

        let msg = err.to_string();
        assert!(msg.contains("cluster mydc"));
        assert!(msg.contains("node 2: command `systemctl restart db`"));
        assert!(msg.contains("exit code 3"));
        assert!(msg.contains("node 5: transfer to 10.0.0.5"));
        assert_eq!(err.failed_nodes(), vec![2, 5]);
    }

    /// Story: bootstrap timeouts tell the operator which nodes never came up
    #[test]
    fn story_bootstrap_timeout_lists_ready_and_stuck_nodes() {
        let err = Error::BootstrapTimeout {
            cluster: "mydc".to_string(),
            ready: vec![1],
            not_ready: vec![2],
            budget_secs: 600,
        };
        let msg = err.to_string();
        assert!(msg.contains("nodes [2] not reachable"));
        assert!(msg.contains("ready: [1]"));
        assert!(msg.contains("600s"));
        assert_eq!(err.failed_nodes(), vec![2]);
    }

    /// Story: a corrupt node tag is fatal and points at the resource
    #[test]
    fn story_corrupt_resource_requires_manual_investigation() {
        let err = Error::corrupt("i-0abc", "node number tag 'two' is not an integer");
        let msg = err.to_string();
        assert!(msg.contains("i-0abc"));
        assert!(msg.contains("investigate manually"));
    }

    /// Story: a bake failure keeps the underlying cause reachable
    #[test]
    fn story_bake_error_wraps_installer_failure() {
        let cause = Error::Exec {
            target: "aerotmpl-ubuntu-22.04-7.0-amd64".to_string(),
            command: "/bin/bash -c /root/install.sh".to_string(),
            exit: ExitKind::Code(1),
            output: "apt failed".to_string(),
        };
        let err = Error::Bake {
            template: "ubuntu:22.04:7.0:amd64".to_string(),
            source: Box::new(cause),
        };
        assert!(err.to_string().contains("ubuntu:22.04:7.0:amd64"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert!(source.unwrap_or_default().contains("apt failed"));
    }

    #[test]
    fn rate_limit_and_cancel_predicates() {
        assert!(Error::RateLimit("RequestLimitExceeded".into()).is_rate_limit());
        assert!(!Error::discovery("boom").is_rate_limit());
        assert!(Error::Cancelled("bake".into()).is_cancelled());
    }

    #[test]
    fn multi_cluster_error_lists_each_cluster() {
        let err = Error::MultiCluster {
            operation: "cluster_stop".to_string(),
            failures: vec![
                ("a".to_string(), Error::not_found("cluster a")),
                ("b".to_string(), Error::discovery("throttled")),
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("cluster_stop failed"));
        assert!(msg.contains("a: not found: cluster a"));
        assert!(msg.contains("b: discovery error: throttled"));
    }
}
