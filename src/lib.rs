// Clusterlab Library
//
// Orchestration engine for lab database clusters. One `Backend` per
// provider; `ClusterManager` composes them into lifecycle operations.

// Module declarations
pub mod aws;
pub mod backend;
pub mod bake;
pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod docker;
pub mod ec2;
pub mod error;
pub mod exec;
pub mod fanout;
pub mod gcp;
pub mod keys;
pub mod lxc;
pub mod namespace;
pub mod retry;

#[cfg(test)]
mod testing;

// Re-export public types and functions
pub use backend::{connect, Arch, Backend, DeployExtra, FileEntry, NodeOutput, TemplateVersion};
pub use cluster::{ClusterManager, ClusterSummary, Installer, NodeSummary};
pub use config::{load_config, save_config, BackendKind, EngineConfig};
pub use error::{Error, ExitKind, Result};
pub use namespace::Namespace;
