// Namespaces
//
// Server and client resources live side by side in the same provider
// account. Each namespace owns a disjoint tag schema (cloud) and name
// prefix (container runtimes).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tag carrying the namespace marker on cloud resources
pub const USED_BY_TAG: &str = "UsedBy";
/// Cloud architecture tag, value `amd` or `arm`
pub const ARCH_TAG: &str = "Arch";
/// Display name tag
pub const NAME_TAG: &str = "Name";

/// Cloud tag keys for one namespace
#[derive(Debug, PartialEq, Eq)]
pub struct TagSchema {
    pub used_by_value: &'static str,
    pub cluster_name: &'static str,
    pub node_number: &'static str,
    pub operating_system: &'static str,
    pub os_version: &'static str,
    pub product_version: &'static str,
    /// Marks an ephemeral bake instance
    pub template_build: &'static str,
}

impl TagSchema {
    /// Keys callers may not set through extra tags
    pub fn reserved_keys(&self) -> [&'static str; 9] {
        [
            USED_BY_TAG,
            self.cluster_name,
            self.node_number,
            self.operating_system,
            self.os_version,
            self.product_version,
            self.template_build,
            ARCH_TAG,
            NAME_TAG,
        ]
    }
}

static SERVER_TAGS: TagSchema = TagSchema {
    used_by_value: "aerolab4",
    cluster_name: "Aerolab4ClusterName",
    node_number: "Aerolab4NodeNumber",
    operating_system: "Aerolab4OperatingSystem",
    os_version: "Aerolab4OperatingSystemVersion",
    product_version: "Aerolab4AerospikeVersion",
    template_build: "Aerolab4TemplateBuild",
};

static CLIENT_TAGS: TagSchema = TagSchema {
    used_by_value: "aerolab4client",
    cluster_name: "Aerolab4clientClusterName",
    node_number: "Aerolab4clientNodeNumber",
    operating_system: "Aerolab4clientOperatingSystem",
    os_version: "Aerolab4clientOperatingSystemVersion",
    product_version: "Aerolab4clientAerospikeVersion",
    template_build: "Aerolab4clientTemplateBuild",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    #[default]
    Server,
    Client,
}

impl Namespace {
    pub fn tags(self) -> &'static TagSchema {
        match self {
            Self::Server => &SERVER_TAGS,
            Self::Client => &CLIENT_TAGS,
        }
    }

    /// Docker container and image prefix
    pub fn docker_prefix(self) -> &'static str {
        match self {
            Self::Server => "aerolab-",
            Self::Client => "aerolab_c-",
        }
    }

    /// Docker bake container prefix
    pub fn docker_bake_prefix(self) -> &'static str {
        match self {
            Self::Server => "aerotmpl-",
            Self::Client => "aerotmpl_c-",
        }
    }

    /// LXC container prefix
    pub fn lxc_prefix(self) -> &'static str {
        match self {
            Self::Server => "aero-",
            Self::Client => "aero_c-",
        }
    }

    /// LXC template container prefix
    pub fn lxc_template_prefix(self) -> &'static str {
        match self {
            Self::Server => "aero_tpl-",
            Self::Client => "aero_ctpl-",
        }
    }

    /// LXC container used while a template is being baked
    pub fn lxc_bake_prefix(self) -> &'static str {
        match self {
            Self::Server => "aero_bake-",
            Self::Client => "aero_cbake-",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
