//! Node identity and capacity advertised to the orchestrator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::{self, SystemResources};

/// Workloads advertised as schedulable on one node.
pub const DEFAULT_MAX_WORKLOADS: u32 = 110;

/// Port the agent's endpoint is advertised on.
pub const DEFAULT_DAEMON_PORT: u16 = 10250;

/// Interface whose IPv4 address is advertised as the node's internal IP
/// when no bridge interface is configured.
pub const DEFAULT_ADDRESS_INTERFACE: &str = "en0";

/// Guest operating systems the agent can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingSystem {
    MacOs,
    Linux,
    Windows,
}

impl OperatingSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingSystem::MacOs => "macos",
            OperatingSystem::Linux => "linux",
            OperatingSystem::Windows => "windows",
        }
    }

    /// Only macOS guests can be realized.
    pub fn is_supported(&self) -> bool {
        matches!(self, OperatingSystem::MacOs)
    }
}

impl fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown operating system: {0}")]
pub struct UnknownOperatingSystem(String);

impl FromStr for OperatingSystem {
    type Err = UnknownOperatingSystem;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "macos" | "darwin" => Ok(OperatingSystem::MacOs),
            "linux" => Ok(OperatingSystem::Linux),
            "windows" => Ok(OperatingSystem::Windows),
            _ => Err(UnknownOperatingSystem(s.to_string())),
        }
    }
}

/// Resources the node offers for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    /// Size of the host root filesystem.
    pub ephemeral_storage_bytes: u64,
    pub max_workloads: u32,
}

impl NodeCapacity {
    pub fn from_resources(resources: SystemResources) -> Self {
        Self {
            cpu_cores: resources.cpu_cores,
            memory_bytes: resources.total_memory_bytes,
            ephemeral_storage_bytes: resources.total_disk_bytes,
            max_workloads: DEFAULT_MAX_WORKLOADS,
        }
    }

    pub fn measure() -> Self {
        Self::from_resources(SystemResources::measure())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeAddressKind {
    InternalIp,
    Hostname,
}

/// An address the node is reachable at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub kind: NodeAddressKind,
    pub address: String,
}

/// Descriptive node information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_name: String,
    pub operating_system: OperatingSystem,
    pub architecture: String,
    pub os_family: String,
    /// Host kernel release, empty when it cannot be read.
    pub kernel_version: String,
    /// Host kernel name, e.g. `Darwin`.
    pub os_image: String,
    pub addresses: Vec<NodeAddress>,
    pub daemon_port: u16,
}

impl NodeInfo {
    /// Describes the host. The node name is always advertised as its
    /// hostname address.
    pub fn new(
        node_name: impl Into<String>,
        operating_system: OperatingSystem,
        daemon_port: u16,
    ) -> Self {
        let node_name = node_name.into();
        let kernel = resources::kernel_info();

        Self {
            addresses: vec![NodeAddress {
                kind: NodeAddressKind::Hostname,
                address: node_name.clone(),
            }],
            node_name,
            operating_system,
            architecture: std::env::consts::ARCH.to_string(),
            os_family: std::env::consts::FAMILY.to_string(),
            kernel_version: kernel
                .as_ref()
                .map(|k| k.release.clone())
                .unwrap_or_default(),
            os_image: kernel.map(|k| k.name).unwrap_or_default(),
            daemon_port,
        }
    }

    /// Advertises the IPv4 address of `interface` as the internal IP.
    /// Nothing is added when the interface has no IPv4 address.
    pub fn with_internal_ip(mut self, interface: &str) -> Self {
        if let Some(ip) = resources::interface_ipv4(interface) {
            self.addresses.insert(
                0,
                NodeAddress {
                    kind: NodeAddressKind::InternalIp,
                    address: ip.to_string(),
                },
            );
        }
        self
    }

    pub fn internal_ip(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.kind == NodeAddressKind::InternalIp)
            .map(|a| a.address.as_str())
    }
}
