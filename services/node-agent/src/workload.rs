//! Workload descriptors as received from the orchestrator.
//!
//! A workload maps 1:1 to a virtual machine instance. Only the first
//! execution unit is modeled: its resource request sizes the machine and its
//! name is used when reporting readiness.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Orchestrator-facing identity of a workload (namespace + name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Process-unique workload id, assigned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadUid(Uuid);

impl WorkloadUid {
    /// Generates a fresh random uid.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for WorkloadUid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkloadUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for WorkloadUid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Requested machine size. Zero means "compute a default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub vcpu_count: u32,
    pub memory_bytes: u64,
}

impl ResourceRequest {
    pub fn new(vcpu_count: u32, memory_bytes: u64) -> Self {
        Self {
            vcpu_count,
            memory_bytes,
        }
    }
}

/// Container-equivalent unit of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionUnit {
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequest,
}

impl ExecutionUnit {
    pub fn new(name: impl Into<String>, resources: ResourceRequest) -> Self {
        Self {
            name: name.into(),
            resources,
        }
    }
}

/// Externally visible workload phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Readiness of one execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub name: String,
    pub ready: bool,
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Cached workload status, overwritten on every status query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub phase: WorkloadPhase,
    #[serde(default)]
    pub units: Vec<UnitStatus>,
}

/// The orchestrator's request record for one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDescriptor {
    pub key: WorkloadKey,
    pub uid: WorkloadUid,
    pub created_at: DateTime<Utc>,
    pub units: Vec<ExecutionUnit>,
    #[serde(default)]
    pub status: WorkloadStatus,
}

impl WorkloadDescriptor {
    /// Create a descriptor with a fresh uid and a single execution unit.
    pub fn new(key: WorkloadKey, unit: ExecutionUnit) -> Self {
        Self {
            key,
            uid: WorkloadUid::new(),
            created_at: Utc::now(),
            units: vec![unit],
            status: WorkloadStatus::default(),
        }
    }

    pub fn with_uid(mut self, uid: WorkloadUid) -> Self {
        self.uid = uid;
        self
    }

    /// The first execution unit; additional units are not modeled.
    pub fn primary_unit(&self) -> Option<&ExecutionUnit> {
        self.units.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = WorkloadKey::new("default", "builder-0");
        assert_eq!(key.to_string(), "default/builder-0");
    }

    #[test]
    fn test_uid_roundtrip() {
        let uid = WorkloadUid::new();
        let parsed: WorkloadUid = uid.to_string().parse().unwrap();
        assert_eq!(uid, parsed);
        assert!("not-a-uid".parse::<WorkloadUid>().is_err());
    }

    #[test]
    fn test_primary_unit_is_first() {
        let mut descriptor = WorkloadDescriptor::new(
            WorkloadKey::new("default", "ci"),
            ExecutionUnit::new("xcode", ResourceRequest::new(4, 0)),
        );
        descriptor
            .units
            .push(ExecutionUnit::new("sidecar", ResourceRequest::default()));

        let primary = descriptor.primary_unit().unwrap();
        assert_eq!(primary.name, "xcode");
        assert_eq!(primary.resources.vcpu_count, 4);
    }

    #[test]
    fn test_new_descriptor_status_is_pending() {
        let descriptor = WorkloadDescriptor::new(
            WorkloadKey::new("default", "ci"),
            ExecutionUnit::new("xcode", ResourceRequest::default()),
        );
        assert_eq!(descriptor.status.phase, WorkloadPhase::Pending);
        assert!(descriptor.status.units.is_empty());
    }

    #[test]
    fn test_phase_wire_names() {
        let json = serde_json::to_string(&WorkloadPhase::Succeeded).unwrap();
        assert_eq!(json, "\"Succeeded\"");
    }
}
