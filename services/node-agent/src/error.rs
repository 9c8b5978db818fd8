//! Error taxonomy for the VM lifecycle subsystem.
//!
//! - `ConfigError`: a resource request or assembled configuration was rejected
//! - `PlatformError`: a virtualization platform call failed
//! - `InstanceError`: start never reached running, or stop could not complete
//! - `RegistryError`: what the orchestrator-facing surface returns

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::platform::VmState;
use crate::workload::{WorkloadKey, WorkloadUid};

/// The request or the assembled machine configuration is invalid.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cpu count {requested} outside allowed range [{min}, {max}]")]
    CpuCountOutOfRange { requested: u32, min: u32, max: u32 },

    #[error("memory size {requested} bytes outside allowed range [{min}, {max}]")]
    MemorySizeOutOfRange { requested: u64, min: u64, max: u64 },

    #[error("network interface {0} not found")]
    BridgeNotFound(String),

    #[error("configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// A call into the virtualization platform failed.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform call {call} failed: {message}")]
    Call { call: &'static str, message: String },

    #[error("{call} not allowed while instance is {state}")]
    InvalidState { call: &'static str, state: VmState },

    #[error("identity artifact {path} unavailable: {source}")]
    IdentityUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("disk image {path}: {source}")]
    DiskImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to enumerate host interfaces: {0}")]
    Interfaces(String),
}

impl PlatformError {
    pub fn call(call: &'static str, message: impl Into<String>) -> Self {
        Self::Call {
            call,
            message: message.into(),
        }
    }
}

/// Failure of `ConfigurationBuilder::build`.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Invalid(#[from] ConfigError),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl BuildError {
    /// Returns true if the request itself was at fault.
    pub fn is_invalid(&self) -> bool {
        matches!(self, BuildError::Invalid(_))
    }
}

/// Why an instance never reached `Running`.
#[derive(Debug, Error)]
pub enum StartFailure {
    #[error("start call rejected: {0}")]
    Platform(#[source] PlatformError),

    #[error("instance entered {0} before running")]
    Terminated(VmState),

    #[error("state notifications ended before the instance was running")]
    NotificationsClosed,

    #[error("instance not running within {0:?}")]
    DeadlineElapsed(Duration),

    #[error("agent is shutting down")]
    Cancelled,

    #[error("instance was already started")]
    AlreadyStarted,
}

/// Errors raised by `InstanceController`.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("instance failed to start: {0}")]
    StartFailed(#[from] StartFailure),

    #[error("forced stop failed after {attempts} stop attempts: {source}")]
    StopIncomplete {
        attempts: u32,
        #[source]
        source: PlatformError,
    },

    #[error("stop aborted after {attempts} stop attempts")]
    StopAborted { attempts: u32 },
}

/// Errors returned by the workload registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("workload {0} has no execution unit")]
    NoExecutionUnit(WorkloadKey),

    #[error("workload {0} is already registered")]
    AlreadyExists(WorkloadKey),

    #[error("workload uid {0} already has an instance")]
    UidInUse(WorkloadUid),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("failed to create instance: {0}")]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

impl RegistryError {
    /// Returns true if the request was rejected as `ConfigInvalid`.
    pub fn is_config_invalid(&self) -> bool {
        matches!(self, RegistryError::Build(e) if e.is_invalid())
    }

    /// Returns true if the instance never reached running.
    pub fn is_start_failed(&self) -> bool {
        matches!(self, RegistryError::Instance(InstanceError::StartFailed(_)))
    }
}
