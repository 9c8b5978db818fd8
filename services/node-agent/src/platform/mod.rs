//! Virtualization platform interface.
//!
//! The agent consumes a native virtualization API through two capability
//! traits:
//! - `Platform`: host-level queries (bounds, interfaces) and instance creation
//! - `VmHandle`: one virtual machine (start, stop, state, notifications)
//!
//! A scripted in-memory implementation lives in `mock`.

pub mod mock;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::machine::MachineConfiguration;

pub use mock::{BootOutcome, MockBehavior, MockPlatform, MockVm};

/// Lifecycle state reported by a virtual machine.
///
/// ```text
/// Starting -> Running -> Stopping -> Stopped
///     |          |          |
///     +--------> Error <----+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// `Stopped` and `Error` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Whether `next` is a permitted successor of this state.
    pub fn can_transition_to(&self, next: VmState) -> bool {
        match (self, next) {
            (Self::Starting, Self::Running)
            | (Self::Running, Self::Stopping)
            | (Self::Stopping, Self::Stopped) => true,
            (from, Self::Error) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU and memory limits the platform accepts for one machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBounds {
    pub min_cpu: u32,
    pub max_cpu: u32,
    pub min_memory_bytes: u64,
    pub max_memory_bytes: u64,
}

impl ResourceBounds {
    pub fn clamp_cpu(&self, cpu: u32) -> u32 {
        cpu.min(self.max_cpu).max(self.min_cpu)
    }

    pub fn clamp_memory(&self, bytes: u64) -> u64 {
        bytes.min(self.max_memory_bytes).max(self.min_memory_bytes)
    }

    pub fn cpu_in_range(&self, cpu: u32) -> bool {
        (self.min_cpu..=self.max_cpu).contains(&cpu)
    }

    pub fn memory_in_range(&self, bytes: u64) -> bool {
        (self.min_memory_bytes..=self.max_memory_bytes).contains(&bytes)
    }
}

/// A host network interface that can back a bridged attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    /// BSD name such as `en0`.
    pub identifier: String,
    pub display_name: String,
}

impl HostInterface {
    pub fn new(identifier: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            display_name: display_name.into(),
        }
    }
}

/// Stream of state-change notifications for one machine.
pub type StateStream = Pin<Box<dyn Stream<Item = VmState> + Send>>;

/// Host-level virtualization capabilities.
pub trait Platform: Send + Sync {
    /// Allowed CPU and memory range for one machine.
    fn bounds(&self) -> ResourceBounds;

    /// Interfaces that can be bridged into a guest.
    fn host_interfaces(&self) -> Result<Vec<HostInterface>, PlatformError>;

    /// Whether a trackpad pointing device can be attached.
    fn supports_trackpad(&self) -> bool;

    /// Structural validation of an assembled configuration.
    fn validate(&self, config: &MachineConfiguration) -> Result<(), PlatformError>;

    /// Create an instance from a validated configuration. The instance is
    /// not started.
    fn new_instance(&self, config: &MachineConfiguration)
        -> Result<Arc<dyn VmHandle>, PlatformError>;
}

/// One virtual machine owned by the platform.
#[async_trait]
pub trait VmHandle: Send + Sync {
    /// Begin booting. Errors returned here are synchronous start failures;
    /// later failures arrive as an `Error` notification.
    async fn start(&self) -> Result<(), PlatformError>;

    /// Whether the guest can currently accept a cooperative stop request.
    fn can_request_stop(&self) -> bool;

    /// Ask the guest to shut down. Returns whether the request was accepted.
    async fn request_stop(&self) -> Result<bool, PlatformError>;

    /// Forced stop.
    async fn stop(&self) -> Result<(), PlatformError>;

    /// Current state. Never blocks.
    fn state(&self) -> VmState;

    /// Subscribe to state changes from this point on.
    fn state_changes(&self) -> StateStream;

    /// Open a graphical window onto the guest display.
    fn start_graphic_application(&self, width: u32, height: u32) -> Result<(), PlatformError>;
}
