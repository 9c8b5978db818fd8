//! vmlet Node Agent Library
//!
//! The node agent runs on a single macOS host and realizes orchestrator
//! workloads as local virtual machines. Each workload maps to exactly one
//! VM, sized from the workload's primary execution unit.
//!
//! ## Architecture
//!
//! ```text
//! WorkloadRegistry            (create / delete / get / list / status)
//! ├── ConfigurationBuilder    (resource request -> MachineConfiguration)
//! ├── InstanceController(uid) (start rendezvous, stop escalation)
//! │   └── dyn VmHandle        (platform VM, state notifications)
//! └── StatusProjector         (VmState -> WorkloadPhase)
//! ```
//!
//! ## Modules
//!
//! - `platform`: virtualization platform seam and the mock backend
//! - `machine`: machine configuration, devices, identity and disk image
//! - `instance`: per-VM lifecycle controller
//! - `status`: lifecycle state to workload status projection
//! - `registry`: orchestrator-facing workload registry
//! - `node`: node identity and capacity

pub mod config;
pub mod error;
pub mod instance;
pub mod machine;
pub mod node;
pub mod platform;
pub mod registry;
pub mod resources;
pub mod status;
pub mod workload;

// Re-export commonly used types
pub use error::{
    BuildError, ConfigError, InstanceError, PlatformError, RegistryError, StartFailure,
};
pub use instance::{ControllerOptions, GuiOptions, InstanceController, StopOutcome, StopPolicy};
pub use machine::{ConfigurationBuilder, MachineConfiguration};
pub use platform::{MockPlatform, Platform, VmHandle, VmState};
pub use registry::{RegistryOptions, WorkloadRegistry};
pub use workload::{
    ExecutionUnit, ResourceRequest, WorkloadDescriptor, WorkloadKey, WorkloadPhase,
    WorkloadStatus, WorkloadUid,
};
