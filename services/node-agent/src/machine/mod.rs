//! Machine configuration.
//!
//! Turns an abstract resource request into a validated, immutable
//! `MachineConfiguration`.
//!
//! ## Components
//!
//! - `builder`: default resolution, bound checks and final validation
//! - `devices`: the fixed device set
//! - `identity`: persistent platform-identity bundle
//! - `disk`: lazily created disk image

mod builder;
mod devices;
mod disk;
mod identity;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use builder::{
    default_cpu_count, default_memory_size, ConfigurationBuilder, DEFAULT_MEMORY_BYTES,
};
pub use devices::{
    AudioDevice, AudioStream, BootLoader, Display, GraphicsDevice, KeyboardDevice,
    NetworkAttachment, NetworkDevice, PointingDevice, StorageDevice,
};
pub use disk::{ensure_disk_image, DISK_IMAGE_SIZE_BYTES};
pub use identity::{IdentityBundle, IdentityPaths};

/// File name of the per-host disk image inside the data directory.
pub const DISK_IMAGE_FILE: &str = "Disk.img";

/// Directory holding the identity artifacts inside the data directory.
pub const IDENTITY_DIR: &str = "identity";

/// Where persistent machine state lives on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineLayout {
    data_dir: PathBuf,
}

impl MachineLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn disk_image(&self) -> PathBuf {
        self.data_dir.join(DISK_IMAGE_FILE)
    }

    pub fn identity_dir(&self) -> PathBuf {
        self.data_dir.join(IDENTITY_DIR)
    }

    pub fn identity_paths(&self) -> IdentityPaths {
        IdentityPaths::under(&self.identity_dir())
    }
}

/// A fully resolved machine. Built once per instance, never mutated.
#[derive(Debug, Clone)]
pub struct MachineConfiguration {
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub boot_loader: BootLoader,
    pub storage: Vec<StorageDevice>,
    pub network: Vec<NetworkDevice>,
    pub graphics: Vec<GraphicsDevice>,
    pub pointing: Vec<PointingDevice>,
    pub keyboards: Vec<KeyboardDevice>,
    pub audio: Vec<AudioDevice>,
    /// Shared by every machine built on this host.
    pub identity: Arc<IdentityBundle>,
    pub disk_image: PathBuf,
}
