//! Platform identity bundle.
//!
//! Three artifacts give a machine a stable identity across agent restarts:
//! auxiliary boot storage, hardware model and machine identifier. They are
//! created once at provisioning time and only ever read here.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::PlatformError;

pub const AUXILIARY_STORAGE_FILE: &str = "AuxiliaryStorage";
pub const HARDWARE_MODEL_FILE: &str = "HardwareModel";
pub const MACHINE_IDENTIFIER_FILE: &str = "MachineIdentifier";

/// Fixed on-disk locations of the identity artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPaths {
    pub auxiliary_storage: PathBuf,
    pub hardware_model: PathBuf,
    pub machine_identifier: PathBuf,
}

impl IdentityPaths {
    pub fn under(dir: &Path) -> Self {
        Self {
            auxiliary_storage: dir.join(AUXILIARY_STORAGE_FILE),
            hardware_model: dir.join(HARDWARE_MODEL_FILE),
            machine_identifier: dir.join(MACHINE_IDENTIFIER_FILE),
        }
    }
}

/// Loaded identity artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityBundle {
    /// Opened by the platform in place, so only the path is kept.
    pub auxiliary_storage: PathBuf,
    pub hardware_model: Vec<u8>,
    pub machine_identifier: Vec<u8>,
}

impl IdentityBundle {
    /// Load the bundle. Any missing or empty artifact is an error; nothing is
    /// ever regenerated.
    pub fn load(paths: &IdentityPaths) -> Result<Self, PlatformError> {
        let metadata = std::fs::metadata(&paths.auxiliary_storage)
            .map_err(|source| unavailable(&paths.auxiliary_storage, source))?;
        if !metadata.is_file() {
            return Err(unavailable(
                &paths.auxiliary_storage,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let hardware_model = read_artifact(&paths.hardware_model)?;
        let machine_identifier = read_artifact(&paths.machine_identifier)?;

        debug!(
            auxiliary_storage = %paths.auxiliary_storage.display(),
            hardware_model_len = hardware_model.len(),
            machine_identifier_len = machine_identifier.len(),
            "Loaded platform identity"
        );

        Ok(Self {
            auxiliary_storage: paths.auxiliary_storage.clone(),
            hardware_model,
            machine_identifier,
        })
    }
}

fn read_artifact(path: &Path) -> Result<Vec<u8>, PlatformError> {
    let data = std::fs::read(path).map_err(|source| unavailable(path, source))?;
    if data.is_empty() {
        return Err(unavailable(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, "artifact is empty"),
        ));
    }
    Ok(data)
}

fn unavailable(path: &Path, source: std::io::Error) -> PlatformError {
    PlatformError::IdentityUnavailable {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provision(dir: &Path) -> IdentityPaths {
        let paths = IdentityPaths::under(dir);
        std::fs::write(&paths.auxiliary_storage, b"aux").unwrap();
        std::fs::write(&paths.hardware_model, b"model").unwrap();
        std::fs::write(&paths.machine_identifier, b"machine").unwrap();
        paths
    }

    #[test]
    fn test_load_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let paths = provision(dir.path());

        let bundle = IdentityBundle::load(&paths).unwrap();
        assert_eq!(bundle.auxiliary_storage, paths.auxiliary_storage);
        assert_eq!(bundle.hardware_model, b"model");
        assert_eq!(bundle.machine_identifier, b"machine");
    }

    #[test]
    fn test_load_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let paths = provision(dir.path());

        let first = IdentityBundle::load(&paths).unwrap();
        let second = IdentityBundle::load(&paths).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let paths = provision(dir.path());
        std::fs::remove_file(&paths.machine_identifier).unwrap();

        let err = IdentityBundle::load(&paths).unwrap_err();
        match err {
            PlatformError::IdentityUnavailable { path, .. } => {
                assert_eq!(path, paths.machine_identifier)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let paths = provision(dir.path());
        std::fs::write(&paths.hardware_model, b"").unwrap();

        assert!(IdentityBundle::load(&paths).is_err());
    }
}
