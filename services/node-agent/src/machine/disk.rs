//! Lazily created disk image.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info};

use crate::error::PlatformError;

/// Size of the per-host disk image.
pub const DISK_IMAGE_SIZE_BYTES: u64 = 128 * 1024 * 1024 * 1024;

/// Create a sparse disk image of `size_bytes` at `path` unless one exists.
///
/// An existing file is left untouched and counts as success.
pub fn ensure_disk_image(path: &Path, size_bytes: u64) -> Result<(), PlatformError> {
    let disk_error = |source: std::io::Error| PlatformError::DiskImage {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(disk_error)?;
    }

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => {
            file.set_len(size_bytes).map_err(disk_error)?;
            info!(path = %path.display(), size_bytes, "Created disk image");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            debug!(path = %path.display(), "Disk image already exists");
            Ok(())
        }
        Err(e) => Err(disk_error(e)),
    }
}
