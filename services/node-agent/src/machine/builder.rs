//! Configuration builder.
//!
//! Zero-valued requests resolve to defaults clamped into the platform
//! bounds. Explicit values outside the bounds are rejected, never clamped.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tracing::{debug, info};

use super::devices::{
    AudioDevice, BootLoader, GraphicsDevice, KeyboardDevice, NetworkAttachment, NetworkDevice,
    PointingDevice, StorageDevice,
};
use super::disk::{ensure_disk_image, DISK_IMAGE_SIZE_BYTES};
use super::identity::IdentityBundle;
use super::{MachineConfiguration, MachineLayout};
use crate::error::{BuildError, ConfigError};
use crate::platform::{Platform, ResourceBounds};
use crate::resources;
use crate::workload::ResourceRequest;

/// Memory used when the request leaves it unset.
pub const DEFAULT_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// One less than the host's logical CPUs (at least one), clamped into bounds.
pub fn default_cpu_count(host_cpus: u32, bounds: &ResourceBounds) -> u32 {
    bounds.clamp_cpu(host_cpus.saturating_sub(1).max(1))
}

pub fn default_memory_size(bounds: &ResourceBounds) -> u64 {
    bounds.clamp_memory(DEFAULT_MEMORY_BYTES)
}

/// Builds machine configurations against one platform.
pub struct ConfigurationBuilder {
    platform: Arc<dyn Platform>,
    layout: MachineLayout,
    host_cpus: u32,
    disk_size_bytes: u64,
    identity: OnceLock<Arc<IdentityBundle>>,
}

impl ConfigurationBuilder {
    pub fn new(platform: Arc<dyn Platform>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            platform,
            layout: MachineLayout::new(data_dir),
            host_cpus: resources::host_cpu_count(),
            disk_size_bytes: DISK_IMAGE_SIZE_BYTES,
            identity: OnceLock::new(),
        }
    }

    /// Override the host CPU count used for defaults.
    pub fn with_host_cpus(mut self, host_cpus: u32) -> Self {
        self.host_cpus = host_cpus;
        self
    }

    /// Override the size of a newly created disk image.
    pub fn with_disk_size(mut self, bytes: u64) -> Self {
        self.disk_size_bytes = bytes;
        self
    }

    pub fn layout(&self) -> &MachineLayout {
        &self.layout
    }

    /// Build and validate a configuration for `request`.
    ///
    /// `bridge` names the host interface to bridge; `None` or an empty name
    /// selects NAT.
    pub fn build(
        &self,
        request: ResourceRequest,
        bridge: Option<&str>,
    ) -> Result<MachineConfiguration, BuildError> {
        let bounds = self.platform.bounds();
        let cpu_count = self.resolve_cpu_count(request.vcpu_count, &bounds)?;
        let memory_bytes = resolve_memory_size(request.memory_bytes, &bounds)?;

        let identity = self.identity()?;

        let disk_image = self.layout.disk_image();
        ensure_disk_image(&disk_image, self.disk_size_bytes)?;

        let network = self.network_device(bridge)?;

        let mut pointing = vec![PointingDevice::UsbScreenCoordinate];
        if self.platform.supports_trackpad() {
            pointing.push(PointingDevice::Trackpad);
        } else {
            debug!("Trackpad not supported by platform, skipping");
        }

        let config = MachineConfiguration {
            cpu_count,
            memory_bytes,
            boot_loader: BootLoader::MacOs,
            storage: vec![StorageDevice::disk_image(disk_image.clone())],
            network: vec![network],
            graphics: vec![GraphicsDevice::default()],
            pointing,
            keyboards: vec![KeyboardDevice::Usb],
            audio: vec![AudioDevice::default()],
            identity,
            disk_image,
        };

        self.platform
            .validate(&config)
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;

        info!(
            cpu_count,
            memory_mib = memory_bytes / (1024 * 1024),
            network = ?config.network[0].attachment,
            "Built machine configuration"
        );

        Ok(config)
    }

    fn resolve_cpu_count(&self, requested: u32, bounds: &ResourceBounds) -> Result<u32, ConfigError> {
        if requested == 0 {
            return Ok(default_cpu_count(self.host_cpus, bounds));
        }
        if !bounds.cpu_in_range(requested) {
            return Err(ConfigError::CpuCountOutOfRange {
                requested,
                min: bounds.min_cpu,
                max: bounds.max_cpu,
            });
        }
        Ok(requested)
    }

    /// The identity bundle is loaded once and shared by every machine.
    fn identity(&self) -> Result<Arc<IdentityBundle>, BuildError> {
        if let Some(bundle) = self.identity.get() {
            return Ok(Arc::clone(bundle));
        }
        let loaded = Arc::new(IdentityBundle::load(&self.layout.identity_paths())?);
        Ok(Arc::clone(self.identity.get_or_init(|| loaded)))
    }

    fn network_device(&self, bridge: Option<&str>) -> Result<NetworkDevice, BuildError> {
        let attachment = match bridge.filter(|name| !name.is_empty()) {
            None => NetworkAttachment::Nat,
            Some(name) => {
                let interfaces = self.platform.host_interfaces()?;
                if !interfaces.iter().any(|iface| iface.identifier == name) {
                    return Err(ConfigError::BridgeNotFound(name.to_string()).into());
                }
                NetworkAttachment::Bridged {
                    interface: name.to_string(),
                }
            }
        };
        Ok(NetworkDevice { attachment })
    }
}

fn resolve_memory_size(requested: u64, bounds: &ResourceBounds) -> Result<u64, ConfigError> {
    if requested == 0 {
        return Ok(default_memory_size(bounds));
    }
    if !bounds.memory_in_range(requested) {
        return Err(ConfigError::MemorySizeOutOfRange {
            requested,
            min: bounds.min_memory_bytes,
            max: bounds.max_memory_bytes,
        });
    }
    Ok(requested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{HostInterface, MockPlatform};
    use rstest::rstest;
    use tempfile::TempDir;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn bounds(min_cpu: u32, max_cpu: u32) -> ResourceBounds {
        ResourceBounds {
            min_cpu,
            max_cpu,
            min_memory_bytes: GIB,
            max_memory_bytes: 16 * GIB,
        }
    }

    fn provisioned_dir() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let paths = MachineLayout::new(dir.path()).identity_paths();
        std::fs::create_dir_all(dir.path().join(crate::machine::IDENTITY_DIR)).unwrap();
        std::fs::write(&paths.auxiliary_storage, b"aux").unwrap();
        std::fs::write(&paths.hardware_model, b"model").unwrap();
        std::fs::write(&paths.machine_identifier, b"machine").unwrap();
        dir
    }

    fn builder(platform: MockPlatform, dir: &TempDir) -> ConfigurationBuilder {
        ConfigurationBuilder::new(Arc::new(platform), dir.path())
            .with_host_cpus(8)
            .with_disk_size(1024 * 1024)
    }

    #[rstest]
    #[case(8, bounds(1, 64), 7)]
    #[case(1, bounds(1, 64), 1)]
    #[case(2, bounds(1, 64), 1)]
    #[case(16, bounds(1, 4), 4)]
    #[case(1, bounds(2, 4), 2)]
    fn test_default_cpu_count(#[case] host: u32, #[case] b: ResourceBounds, #[case] want: u32) {
        assert_eq!(default_cpu_count(host, &b), want);
    }

    #[rstest]
    #[case(bounds(1, 4), 4 * GIB)]
    #[case(ResourceBounds { max_memory_bytes: 2 * GIB, ..bounds(1, 4) }, 2 * GIB)]
    #[case(ResourceBounds { min_memory_bytes: 8 * GIB, ..bounds(1, 4) }, 8 * GIB)]
    fn test_default_memory_size(#[case] b: ResourceBounds, #[case] want: u64) {
        assert_eq!(default_memory_size(&b), want);
    }

    #[test]
    fn test_build_with_defaults() {
        let dir = provisioned_dir();
        let builder = builder(MockPlatform::new().with_bounds(bounds(1, 4)), &dir);

        let config = builder.build(ResourceRequest::default(), None).unwrap();
        assert_eq!(config.cpu_count, 4);
        assert_eq!(config.memory_bytes, 4 * GIB);
        assert_eq!(config.network[0].attachment, NetworkAttachment::Nat);
        assert!(config.disk_image.exists());
    }

    #[test]
    fn test_build_attaches_fixed_devices() {
        let dir = provisioned_dir();
        let builder = builder(MockPlatform::new(), &dir);

        let config = builder
            .build(ResourceRequest::new(2, 4 * GIB), Some("en0"))
            .unwrap();
        assert_eq!(config.boot_loader, BootLoader::MacOs);
        assert_eq!(config.storage.len(), 1);
        assert_eq!(config.graphics.len(), 1);
        assert_eq!(config.keyboards, vec![KeyboardDevice::Usb]);
        assert_eq!(config.audio[0].streams.len(), 2);
        assert_eq!(
            config.pointing,
            vec![PointingDevice::UsbScreenCoordinate, PointingDevice::Trackpad]
        );
        assert_eq!(
            config.network[0].attachment,
            NetworkAttachment::Bridged {
                interface: "en0".to_string()
            }
        );
    }

    #[test]
    fn test_missing_trackpad_is_tolerated() {
        let dir = provisioned_dir();
        let builder = builder(MockPlatform::new().without_trackpad(), &dir);

        let config = builder.build(ResourceRequest::default(), None).unwrap();
        assert_eq!(config.pointing, vec![PointingDevice::UsbScreenCoordinate]);
    }

    #[rstest]
    #[case(ResourceRequest::new(1, 0))]
    #[case(ResourceRequest::new(5, 0))]
    #[case(ResourceRequest::new(0, GIB / 2))]
    #[case(ResourceRequest::new(0, 32 * GIB))]
    fn test_explicit_values_out_of_bounds(#[case] request: ResourceRequest) {
        let dir = provisioned_dir();
        let builder = builder(MockPlatform::new().with_bounds(bounds(2, 4)), &dir);

        let err = builder.build(request, None).unwrap_err();
        assert!(err.is_invalid(), "unexpected error: {err}");
    }

    #[test]
    fn test_explicit_values_at_bounds() {
        let dir = provisioned_dir();
        let builder = builder(MockPlatform::new().with_bounds(bounds(2, 4)), &dir);

        let config = builder
            .build(ResourceRequest::new(4, 16 * GIB), None)
            .unwrap();
        assert_eq!(config.cpu_count, 4);
        assert_eq!(config.memory_bytes, 16 * GIB);
    }

    #[test]
    fn test_unknown_bridge() {
        let dir = provisioned_dir();
        let platform =
            MockPlatform::new().with_interfaces(vec![HostInterface::new("en1", "Wi-Fi")]);
        let builder = builder(platform, &dir);

        let err = builder
            .build(ResourceRequest::default(), Some("en0"))
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::Invalid(ConfigError::BridgeNotFound(ref name)) if name == "en0"
        ));
    }

    #[test]
    fn test_empty_bridge_selects_nat() {
        let dir = provisioned_dir();
        let builder = builder(MockPlatform::new().with_interfaces(vec![]), &dir);

        let config = builder.build(ResourceRequest::default(), Some("")).unwrap();
        assert_eq!(config.network[0].attachment, NetworkAttachment::Nat);
    }

    #[test]
    fn test_validation_failure_is_config_invalid() {
        let dir = provisioned_dir();
        let builder = builder(MockPlatform::new().rejecting_validation("no boot volume"), &dir);

        let err = builder.build(ResourceRequest::default(), None).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Invalid(ConfigError::ValidationFailed(ref reason)) if reason.contains("no boot volume")
        ));
    }

    #[test]
    fn test_missing_identity_is_platform_error() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder(MockPlatform::new(), &dir);

        let err = builder.build(ResourceRequest::default(), None).unwrap_err();
        assert!(!err.is_invalid());
        assert!(!builder.layout().disk_image().exists());
    }

    #[test]
    fn test_identity_shared_across_builds() {
        let dir = provisioned_dir();
        let builder = builder(MockPlatform::new(), &dir);

        let first = builder.build(ResourceRequest::default(), None).unwrap();
        let second = builder.build(ResourceRequest::new(2, 0), None).unwrap();
        assert!(Arc::ptr_eq(&first.identity, &second.identity));
        assert_eq!(first.disk_image, second.disk_image);
    }
}
