//! Device descriptions attached to every machine.
//!
//! The set is fixed: boot loader, one block device, one network device, one
//! display, pointing devices, a keyboard and a sound device.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Guest display geometry.
pub const DISPLAY_WIDTH_PIXELS: u32 = 1920;
pub const DISPLAY_HEIGHT_PIXELS: u32 = 1200;
pub const DISPLAY_PIXELS_PER_INCH: u32 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootLoader {
    MacOs,
}

/// Virtio block device backed by a disk image file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDevice {
    pub image_path: PathBuf,
    pub read_only: bool,
}

impl StorageDevice {
    pub fn disk_image(image_path: PathBuf) -> Self {
        Self {
            image_path,
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkAttachment {
    /// Bridged onto a host interface.
    Bridged { interface: String },
    /// Platform-provided NAT.
    Nat,
}

/// Virtio network device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDevice {
    pub attachment: NetworkAttachment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Display {
    pub width_pixels: u32,
    pub height_pixels: u32,
    pub pixels_per_inch: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphicsDevice {
    pub displays: Vec<Display>,
}

impl Default for GraphicsDevice {
    fn default() -> Self {
        Self {
            displays: vec![Display {
                width_pixels: DISPLAY_WIDTH_PIXELS,
                height_pixels: DISPLAY_HEIGHT_PIXELS,
                pixels_per_inch: DISPLAY_PIXELS_PER_INCH,
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointingDevice {
    UsbScreenCoordinate,
    Trackpad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyboardDevice {
    Usb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioStream {
    HostInput,
    HostOutput,
}

/// Virtio sound device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub streams: Vec<AudioStream>,
}

impl Default for AudioDevice {
    fn default() -> Self {
        Self {
            streams: vec![AudioStream::HostInput, AudioStream::HostOutput],
        }
    }
}
