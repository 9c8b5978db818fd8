//! Configuration for the node agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::instance::{ControllerOptions, GuiOptions, StopPolicy};
use crate::node::{OperatingSystem, DEFAULT_DAEMON_PORT};
use crate::registry::RegistryOptions;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name the node registers under.
    pub node_name: String,

    /// Guest operating system this node serves.
    pub operating_system: OperatingSystem,

    /// Directory holding the disk image and identity artifacts.
    pub data_dir: PathBuf,

    /// Host interface for bridged networking; `None` selects NAT.
    pub bridge_interface: Option<String>,

    /// Stop attempts allowed before escalating to a forced stop.
    pub stop_attempts: u32,

    /// Seconds between stop requests.
    pub stop_interval_secs: u64,

    /// Seconds to wait for a VM to reach running, unbounded if unset.
    pub start_timeout_secs: Option<u64>,

    /// Open a graphics window for each started VM.
    pub gui: bool,

    /// Advertised daemon port.
    pub daemon_port: u16,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let node_name = var("VMLET_NODE_NAME").unwrap_or_else(|| "vmlet-node".to_string());

        let operating_system: OperatingSystem = var("VMLET_OPERATING_SYSTEM")
            .as_deref()
            .unwrap_or("macos")
            .parse()?;
        if !operating_system.is_supported() {
            bail!("operating system {operating_system} is not supported");
        }

        let data_dir = var("VMLET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/vmlet"));

        // An explicitly empty interface selects NAT.
        let bridge_interface = match var("VMLET_BRIDGE_INTERFACE") {
            Some(name) if name.is_empty() => None,
            Some(name) => Some(name),
            None => Some("en0".to_string()),
        };

        let stop_attempts = parse_or(&var, "VMLET_STOP_ATTEMPTS", 3)?;
        let stop_interval_secs = parse_or(&var, "VMLET_STOP_INTERVAL_SECS", 3)?;
        let start_timeout_secs = var("VMLET_START_TIMEOUT_SECS")
            .map(|s| s.parse::<u64>().context("invalid VMLET_START_TIMEOUT_SECS"))
            .transpose()?;
        let gui = parse_or(&var, "VMLET_GUI", false)?;
        let daemon_port = parse_or(&var, "VMLET_DAEMON_PORT", DEFAULT_DAEMON_PORT)?;
        let log_level = var("VMLET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            node_name,
            operating_system,
            data_dir,
            bridge_interface,
            stop_attempts,
            stop_interval_secs,
            start_timeout_secs,
            gui,
            daemon_port,
            log_level,
        })
    }

    /// Registry options derived from this configuration.
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            bridge_interface: self.bridge_interface.clone(),
            controller: ControllerOptions {
                stop: StopPolicy {
                    escalate_after: self.stop_attempts,
                    interval: Duration::from_secs(self.stop_interval_secs),
                },
                start_timeout: self.start_timeout_secs.map(Duration::from_secs),
                gui: self.gui.then(GuiOptions::default),
            },
        }
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(value) => value.parse().with_context(|| format!("invalid {name}")),
        None => Ok(default),
    }
}
