//! vmlet Node Agent
//!
//! Realizes orchestrator workloads as local virtual machines on a single
//! macOS host.
//!
//! ## Architecture
//!
//! - **Configuration Builder**: Turns resource requests into machine configurations
//! - **Instance Controller**: Starts a VM and waits for it to run, escalates stops
//! - **Workload Registry**: Create/delete/get/list/status surface for the orchestrator
//! - **Platform**: Abstracts the virtualization framework (mock in dev)

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmlet_node_agent::config::Config;
use vmlet_node_agent::machine::ConfigurationBuilder;
use vmlet_node_agent::node::{NodeCapacity, NodeInfo, DEFAULT_ADDRESS_INTERFACE};
use vmlet_node_agent::platform::MockPlatform;
use vmlet_node_agent::registry::WorkloadRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vmlet node agent");
    info!(
        node_name = %config.node_name,
        operating_system = %config.operating_system,
        data_dir = %config.data_dir.display(),
        bridge_interface = ?config.bridge_interface,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create the platform (mock for now)
    let platform = Arc::new(MockPlatform::new());

    let builder = ConfigurationBuilder::new(platform.clone(), config.data_dir.clone());
    let registry = WorkloadRegistry::new(
        builder,
        platform,
        config.registry_options(),
        shutdown_rx,
    );

    let capacity = NodeCapacity::measure();
    let node = NodeInfo::new(
        config.node_name.clone(),
        config.operating_system,
        config.daemon_port,
    )
    .with_internal_ip(
        config
            .bridge_interface
            .as_deref()
            .unwrap_or(DEFAULT_ADDRESS_INTERFACE),
    );
    info!(
        cpu_cores = capacity.cpu_cores,
        memory_bytes = capacity.memory_bytes,
        ephemeral_storage_bytes = capacity.ephemeral_storage_bytes,
        max_workloads = capacity.max_workloads,
        architecture = %node.architecture,
        kernel_version = %node.kernel_version,
        os_image = %node.os_image,
        internal_ip = ?node.internal_ip(),
        daemon_port = node.daemon_port,
        "Node ready"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Stop every VM before signalling shutdown, so stops are not aborted
    registry.stop_all().await;
    let _ = shutdown_tx.send(true);

    info!("Node agent shutdown complete");
    Ok(())
}
