//! Workload registry - the orchestrator-facing surface.
//!
//! Holds two maps: workload identity to descriptor, and workload uid to the
//! controller of the VM backing it. An entry appears in both maps only once
//! its VM is observably running, and disappears from both once the VM has
//! been stopped.
//!
//! Operations on the same identity are serialized by a per-identity lock,
//! so a create racing a delete (or a second create) sees a consistent view.
//! The map lock itself is never held across platform calls.
//!
//! A `create` whose future is dropped part-way leaves no trace: the
//! per-identity lock is released by its guard, and a VM that was already
//! started is forced down when its controller is dropped.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{PlatformError, RegistryError};
use crate::instance::{ControllerOptions, InstanceController, StopOutcome};
use crate::machine::ConfigurationBuilder;
use crate::platform::Platform;
use crate::status;
use crate::workload::{WorkloadDescriptor, WorkloadKey, WorkloadStatus, WorkloadUid};

/// Registry tunables.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Host interface to bridge guest networking onto; NAT when unset.
    pub bridge_interface: Option<String>,
    pub controller: ControllerOptions,
}

type KeyLocks = std::sync::Mutex<HashMap<WorkloadKey, Arc<Mutex<()>>>>;

#[derive(Default)]
struct RegistryMaps {
    workloads: HashMap<WorkloadKey, WorkloadDescriptor>,
    instances: HashMap<WorkloadUid, Arc<InstanceController>>,
}

/// Registry of workloads realized as local VMs.
pub struct WorkloadRegistry {
    builder: Arc<ConfigurationBuilder>,
    platform: Arc<dyn Platform>,
    options: RegistryOptions,
    shutdown: watch::Receiver<bool>,
    maps: RwLock<RegistryMaps>,
    /// Per-identity operation locks.
    key_locks: KeyLocks,
}

impl WorkloadRegistry {
    pub fn new(
        builder: ConfigurationBuilder,
        platform: Arc<dyn Platform>,
        options: RegistryOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            builder: Arc::new(builder),
            platform,
            options,
            shutdown,
            maps: RwLock::new(RegistryMaps::default()),
            key_locks: KeyLocks::default(),
        }
    }

    /// Realize a workload as a running VM and register it.
    ///
    /// Returns only once the VM is running. On failure the registry is left
    /// unchanged.
    pub async fn create(&self, descriptor: WorkloadDescriptor) -> Result<(), RegistryError> {
        let _guard = self.lock_key(&descriptor.key).await;
        self.create_locked(descriptor).await
    }

    async fn create_locked(&self, mut descriptor: WorkloadDescriptor) -> Result<(), RegistryError> {
        let key = descriptor.key.clone();
        let uid = descriptor.uid;

        {
            let maps = self.maps.read().await;
            if maps.workloads.contains_key(&key) {
                return Err(RegistryError::AlreadyExists(key));
            }
            if maps.instances.contains_key(&uid) {
                return Err(RegistryError::UidInUse(uid));
            }
        }

        let unit = descriptor
            .primary_unit()
            .ok_or_else(|| RegistryError::NoExecutionUnit(key.clone()))?;

        info!(workload = %key, uid = %uid, unit = %unit.name, "Creating workload");

        // Building touches the identity files and the disk image.
        let resources = unit.resources;
        let bridge = self.options.bridge_interface.clone();
        let builder = Arc::clone(&self.builder);
        let config =
            tokio::task::spawn_blocking(move || builder.build(resources, bridge.as_deref()))
                .await
                .map_err(|e| PlatformError::call("build", e.to_string()))?
                .map_err(|e| {
                    warn!(workload = %key, error = %e, "Rejected machine configuration");
                    e
                })?;

        let handle = self.platform.new_instance(&config)?;
        let mut controller = InstanceController::new(
            uid,
            handle,
            self.options.controller.clone(),
            self.shutdown.clone(),
        );
        controller.start().await?;

        let controller = Arc::new(controller);
        descriptor.status = status::project(controller.state(), &descriptor);

        let mut maps = self.maps.write().await;
        if maps.instances.contains_key(&uid) {
            // Another identity claimed the uid while this VM was booting.
            drop(maps);
            warn!(workload = %key, uid = %uid, "Uid claimed concurrently, stopping new instance");
            if let Err(e) = controller.stop().await {
                error!(workload = %key, error = %e, "Failed to stop orphaned instance");
            }
            return Err(RegistryError::UidInUse(uid));
        }
        maps.instances.insert(uid, controller);
        maps.workloads.insert(key.clone(), descriptor);

        info!(workload = %key, uid = %uid, "Workload running");
        Ok(())
    }

    /// Stop a workload's VM and forget it. Unknown identities succeed.
    ///
    /// If the VM cannot be stopped the entries are kept so the caller can
    /// retry.
    pub async fn delete(&self, key: &WorkloadKey) -> Result<(), RegistryError> {
        let _guard = self.lock_key(key).await;
        self.delete_locked(key).await
    }

    async fn delete_locked(&self, key: &WorkloadKey) -> Result<(), RegistryError> {
        let (uid, controller) = {
            let maps = self.maps.read().await;
            let Some(descriptor) = maps.workloads.get(key) else {
                debug!(workload = %key, "Delete of unknown workload");
                return Ok(());
            };
            let uid = descriptor.uid;
            (uid, maps.instances.get(&uid).cloned())
        };

        info!(workload = %key, uid = %uid, "Deleting workload");

        if let Some(controller) = controller {
            match controller.stop().await {
                Ok(outcome) => log_stop(key, outcome),
                Err(e) => {
                    error!(workload = %key, error = %e, "Failed to stop workload");
                    return Err(e.into());
                }
            }
        }

        let mut maps = self.maps.write().await;
        maps.instances.remove(&uid);
        maps.workloads.remove(key);
        Ok(())
    }

    /// Accepted and ignored; running VMs are not reconfigured.
    pub async fn update(&self, descriptor: &WorkloadDescriptor) -> Result<(), RegistryError> {
        debug!(workload = %descriptor.key, "Ignoring workload update");
        Ok(())
    }

    /// The registered descriptor for `key`.
    pub async fn get(&self, key: &WorkloadKey) -> Option<WorkloadDescriptor> {
        self.maps.read().await.workloads.get(key).cloned()
    }

    pub async fn list(&self) -> Vec<WorkloadDescriptor> {
        self.maps.read().await.workloads.values().cloned().collect()
    }

    /// Recompute a workload's status from its VM, record it on the
    /// descriptor and return it.
    pub async fn get_status(&self, key: &WorkloadKey) -> Option<WorkloadStatus> {
        let mut guard = self.maps.write().await;
        let maps = &mut *guard;

        let descriptor = maps.workloads.get_mut(key)?;
        let state = maps
            .instances
            .get(&descriptor.uid)
            .and_then(|controller| controller.state());

        let projected = status::project(state, descriptor);
        if projected != descriptor.status {
            debug!(
                workload = %key,
                phase = ?projected.phase,
                "Workload status changed"
            );
        }
        descriptor.status = projected.clone();
        Some(projected)
    }

    /// Number of registered workloads.
    pub async fn len(&self) -> usize {
        self.maps.read().await.workloads.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Delete every registered workload. Used on agent shutdown.
    pub async fn stop_all(&self) {
        let keys: Vec<WorkloadKey> = self.maps.read().await.workloads.keys().cloned().collect();
        info!(count = keys.len(), "Stopping all workloads");

        for key in keys {
            if let Err(e) = self.delete(&key).await {
                error!(workload = %key, error = %e, "Failed to stop workload on shutdown");
            }
        }
    }

    async fn lock_key(&self, key: &WorkloadKey) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let mut guard = KeyGuard {
            locks: &self.key_locks,
            key: key.clone(),
            lock,
            held: None,
        };
        // Declared after the guard so a cancelled wait releases its handle first.
        let acquire = Arc::clone(&guard.lock).lock_owned();
        guard.held = Some(acquire.await);
        guard
    }
}

/// Holds one identity's operation lock. Dropping it releases the lock and
/// prunes the entry once no other operation holds or awaits it.
struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: WorkloadKey,
    lock: Arc<Mutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.held.take());
        // Only the map and this guard still reference the lock.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

fn log_stop(key: &WorkloadKey, outcome: StopOutcome) {
    match outcome {
        StopOutcome::AlreadyStopped => debug!(workload = %key, "Instance already stopped"),
        StopOutcome::Graceful { attempts } => {
            info!(workload = %key, attempts, "Instance stopped gracefully")
        }
        StopOutcome::Forced { attempts } => {
            warn!(workload = %key, attempts, "Instance stopped by force")
        }
    }
}
