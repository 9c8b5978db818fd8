//! Scripted in-memory platform for testing and development.
//!
//! Each `MockVm` keeps its state in a watch channel, so notifications are
//! delivered exactly the way a real backend pushes them. Boot and guest
//! shutdown complete on background tasks after a configurable delay.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use super::{HostInterface, Platform, ResourceBounds, StateStream, VmHandle, VmState};
use crate::error::PlatformError;
use crate::machine::MachineConfiguration;

const GIB: u64 = 1024 * 1024 * 1024;

/// How a mock VM's boot ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    Running,
    Error,
    /// Stays in `Starting` forever.
    Hang,
}

/// Per-VM scripted behavior.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Delay between `Starting` and the boot outcome.
    pub boot_delay: Duration,
    pub boot_outcome: BootOutcome,
    /// Fail the start call itself.
    pub fail_start: bool,
    /// Whether the guest honours cooperative stop requests.
    pub honor_stop_requests: bool,
    /// Delay between an accepted stop request and `Stopped`.
    pub shutdown_delay: Duration,
    pub fail_force_stop: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            boot_delay: Duration::from_millis(100),
            boot_outcome: BootOutcome::Running,
            fail_start: false,
            honor_stop_requests: true,
            shutdown_delay: Duration::from_millis(50),
            fail_force_stop: false,
        }
    }
}

/// Mock virtualization platform.
pub struct MockPlatform {
    bounds: ResourceBounds,
    interfaces: Vec<HostInterface>,
    trackpad: bool,
    validation_error: Option<String>,
    fail_new_instance: bool,
    behavior: MockBehavior,
    instances: Mutex<Vec<Arc<MockVm>>>,
    vm_counter: AtomicU64,
}

impl MockPlatform {
    /// Create a mock platform with an `en0` interface and generous bounds.
    pub fn new() -> Self {
        Self {
            bounds: ResourceBounds {
                min_cpu: 1,
                max_cpu: 64,
                min_memory_bytes: 128 * 1024 * 1024,
                max_memory_bytes: 256 * GIB,
            },
            interfaces: vec![HostInterface::new("en0", "Ethernet")],
            trackpad: true,
            validation_error: None,
            fail_new_instance: false,
            behavior: MockBehavior::default(),
            instances: Mutex::new(Vec::new()),
            vm_counter: AtomicU64::new(0),
        }
    }

    pub fn with_bounds(mut self, bounds: ResourceBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_interfaces(mut self, interfaces: Vec<HostInterface>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn without_trackpad(mut self) -> Self {
        self.trackpad = false;
        self
    }

    /// Reject every configuration during validation.
    pub fn rejecting_validation(mut self, reason: &str) -> Self {
        self.validation_error = Some(reason.to_string());
        self
    }

    /// Fail every `new_instance` call.
    pub fn failing_instances(mut self) -> Self {
        self.fail_new_instance = true;
        self
    }

    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Every VM created so far, in creation order.
    pub fn instances(&self) -> Vec<Arc<MockVm>> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn instance_count(&self) -> usize {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for MockPlatform {
    fn bounds(&self) -> ResourceBounds {
        self.bounds
    }

    fn host_interfaces(&self) -> Result<Vec<HostInterface>, PlatformError> {
        Ok(self.interfaces.clone())
    }

    fn supports_trackpad(&self) -> bool {
        self.trackpad
    }

    fn validate(&self, config: &MachineConfiguration) -> Result<(), PlatformError> {
        if let Some(reason) = &self.validation_error {
            return Err(PlatformError::call("validate", reason.clone()));
        }
        if !self.bounds.cpu_in_range(config.cpu_count) {
            return Err(PlatformError::call("validate", "cpu count out of range"));
        }
        if !self.bounds.memory_in_range(config.memory_bytes) {
            return Err(PlatformError::call("validate", "memory size out of range"));
        }
        if config.storage.is_empty() {
            return Err(PlatformError::call("validate", "no storage device"));
        }
        if config.pointing.is_empty() || config.keyboards.is_empty() {
            return Err(PlatformError::call("validate", "missing input devices"));
        }
        Ok(())
    }

    fn new_instance(
        &self,
        config: &MachineConfiguration,
    ) -> Result<Arc<dyn VmHandle>, PlatformError> {
        if self.fail_new_instance {
            return Err(PlatformError::call("new_instance", "mock configured to fail"));
        }

        let id = self.vm_counter.fetch_add(1, Ordering::SeqCst);
        let vm = Arc::new(MockVm::new(
            id,
            config.cpu_count,
            config.memory_bytes,
            self.behavior.clone(),
        ));
        debug!(
            vm_id = id,
            cpu_count = config.cpu_count,
            memory_mib = config.memory_bytes / (1024 * 1024),
            "[MOCK] Created VM"
        );

        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&vm));
        Ok(vm)
    }
}

/// Mock virtual machine.
pub struct MockVm {
    pub id: u64,
    pub cpu_count: u32,
    pub memory_bytes: u64,
    behavior: MockBehavior,
    /// `None` until the first start.
    state: Arc<watch::Sender<Option<VmState>>>,
    stop_requests: AtomicU32,
    forced_stops: AtomicU32,
    gui_launches: AtomicU32,
}

impl MockVm {
    fn new(id: u64, cpu_count: u32, memory_bytes: u64, behavior: MockBehavior) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            id,
            cpu_count,
            memory_bytes,
            behavior,
            state: Arc::new(state),
            stop_requests: AtomicU32::new(0),
            forced_stops: AtomicU32::new(0),
            gui_launches: AtomicU32::new(0),
        }
    }

    pub fn stop_requests(&self) -> u32 {
        self.stop_requests.load(Ordering::SeqCst)
    }

    pub fn forced_stops(&self) -> u32 {
        self.forced_stops.load(Ordering::SeqCst)
    }

    pub fn gui_launches(&self) -> u32 {
        self.gui_launches.load(Ordering::SeqCst)
    }

    /// Push a state change as if the platform reported it (e.g. a guest crash).
    pub fn inject_state(&self, next: VmState) -> Result<(), PlatformError> {
        advance(&self.state, next, "inject_state")
    }
}

/// Move to `next` if the transition is permitted.
fn advance(
    state: &watch::Sender<Option<VmState>>,
    next: VmState,
    call: &'static str,
) -> Result<(), PlatformError> {
    let mut result = Ok(());
    state.send_if_modified(|current| match *current {
        None if next == VmState::Starting => {
            *current = Some(next);
            true
        }
        Some(from) if from.can_transition_to(next) => {
            *current = Some(next);
            true
        }
        other => {
            result = Err(PlatformError::InvalidState {
                call,
                state: other.unwrap_or(VmState::Stopped),
            });
            false
        }
    });
    result
}

#[async_trait]
impl VmHandle for MockVm {
    async fn start(&self) -> Result<(), PlatformError> {
        if self.behavior.fail_start {
            return Err(PlatformError::call("start", "mock configured to fail"));
        }

        advance(&self.state, VmState::Starting, "start")?;
        info!(vm_id = self.id, "[MOCK] Starting VM");

        let state = Arc::clone(&self.state);
        let delay = self.behavior.boot_delay;
        let outcome = self.behavior.boot_outcome;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let next = match outcome {
                BootOutcome::Running => VmState::Running,
                BootOutcome::Error => VmState::Error,
                BootOutcome::Hang => return,
            };
            // A forced stop may already have moved the VM on.
            let _ = advance(&state, next, "boot");
        });

        Ok(())
    }

    fn can_request_stop(&self) -> bool {
        self.state() == VmState::Running
    }

    async fn request_stop(&self) -> Result<bool, PlatformError> {
        self.stop_requests.fetch_add(1, Ordering::SeqCst);

        if !self.can_request_stop() {
            return Err(PlatformError::InvalidState {
                call: "request_stop",
                state: self.state(),
            });
        }
        if !self.behavior.honor_stop_requests {
            debug!(vm_id = self.id, "[MOCK] Guest ignored stop request");
            return Ok(false);
        }

        advance(&self.state, VmState::Stopping, "request_stop")?;
        let state = Arc::clone(&self.state);
        let delay = self.behavior.shutdown_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = advance(&state, VmState::Stopped, "guest_shutdown");
        });

        Ok(true)
    }

    async fn stop(&self) -> Result<(), PlatformError> {
        self.forced_stops.fetch_add(1, Ordering::SeqCst);
        info!(vm_id = self.id, "[MOCK] Forcing VM stop");

        if self.behavior.fail_force_stop {
            return Err(PlatformError::call("stop", "mock configured to fail"));
        }

        let current = *self.state.borrow();
        match current {
            Some(VmState::Running) => {}
            Some(VmState::Stopping) => {
                return advance(&self.state, VmState::Stopped, "stop");
            }
            Some(VmState::Starting) => {
                return advance(&self.state, VmState::Error, "stop");
            }
            _ => return Ok(()),
        }

        advance(&self.state, VmState::Stopping, "stop")?;
        advance(&self.state, VmState::Stopped, "stop")
    }

    fn state(&self) -> VmState {
        self.state.borrow().unwrap_or(VmState::Stopped)
    }

    fn state_changes(&self) -> StateStream {
        let changes = WatchStream::new(self.state.subscribe()).filter_map(|state| state);
        Box::pin(changes)
    }

    fn start_graphic_application(&self, width: u32, height: u32) -> Result<(), PlatformError> {
        self.gui_launches.fetch_add(1, Ordering::SeqCst);
        info!(vm_id = self.id, width, height, "[MOCK] Opened graphics window");
        Ok(())
    }
}
