//! Instance controller - owns one virtual machine handle.
//!
//! ## Start
//!
//! `start` issues the platform start call, then waits on a one-shot
//! rendezvous resolved by a listener task that drains the VM's state
//! notifications. The wait ends when the listener sees `Running`, sees a
//! terminal state, the optional deadline elapses, or the agent shuts down.
//!
//! ## Stop
//!
//! Stop proceeds in attempts spaced by a fixed interval. Each attempt sends a
//! cooperative stop request if the guest can still accept one; a guest that
//! is already shutting down is left to finish. Once the attempt count
//! exceeds the escalation threshold without a terminal state, a single
//! forced stop is issued.
//!
//! Dropping a controller whose VM was started and is not terminal forces
//! the VM down, so an abandoned start never leaves a running instance.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::error::{InstanceError, StartFailure};
use crate::platform::{StateStream, VmHandle, VmState};
use crate::workload::WorkloadUid;

/// Cooperative stop schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    /// Escalate once this many attempts have passed without the VM
    /// stopping. The escalating attempt is `escalate_after + 1`.
    pub escalate_after: u32,
    /// Pause after each attempt.
    pub interval: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            escalate_after: 3,
            interval: Duration::from_secs(3),
        }
    }
}

/// Size of the graphical front-end window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuiOptions {
    pub width: u32,
    pub height: u32,
}

impl Default for GuiOptions {
    fn default() -> Self {
        Self {
            width: 960,
            height: 600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerOptions {
    pub stop: StopPolicy,
    /// Give up on `start` if the VM is not running by then.
    pub start_timeout: Option<Duration>,
    /// Open a graphics window once the start call has been issued.
    pub gui: Option<GuiOptions>,
}

/// How `stop` brought the instance down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Never started, or already terminal.
    AlreadyStopped,
    /// Reached a terminal state after cooperative requests.
    Graceful { attempts: u32 },
    /// Escalated to a forced stop.
    Forced { attempts: u32 },
}

/// Controller for a single virtual machine.
pub struct InstanceController {
    uid: WorkloadUid,
    handle: Arc<dyn VmHandle>,
    options: ControllerOptions,
    shutdown: watch::Receiver<bool>,
    started: bool,
    listener: Option<JoinHandle<()>>,
}

impl InstanceController {
    pub fn new(
        uid: WorkloadUid,
        handle: Arc<dyn VmHandle>,
        options: ControllerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            uid,
            handle,
            options,
            shutdown,
            started: false,
            listener: None,
        }
    }

    pub fn uid(&self) -> WorkloadUid {
        self.uid
    }

    /// Current lifecycle state, `None` until `start` has been called.
    pub fn state(&self) -> Option<VmState> {
        self.started.then(|| self.handle.state())
    }

    /// Start the VM and wait until it is observably running.
    pub async fn start(&mut self) -> Result<(), InstanceError> {
        if self.started {
            return Err(StartFailure::AlreadyStarted.into());
        }

        // Subscribe before starting so no transition is missed.
        let changes = self.handle.state_changes();

        info!(uid = %self.uid, "Starting virtual machine");
        self.handle.start().await.map_err(|e| {
            error!(uid = %self.uid, error = %e, "Start call failed");
            StartFailure::Platform(e)
        })?;
        self.started = true;

        let (ready_tx, ready_rx) = oneshot::channel();
        self.listener = Some(tokio::spawn(watch_states(self.uid, changes, ready_tx)));

        if let Some(gui) = self.options.gui {
            if let Err(e) = self.handle.start_graphic_application(gui.width, gui.height) {
                warn!(uid = %self.uid, error = %e, "Failed to open graphics window");
            }
        }

        match self.await_running(ready_rx).await {
            Ok(()) => {
                info!(uid = %self.uid, "Virtual machine is running");
                Ok(())
            }
            Err(failure) => {
                error!(uid = %self.uid, error = %failure, "Virtual machine failed to start");
                self.abandon().await;
                Err(failure.into())
            }
        }
    }

    async fn await_running(
        &self,
        ready: oneshot::Receiver<Result<(), StartFailure>>,
    ) -> Result<(), StartFailure> {
        let mut shutdown = self.shutdown.clone();
        let timeout = self.options.start_timeout;
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = ready => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(StartFailure::NotificationsClosed),
            },
            _ = shutdown_signalled(&mut shutdown) => Err(StartFailure::Cancelled),
            _ = deadline => Err(StartFailure::DeadlineElapsed(timeout.unwrap_or_default())),
        }
    }

    /// Tear down a VM whose start failed.
    async fn abandon(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if self.handle.state().is_terminal() {
            return;
        }
        if let Err(e) = self.handle.stop().await {
            warn!(uid = %self.uid, error = %e, "Failed to stop VM after failed start");
        }
    }

    /// Stop the VM, escalating to a forced stop if cooperative requests do
    /// not bring it down.
    pub async fn stop(&self) -> Result<StopOutcome, InstanceError> {
        if !self.started || self.handle.state().is_terminal() {
            debug!(uid = %self.uid, "Instance not running, nothing to stop");
            return Ok(StopOutcome::AlreadyStopped);
        }

        let policy = self.options.stop;
        let mut shutdown = self.shutdown.clone();
        let mut attempts = 0;

        loop {
            attempts += 1;
            if self.handle.can_request_stop() {
                match self.handle.request_stop().await {
                    Ok(accepted) => {
                        info!(uid = %self.uid, attempt = attempts, accepted, "Sent stop request")
                    }
                    Err(e) => {
                        warn!(uid = %self.uid, attempt = attempts, error = %e, "Stop request failed")
                    }
                }
            } else {
                debug!(
                    uid = %self.uid,
                    attempt = attempts,
                    state = %self.handle.state(),
                    "Waiting for guest shutdown"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(policy.interval) => {}
                _ = shutdown_signalled(&mut shutdown) => {
                    warn!(uid = %self.uid, attempts, "Stop aborted by shutdown");
                    return Err(InstanceError::StopAborted { attempts });
                }
            }

            if self.handle.state().is_terminal() {
                info!(uid = %self.uid, attempts, "Virtual machine stopped");
                return Ok(StopOutcome::Graceful { attempts });
            }
            if attempts > policy.escalate_after {
                break;
            }
        }

        warn!(
            uid = %self.uid,
            attempts,
            state = %self.handle.state(),
            "Virtual machine did not stop, forcing stop"
        );
        self.handle.stop().await.map_err(|source| {
            error!(uid = %self.uid, error = %source, "Forced stop failed");
            InstanceError::StopIncomplete { attempts, source }
        })?;

        Ok(StopOutcome::Forced { attempts })
    }
}

impl Drop for InstanceController {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if !self.started || self.handle.state().is_terminal() {
            return;
        }

        warn!(
            uid = %self.uid,
            state = %self.handle.state(),
            "Controller dropped with live instance, forcing stop"
        );
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(uid = %self.uid, "No runtime to stop abandoned instance");
            return;
        };
        let uid = self.uid;
        let handle = Arc::clone(&self.handle);
        runtime.spawn(async move {
            if let Err(e) = handle.stop().await {
                error!(uid = %uid, error = %e, "Failed to stop abandoned instance");
            }
        });
    }
}

/// Drain state notifications, resolving `ready` on the first `Running` or
/// terminal state, and keep logging transitions until the VM is terminal.
async fn watch_states(
    uid: WorkloadUid,
    mut changes: StateStream,
    ready: oneshot::Sender<Result<(), StartFailure>>,
) {
    let mut ready = Some(ready);
    let mut last: Option<VmState> = None;

    while let Some(state) = changes.next().await {
        if last == Some(state) {
            continue;
        }
        if let Some(previous) = last {
            if !previous.can_transition_to(state) {
                warn!(uid = %uid, from = %previous, to = %state, "Unexpected state transition");
            }
        }
        debug!(uid = %uid, state = %state, "Instance state changed");
        last = Some(state);

        if state == VmState::Running {
            if let Some(tx) = ready.take() {
                let _ = tx.send(Ok(()));
            }
        } else if state.is_terminal() {
            if let Some(tx) = ready.take() {
                let _ = tx.send(Err(StartFailure::Terminated(state)));
            }
            break;
        }
    }
}

/// Resolves once the shutdown flag is raised; never resolves if the sender
/// is gone.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockVm;
    use crate::platform::{BootOutcome, MockBehavior, MockPlatform, Platform};
    use std::sync::Arc;

    struct Harness {
        controller: InstanceController,
        vm: Arc<MockVm>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn harness(behavior: MockBehavior, options: ControllerOptions) -> Harness {
        let platform = MockPlatform::new().with_behavior(behavior);
        let dir = tempfile::tempdir().unwrap();
        let config = crate::machine::MachineConfiguration {
            cpu_count: 2,
            memory_bytes: 4 * 1024 * 1024 * 1024,
            boot_loader: crate::machine::BootLoader::MacOs,
            storage: vec![],
            network: vec![],
            graphics: vec![],
            pointing: vec![],
            keyboards: vec![],
            audio: vec![],
            identity: Arc::new(crate::machine::IdentityBundle {
                auxiliary_storage: dir.path().join("aux"),
                hardware_model: vec![1],
                machine_identifier: vec![2],
            }),
            disk_image: dir.path().join("Disk.img"),
        };
        let handle = platform.new_instance(&config).unwrap();
        let vm = platform.instances().remove(0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Harness {
            controller: InstanceController::new(WorkloadUid::new(), handle, options, shutdown_rx),
            vm,
            shutdown_tx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_is_none_before_start() {
        let h = harness(MockBehavior::default(), ControllerOptions::default());
        assert_eq!(h.controller.state(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_waits_for_running() {
        let mut h = harness(MockBehavior::default(), ControllerOptions::default());

        h.controller.start().await.unwrap();
        assert_eq!(h.controller.state(), Some(VmState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails() {
        let mut h = harness(MockBehavior::default(), ControllerOptions::default());
        h.controller.start().await.unwrap();

        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(
            err,
            InstanceError::StartFailed(StartFailure::AlreadyStarted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronous_start_failure() {
        let behavior = MockBehavior {
            fail_start: true,
            ..Default::default()
        };
        let mut h = harness(behavior, ControllerOptions::default());

        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(
            err,
            InstanceError::StartFailed(StartFailure::Platform(_))
        ));
        assert_eq!(h.controller.state(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_error_fails_start() {
        let behavior = MockBehavior {
            boot_outcome: BootOutcome::Error,
            ..Default::default()
        };
        let mut h = harness(behavior, ControllerOptions::default());

        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(
            err,
            InstanceError::StartFailed(StartFailure::Terminated(VmState::Error))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_deadline() {
        let behavior = MockBehavior {
            boot_outcome: BootOutcome::Hang,
            ..Default::default()
        };
        let options = ControllerOptions {
            start_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let mut h = harness(behavior, options);

        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(
            err,
            InstanceError::StartFailed(StartFailure::DeadlineElapsed(d)) if d == Duration::from_secs(30)
        ));
        // The half-booted VM is torn down.
        assert_eq!(h.vm.forced_stops(), 1);
        assert!(h.vm.state().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_cancelled_by_shutdown() {
        let behavior = MockBehavior {
            boot_outcome: BootOutcome::Hang,
            ..Default::default()
        };
        let mut h = harness(behavior, ControllerOptions::default());
        h.shutdown_tx.send(true).unwrap();

        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(
            err,
            InstanceError::StartFailed(StartFailure::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gui_is_fire_and_forget() {
        let options = ControllerOptions {
            gui: Some(GuiOptions::default()),
            ..Default::default()
        };
        let mut h = harness(MockBehavior::default(), options);

        h.controller.start().await.unwrap();
        assert_eq!(h.vm.gui_launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop() {
        let mut h = harness(MockBehavior::default(), ControllerOptions::default());
        h.controller.start().await.unwrap();

        let outcome = h.controller.stop().await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful { attempts: 1 });
        assert_eq!(h.vm.forced_stops(), 0);
        assert_eq!(h.controller.state(), Some(VmState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_escalates_after_configured_attempts() {
        let behavior = MockBehavior {
            honor_stop_requests: false,
            ..Default::default()
        };
        let mut h = harness(behavior, ControllerOptions::default());
        h.controller.start().await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = h.controller.stop().await.unwrap();

        // Escalation happens on the attempt after the threshold.
        assert_eq!(outcome, StopOutcome::Forced { attempts: 4 });
        assert_eq!(h.vm.stop_requests(), 4);
        assert_eq!(h.vm.forced_stops(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(12));
        assert_eq!(h.controller.state(), Some(VmState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_uses_configured_policy() {
        let behavior = MockBehavior {
            honor_stop_requests: false,
            ..Default::default()
        };
        let options = ControllerOptions {
            stop: StopPolicy {
                escalate_after: 4,
                interval: Duration::from_millis(200),
            },
            ..Default::default()
        };
        let mut h = harness(behavior, options);
        h.controller.start().await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = h.controller.stop().await.unwrap();

        assert_eq!(outcome, StopOutcome::Forced { attempts: 5 });
        assert_eq!(h.vm.stop_requests(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_stop_failure_is_reported() {
        let behavior = MockBehavior {
            honor_stop_requests: false,
            fail_force_stop: true,
            ..Default::default()
        };
        let mut h = harness(behavior, ControllerOptions::default());
        h.controller.start().await.unwrap();

        let err = h.controller.stop().await.unwrap_err();
        assert!(matches!(err, InstanceError::StopIncomplete { attempts: 4, .. }));
        assert_eq!(h.vm.forced_stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborted_by_shutdown() {
        let behavior = MockBehavior {
            honor_stop_requests: false,
            ..Default::default()
        };
        let mut h = harness(behavior, ControllerOptions::default());
        h.controller.start().await.unwrap();
        h.shutdown_tx.send(true).unwrap();

        let err = h.controller.stop().await.unwrap_err();
        assert!(matches!(err, InstanceError::StopAborted { attempts: 1 }));
        assert_eq!(h.vm.forced_stops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_guest_shutdown_is_not_forced() {
        let behavior = MockBehavior {
            shutdown_delay: Duration::from_secs(5),
            ..Default::default()
        };
        let mut h = harness(behavior, ControllerOptions::default());
        h.controller.start().await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = h.controller.stop().await.unwrap();

        assert_eq!(outcome, StopOutcome::Graceful { attempts: 2 });
        assert_eq!(h.vm.stop_requests(), 1);
        assert_eq!(h.vm.forced_stops(), 0);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_guest_shutdown_is_forced_after_threshold() {
        let behavior = MockBehavior {
            shutdown_delay: Duration::from_secs(600),
            ..Default::default()
        };
        let mut h = harness(behavior, ControllerOptions::default());
        h.controller.start().await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = h.controller.stop().await.unwrap();

        // One accepted request, then the guest is left alone until escalation.
        assert_eq!(outcome, StopOutcome::Forced { attempts: 4 });
        assert_eq!(h.vm.stop_requests(), 1);
        assert_eq!(h.vm.forced_stops(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(12));
        assert_eq!(h.controller.state(), Some(VmState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_running_instance() {
        let mut h = harness(MockBehavior::default(), ControllerOptions::default());
        h.controller.start().await.unwrap();

        drop(h.controller);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.vm.forced_stops(), 1);
        assert_eq!(h.vm.state(), VmState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_during_start_stops_instance() {
        let behavior = MockBehavior {
            boot_delay: Duration::from_secs(5),
            ..Default::default()
        };
        let mut h = harness(behavior, ControllerOptions::default());

        let pending =
            tokio::time::timeout(Duration::from_secs(1), h.controller.start()).await;
        assert!(pending.is_err());

        drop(h.controller);
        tokio::time::sleep(Duration::from_secs(10)).await;

        // Booting is cut short and never reaches running.
        assert_eq!(h.vm.forced_stops(), 1);
        assert_eq!(h.vm.state(), VmState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_before_start_leaves_instance_alone() {
        let h = harness(MockBehavior::default(), ControllerOptions::default());

        drop(h.controller);
        tokio::task::yield_now().await;

        assert_eq!(h.vm.forced_stops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start() {
        let h = harness(MockBehavior::default(), ControllerOptions::default());

        let outcome = h.controller.stop().await.unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyStopped);
        assert_eq!(h.vm.stop_requests(), 0);
    }
}
