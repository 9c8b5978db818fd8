//! Projection of VM lifecycle state onto orchestrator workload status.

use crate::platform::VmState;
use crate::workload::{UnitStatus, WorkloadDescriptor, WorkloadPhase, WorkloadStatus};

/// Map an instance state onto a workload phase. `None` means the instance
/// has not been started.
pub fn phase_for(state: Option<VmState>) -> WorkloadPhase {
    match state {
        None | Some(VmState::Starting) => WorkloadPhase::Pending,
        Some(VmState::Running) | Some(VmState::Stopping) => WorkloadPhase::Running,
        Some(VmState::Stopped) => WorkloadPhase::Succeeded,
        Some(VmState::Error) => WorkloadPhase::Failed,
    }
}

/// Compute the status a workload should report for the given state.
///
/// While running, the primary execution unit is reported ready and started
/// at the workload's creation time. Every other phase reports no units.
pub fn project(state: Option<VmState>, descriptor: &WorkloadDescriptor) -> WorkloadStatus {
    let phase = phase_for(state);

    let units = match (phase, descriptor.primary_unit()) {
        (WorkloadPhase::Running, Some(unit)) => vec![UnitStatus {
            name: unit.name.clone(),
            ready: true,
            started: true,
            started_at: Some(descriptor.created_at),
        }],
        _ => Vec::new(),
    };

    WorkloadStatus { phase, units }
}
