use serde::Serialize;

use crate::{
    executors::work_unit::WorkUnitId,
    failure::FailureCause,
    services::ServiceId,
    workflow::job::JobId,
};

/// Message addressed to one compute service hosted by the cluster.
#[derive(Clone, Serialize)]
pub struct ServiceEvent {
    pub service: ServiceId,
    pub message: ComputeServiceMessage,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum WorkUnitStep {
    /// The thread startup overhead elapsed.
    StartupDone,
    /// The computation, transfer or disk request the unit waits on completed.
    RequestDone,
    RequestFailed { reason: String },
    /// The current file operation exceeded the network timeout.
    TransferTimedOut,
}

#[derive(Clone, Debug, Serialize)]
pub enum ComputeServiceMessage {
    /// A job accepted by the client API reached the service.
    JobSubmitted { job: JobId },
    WorkUnit {
        job: JobId,
        unit: WorkUnitId,
        step: WorkUnitStep,
    },
    /// The lease of a pilot job started by a multicore service ran out.
    PilotLeaseExpired { job: JobId },
    /// A job started by a batch service reached its walltime.
    WalltimeExpired { job: JobId },
    /// A nested pilot service went down on its own.
    PilotServiceStopped { job: JobId },
    OracleExecuteJob { job_id: String, hosts: Vec<String> },
    OracleAnswer {
        job_id: String,
        estimated_waiting_time: f64,
    },
    /// All decisions of the last oracle reply were delivered.
    OracleReady,
    OracleUnreachable { reason: String },
}

/// Scheduling request forwarded by a batch service to its network listener.
#[derive(Clone, Serialize)]
pub struct OracleRequest {
    pub service: ServiceId,
    pub payload: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum WorkflowExecutionEvent {
    StandardJobCompleted {
        job: JobId,
        service: ServiceId,
    },
    StandardJobFailed {
        job: JobId,
        service: ServiceId,
        cause: FailureCause,
    },
    PilotJobStarted {
        job: JobId,
        service: ServiceId,
        pilot_service: ServiceId,
    },
    PilotJobExpired {
        job: JobId,
        service: ServiceId,
    },
    PilotJobFailed {
        job: JobId,
        service: ServiceId,
        cause: FailureCause,
    },
}

impl WorkflowExecutionEvent {
    pub fn job(&self) -> JobId {
        match self {
            WorkflowExecutionEvent::StandardJobCompleted { job, .. }
            | WorkflowExecutionEvent::StandardJobFailed { job, .. }
            | WorkflowExecutionEvent::PilotJobStarted { job, .. }
            | WorkflowExecutionEvent::PilotJobExpired { job, .. }
            | WorkflowExecutionEvent::PilotJobFailed { job, .. } => *job,
        }
    }
}

/// Notification delivered to the component that submitted a job.
#[derive(Clone, Serialize)]
pub struct JobEvent {
    pub event: WorkflowExecutionEvent,
}
