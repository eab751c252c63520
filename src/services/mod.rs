pub mod batch;
pub mod job_table;
pub mod multicore;

use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use dslab_core::{event::EventId, log_debug, SimulationContext};
use serde::Serialize;
use sugars::{rc, refcell};

use crate::{
    cluster_events::{ComputeServiceMessage, JobEvent, ServiceEvent, WorkflowExecutionEvent},
    executors::standard_job_executor::JobOutcome,
    failure::{FailureCause, SubmitError},
    platform::Platform,
    resources::{HostSnapshot, ResourceLedger},
    services::job_table::{JobState, JobTable},
    storage::StorageRegistry,
    workflow::{
        job::{JobId, JobType, PilotJob, StandardJob, WorkflowJob},
        Workflow,
    },
};

pub type ServiceId = u32;

/// Service-specific submission arguments, e.g. `-N`, `-t` and `-c` for batch services.
pub type ServiceArgs = BTreeMap<String, String>;

/// Hypothetical job used for queue waiting time estimates.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WaitTimeQuery {
    pub id: String,
    pub num_hosts: u32,
    /// Requested duration in seconds.
    pub duration: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceInformation {
    pub num_hosts: usize,
    pub hosts: Vec<HostSnapshot>,
    pub ttl: Option<f64>,
}

impl ResourceInformation {
    pub fn num_cores(&self) -> BTreeMap<String, u32> {
        self.hosts
            .iter()
            .map(|h| (h.hostname.clone(), h.cores))
            .collect()
    }

    pub fn num_idle_cores(&self) -> BTreeMap<String, u32> {
        self.hosts
            .iter()
            .map(|h| (h.hostname.clone(), h.idle_cores))
            .collect()
    }

    pub fn memory(&self) -> BTreeMap<String, u64> {
        self.hosts
            .iter()
            .map(|h| (h.hostname.clone(), h.ram))
            .collect()
    }

    pub fn flop_rates(&self) -> BTreeMap<String, f64> {
        self.hosts
            .iter()
            .map(|h| (h.hostname.clone(), h.flop_rate))
            .collect()
    }
}

/// Everything a service may touch while handling a message or a client call.
pub struct ServiceEnv<'a> {
    pub ctx: &'a mut SimulationContext,
    pub services: &'a mut ServiceRegistry,
    pub jobs: &'a mut JobTable,
    pub workflow: &'a RefCell<Workflow>,
    pub storages: &'a StorageRegistry,
    pub platform: &'a mut Platform,
}

impl<'a> ServiceEnv<'a> {
    pub fn now(&self) -> f64 {
        self.ctx.time()
    }

    /// Delivers `message` to `service` after `delay`, as a timer.
    pub fn schedule(
        &mut self,
        service: ServiceId,
        message: ComputeServiceMessage,
        delay: f64,
    ) -> EventId {
        self.ctx
            .emit_self(ServiceEvent { service, message }, delay.max(0.))
    }

    /// Delivers `message` to `service` after the network latency.
    pub fn send(&mut self, service: ServiceId, message: ComputeServiceMessage) -> EventId {
        let delay = self.platform.latency();
        self.schedule(service, message, delay)
    }

    pub fn cancel(&mut self, event: EventId) {
        self.ctx.cancel_event(event);
    }

    /// Records the job's new state and notifies the component that submitted it.
    pub fn notify(&mut self, event: WorkflowExecutionEvent) {
        let now = self.now();
        let job = event.job();
        let Some(record) = self.jobs.get_mut(job) else {
            log_debug!(self.ctx, "dropping notification for unknown job {}", job);
            return;
        };
        match &event {
            WorkflowExecutionEvent::StandardJobCompleted { .. } => {
                record.state = JobState::Completed;
                record.end_time = Some(now);
            }
            WorkflowExecutionEvent::StandardJobFailed { cause, .. }
            | WorkflowExecutionEvent::PilotJobFailed { cause, .. } => {
                record.state = JobState::Failed;
                record.end_time = Some(now);
                record.failure = Some(cause.clone());
            }
            WorkflowExecutionEvent::PilotJobStarted { pilot_service, .. } => {
                record.state = JobState::Running;
                record.start_time = Some(now);
                record.pilot_service = Some(*pilot_service);
            }
            WorkflowExecutionEvent::PilotJobExpired { .. } => {
                record.state = JobState::Expired;
                record.end_time = Some(now);
            }
        }
        let callback = record.callback;
        let delay = self.platform.latency();
        self.ctx.emit(JobEvent { event }, callback, delay);
    }

    pub fn standard_job(&self, job: JobId) -> Option<StandardJob> {
        self.jobs
            .get(job)
            .and_then(|r| r.job.as_standard())
            .cloned()
    }

    pub fn pilot_job(&self, job: JobId) -> Option<PilotJob> {
        self.jobs.get(job).and_then(|r| r.job.as_pilot()).cloned()
    }

    /// Applies a standard job's outcome to the workflow and tells the submitter.
    pub fn finish_standard_job(&mut self, service: ServiceId, job: JobId, outcome: JobOutcome) {
        let tasks = self
            .jobs
            .get(job)
            .and_then(|r| r.job.as_standard())
            .map(|j| j.tasks.clone())
            .unwrap_or_default();
        match outcome {
            JobOutcome::Completed => {
                self.notify(WorkflowExecutionEvent::StandardJobCompleted { job, service });
            }
            JobOutcome::Failed(cause) => {
                self.workflow.borrow_mut().job_failed(&tasks);
                self.notify(WorkflowExecutionEvent::StandardJobFailed {
                    job,
                    service,
                    cause,
                });
            }
        }
    }

    /// Fails a job of either type that never got to run.
    pub fn fail_job(&mut self, service: ServiceId, job: JobId, cause: FailureCause) {
        match self.jobs.get(job).map(|r| r.job.job_type()) {
            Some(JobType::Standard) => {
                self.finish_standard_job(service, job, JobOutcome::Failed(cause))
            }
            Some(JobType::Pilot) => self.notify(WorkflowExecutionEvent::PilotJobFailed {
                job,
                service,
                cause,
            }),
            None => log_debug!(self.ctx, "cannot fail unknown job {}", job),
        }
    }

    /// Stops a pilot-spawned service; its jobs fail with the service being down.
    pub fn stop_service(&mut self, service: ServiceId) {
        if let Some(nested) = self.services.get(service) {
            nested.borrow_mut().stop(self);
        }
    }

    /// Reverts the unfinished tasks of a job terminated on the client's request.
    pub fn terminate_standard_job(&mut self, job: JobId) {
        let now = self.now();
        let tasks = self
            .jobs
            .get(job)
            .and_then(|r| r.job.as_standard())
            .map(|j| j.tasks.clone())
            .unwrap_or_default();
        self.workflow.borrow_mut().job_terminated(&tasks);
        self.jobs.mark_finished(job, JobState::Terminated, now);
    }
}

/// Owns every compute service of the cluster, including nested pilot services.
#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<ServiceId, Rc<RefCell<dyn ComputeService>>>,
    next_id: ServiceId,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<S, F>(&mut self, build: F) -> ServiceId
    where
        S: ComputeService + 'static,
        F: FnOnce(ServiceId) -> S,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.services.insert(id, rc!(refcell!(build(id))));
        id
    }

    pub fn get(&self, id: ServiceId) -> Option<Rc<RefCell<dyn ComputeService>>> {
        self.services.get(&id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = ServiceId> + '_ {
        self.services.keys().copied()
    }
}

/// A service that accepts standard and/or pilot jobs and runs them on its hosts.
pub trait ComputeService {
    fn id(&self) -> ServiceId;
    fn name(&self) -> &str;
    fn is_up(&self) -> bool;
    fn supports_standard_jobs(&self) -> bool;
    fn supports_pilot_jobs(&self) -> bool;
    fn ledger(&self) -> &ResourceLedger;

    /// Remaining lifetime of a pilot-spawned service.
    fn ttl(&self, _now: f64) -> Option<f64> {
        None
    }

    /// Static admission: the job must be satisfiable by the service's total capacity.
    fn admit_standard_job(
        &self,
        job: &StandardJob,
        args: &ServiceArgs,
        workflow: &Workflow,
    ) -> Result<(), SubmitError>;
    fn admit_pilot_job(&self, job: &PilotJob, args: &ServiceArgs) -> Result<(), SubmitError>;

    fn on_message(&mut self, env: &mut ServiceEnv, message: ComputeServiceMessage);

    fn terminate_standard_job(&mut self, env: &mut ServiceEnv, job: JobId)
        -> Result<(), FailureCause>;
    fn terminate_pilot_job(&mut self, env: &mut ServiceEnv, job: JobId) -> Result<(), FailureCause>;

    /// Shuts the service down; queued and running jobs fail with the service being down.
    fn stop(&mut self, env: &mut ServiceEnv);

    /// Kills one compute thread running on `hostname`, returns whether one was found.
    fn inject_compute_thread_failure(&mut self, env: &mut ServiceEnv, hostname: &str) -> bool;

    fn queue_waiting_time_estimates(
        &mut self,
        _env: &mut ServiceEnv,
        _queries: &[WaitTimeQuery],
    ) -> Result<BTreeMap<String, f64>, SubmitError> {
        Err(SubmitError::InvalidArgument(format!(
            "service {} does not estimate queue waiting times",
            self.name()
        )))
    }

    fn validate_job(
        &self,
        job: &WorkflowJob,
        args: &ServiceArgs,
        workflow: &Workflow,
    ) -> Result<(), SubmitError> {
        if !self.is_up() {
            return Err(FailureCause::service_down_compute(self.id()).into());
        }
        let supported = match job.job_type() {
            JobType::Standard => self.supports_standard_jobs(),
            JobType::Pilot => self.supports_pilot_jobs(),
        };
        if !supported {
            return Err(FailureCause::JobTypeNotSupported {
                job_type: job.job_type(),
                service: self.id(),
            }
            .into());
        }
        match job {
            WorkflowJob::Standard(job) => self.admit_standard_job(job, args, workflow),
            WorkflowJob::Pilot(job) => self.admit_pilot_job(job, args),
        }
    }

    fn terminate_job(
        &mut self,
        env: &mut ServiceEnv,
        job: JobId,
        job_type: JobType,
    ) -> Result<(), FailureCause> {
        if !self.is_up() {
            return Err(FailureCause::service_down_compute(self.id()));
        }
        match job_type {
            JobType::Standard => self.terminate_standard_job(env, job),
            JobType::Pilot => self.terminate_pilot_job(env, job),
        }
    }

    fn resource_information(&self, now: f64) -> Result<ResourceInformation, FailureCause> {
        if !self.is_up() {
            return Err(FailureCause::service_down_compute(self.id()));
        }
        Ok(ResourceInformation {
            num_hosts: self.ledger().num_hosts(),
            hosts: self.ledger().snapshot(),
            ttl: self.ttl(now),
        })
    }
}
