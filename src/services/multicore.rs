use std::collections::{BTreeMap, VecDeque};

use dslab_core::{event::EventId, log_debug, log_error, log_info, log_warn};

use crate::{
    cluster_events::{ComputeServiceMessage, WorkflowExecutionEvent},
    config::properties::MulticoreProperties,
    executors::standard_job_executor::{JobOutcome, StandardJobExecutor},
    failure::{FailureCause, SubmitError},
    resources::{Allocation, AllocationRequest, HostResources, ResourceLedger},
    services::{
        job_table::JobState, ComputeService, ServiceArgs, ServiceEnv, ServiceId,
    },
    storage::StorageId,
    workflow::{
        job::{JobId, JobType, PilotJob, StandardJob},
        Workflow,
    },
};

struct RunningStandardJob {
    executor: StandardJobExecutor,
    allocation: Vec<Allocation>,
}

struct RunningPilotJob {
    service: ServiceId,
    allocation: Vec<Allocation>,
    alarm: Option<EventId>,
}

/// The pilot job a nested service was spawned for.
struct PilotLease {
    parent: ServiceId,
    job: JobId,
    death_date: f64,
}

/// Compute service that runs jobs as soon as enough of its hosts are idle.
pub struct MultihostMulticoreComputeService {
    id: ServiceId,
    name: String,
    up: bool,
    supports_standard: bool,
    supports_pilot: bool,
    ledger: ResourceLedger,
    properties: MulticoreProperties,
    default_storage: Option<StorageId>,
    pending: VecDeque<JobId>,
    standard_jobs: BTreeMap<JobId, RunningStandardJob>,
    pilot_jobs: BTreeMap<JobId, RunningPilotJob>,
    lease: Option<PilotLease>,
}

impl MultihostMulticoreComputeService {
    pub fn new(
        id: ServiceId,
        name: &str,
        hosts: impl IntoIterator<Item = (String, HostResources)>,
        supports_standard: bool,
        supports_pilot: bool,
        default_storage: Option<StorageId>,
        properties: MulticoreProperties,
    ) -> Self {
        let mut ledger = ResourceLedger::new();
        for (hostname, resources) in hosts {
            ledger.add_host(&hostname, resources);
        }
        MultihostMulticoreComputeService {
            id,
            name: name.to_string(),
            up: true,
            supports_standard,
            supports_pilot,
            ledger,
            properties,
            default_storage,
            pending: VecDeque::new(),
            standard_jobs: BTreeMap::new(),
            pilot_jobs: BTreeMap::new(),
            lease: None,
        }
    }

    /// Service scoped to the resources leased by pilot job `job` of `parent`.
    #[allow(clippy::too_many_arguments)]
    pub fn for_pilot(
        id: ServiceId,
        parent: ServiceId,
        job: JobId,
        allocation: &[Allocation],
        parent_ledger: &ResourceLedger,
        death_date: f64,
        default_storage: Option<StorageId>,
        properties: MulticoreProperties,
    ) -> Self {
        let ledger =
            ResourceLedger::from_allocations(allocation, |h| parent_ledger.flop_rate(h));
        MultihostMulticoreComputeService {
            id,
            name: format!("pilot-{}", job),
            up: true,
            supports_standard: true,
            supports_pilot: false,
            ledger,
            properties,
            default_storage,
            pending: VecDeque::new(),
            standard_jobs: BTreeMap::new(),
            pilot_jobs: BTreeMap::new(),
            lease: Some(PilotLease {
                parent,
                job,
                death_date,
            }),
        }
    }

    /// Registers a nested service for a granted pilot job and returns its id.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_for_pilot(
        env: &mut ServiceEnv,
        parent: ServiceId,
        job: JobId,
        allocation: &[Allocation],
        parent_ledger: &ResourceLedger,
        ttl: f64,
        default_storage: Option<StorageId>,
        properties: MulticoreProperties,
    ) -> ServiceId {
        let death_date = env.now() + ttl;
        let nested = env.services.add(|id| {
            MultihostMulticoreComputeService::for_pilot(
                id,
                parent,
                job,
                allocation,
                parent_ledger,
                death_date,
                default_storage,
                properties,
            )
        });
        log_info!(
            env.ctx,
            "pilot job {} spawned service {} on {} hosts until {:.3}",
            job,
            nested,
            allocation.len(),
            death_date
        );
        nested
    }

    /// Capacity wanted by each work unit of the job: tasks plus one core for file operations.
    fn unit_requirements(job: &StandardJob, workflow: &Workflow) -> Vec<(u32, u64)> {
        let mut requirements = job
            .tasks
            .iter()
            .map(|t| {
                let task = workflow.task(*t);
                (task.min_cores, task.memory)
            })
            .collect::<Vec<_>>();
        if !job.pre_file_copies.is_empty()
            || !job.post_file_copies.is_empty()
            || !job.cleanup_file_deletions.is_empty()
        {
            requirements.push((1, 0));
        }
        requirements
    }

    /// Takes as many idle cores as the job's tasks could use, host by host.
    fn aggressive_allocation(&self, job: &StandardJob, workflow: &Workflow) -> Option<Vec<Allocation>> {
        let requirements = Self::unit_requirements(job, workflow);
        if requirements.is_empty() {
            return Some(Vec::new());
        }
        let mut desired_cores = job
            .tasks
            .iter()
            .map(|t| workflow.task(*t).max_cores)
            .sum::<u32>()
            .max(1);
        let total_ram = job
            .tasks
            .iter()
            .map(|t| workflow.task(*t).memory)
            .sum::<u64>();

        let mut allocation = Vec::new();
        for hostname in self.ledger.hostnames() {
            if desired_cores == 0 {
                break;
            }
            let cores = self.ledger.available_cores(hostname).min(desired_cores);
            if cores == 0 {
                continue;
            }
            allocation.push(Allocation {
                hostname: hostname.to_string(),
                cores,
                ram: self.ledger.available_ram(hostname).min(total_ram),
            });
            desired_cores -= cores;
        }

        let viable = requirements.iter().all(|(cores, ram)| {
            allocation
                .iter()
                .any(|a| a.cores >= *cores && a.ram >= *ram)
        });
        viable.then_some(allocation)
    }

    fn dispatch_pending(&mut self, env: &mut ServiceEnv) {
        while let Some(&job) = self.pending.front() {
            if !self.try_dispatch(env, job) {
                break;
            }
            self.pending.pop_front();
        }
    }

    /// Returns false when the job has to keep waiting.
    fn try_dispatch(&mut self, env: &mut ServiceEnv, job: JobId) -> bool {
        match env.jobs.get(job).map(|r| r.job.job_type()) {
            Some(JobType::Standard) => self.try_dispatch_standard(env, job),
            Some(JobType::Pilot) => self.try_dispatch_pilot(env, job),
            None => true,
        }
    }

    fn try_dispatch_standard(&mut self, env: &mut ServiceEnv, job_id: JobId) -> bool {
        let Some(job) = env.standard_job(job_id) else {
            return true;
        };
        let Some(allocation) = self.aggressive_allocation(&job, &env.workflow.borrow()) else {
            return false;
        };
        if let Err(e) = self.ledger.reserve_all(&allocation) {
            log_error!(env.ctx, "job {}: {}", job_id, e);
            return false;
        }
        log_info!(
            env.ctx,
            "{}: starting standard job {} on {} hosts",
            self.name,
            job_id,
            allocation.len()
        );
        env.jobs.mark_running(job_id, env.ctx.time());

        let mut executor = StandardJobExecutor::new(
            env,
            self.id,
            job_id,
            job,
            allocation.clone(),
            &self.ledger,
            self.default_storage,
            self.properties.executor.clone(),
        );
        let outcome = executor.start(env);
        self.standard_jobs.insert(
            job_id,
            RunningStandardJob {
                executor,
                allocation,
            },
        );
        if let Some(outcome) = outcome {
            self.on_standard_job_done(env, job_id, outcome, false);
        }
        true
    }

    fn try_dispatch_pilot(&mut self, env: &mut ServiceEnv, job_id: JobId) -> bool {
        let Some(job) = env.pilot_job(job_id) else {
            return true;
        };
        let request = AllocationRequest {
            num_hosts: job.num_hosts,
            min_cores_per_host: job.cores_per_host,
            max_cores_per_host: job.cores_per_host,
            ram_per_host: job.ram_per_host,
        };
        let Ok(allocation) = self.ledger.try_allocate(&request) else {
            return false;
        };
        let nested = Self::spawn_for_pilot(
            env,
            self.id,
            job_id,
            &allocation,
            &self.ledger,
            job.duration,
            self.default_storage,
            self.properties.clone(),
        );
        let alarm = env.schedule(
            self.id,
            ComputeServiceMessage::PilotLeaseExpired { job: job_id },
            job.duration,
        );
        self.pilot_jobs.insert(
            job_id,
            RunningPilotJob {
                service: nested,
                allocation,
                alarm: Some(alarm),
            },
        );
        env.notify(WorkflowExecutionEvent::PilotJobStarted {
            job: job_id,
            service: self.id,
            pilot_service: nested,
        });
        true
    }

    fn on_standard_job_done(
        &mut self,
        env: &mut ServiceEnv,
        job: JobId,
        outcome: JobOutcome,
        dispatch: bool,
    ) {
        let Some(running) = self.standard_jobs.remove(&job) else {
            return;
        };
        if let Err(e) = self.ledger.release_all(&running.allocation) {
            log_error!(env.ctx, "job {}: {}", job, e);
        }
        env.finish_standard_job(self.id, job, outcome);
        if dispatch {
            self.dispatch_pending(env);
        }
    }

    /// Returns the leased resources; the nested service goes down with its jobs.
    fn teardown_pilot(&mut self, env: &mut ServiceEnv, job: JobId, outcome: PilotEnd) {
        let Some(pilot) = self.pilot_jobs.remove(&job) else {
            return;
        };
        if let Some(alarm) = pilot.alarm {
            if outcome != PilotEnd::Expired {
                env.cancel(alarm);
            }
        }
        env.stop_service(pilot.service);
        if let Err(e) = self.ledger.release_all(&pilot.allocation) {
            log_error!(env.ctx, "pilot job {}: {}", job, e);
        }
        let now = env.now();
        match outcome {
            PilotEnd::Expired => env.notify(WorkflowExecutionEvent::PilotJobExpired {
                job,
                service: self.id,
            }),
            PilotEnd::Terminated | PilotEnd::NestedStopped => {
                env.jobs.mark_finished(job, JobState::Terminated, now)
            }
            PilotEnd::ServiceDown => env.notify(WorkflowExecutionEvent::PilotJobFailed {
                job,
                service: self.id,
                cause: FailureCause::service_down_compute(self.id),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PilotEnd {
    Expired,
    Terminated,
    NestedStopped,
    ServiceDown,
}

impl ComputeService for MultihostMulticoreComputeService {
    fn id(&self) -> ServiceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_up(&self) -> bool {
        self.up
    }

    fn supports_standard_jobs(&self) -> bool {
        self.supports_standard
    }

    fn supports_pilot_jobs(&self) -> bool {
        self.supports_pilot
    }

    fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    fn ttl(&self, now: f64) -> Option<f64> {
        self.lease
            .as_ref()
            .map(|lease| (lease.death_date - now).max(0.))
    }

    fn admit_standard_job(
        &self,
        job: &StandardJob,
        _args: &ServiceArgs,
        workflow: &Workflow,
    ) -> Result<(), SubmitError> {
        let feasible = Self::unit_requirements(job, workflow)
            .iter()
            .all(|(cores, ram)| self.ledger.could_ever_fit(*cores, *ram));
        if !feasible {
            return Err(FailureCause::NotEnoughComputeResources { service: self.id }.into());
        }
        Ok(())
    }

    fn admit_pilot_job(&self, job: &PilotJob, _args: &ServiceArgs) -> Result<(), SubmitError> {
        if job.num_hosts == 0 || job.duration <= 0. {
            return Err(SubmitError::InvalidArgument(
                "pilot jobs need at least one host and a positive duration".to_string(),
            ));
        }
        let fitting = self
            .ledger
            .hostnames()
            .filter_map(|h| self.ledger.capacity(h))
            .filter(|c| c.cores >= job.cores_per_host && c.ram >= job.ram_per_host)
            .count();
        if fitting < job.num_hosts as usize {
            return Err(FailureCause::NotEnoughComputeResources { service: self.id }.into());
        }
        Ok(())
    }

    fn on_message(&mut self, env: &mut ServiceEnv, message: ComputeServiceMessage) {
        match message {
            ComputeServiceMessage::JobSubmitted { job } => {
                if !self.up {
                    env.fail_job(self.id, job, FailureCause::service_down_compute(self.id));
                    return;
                }
                if env.jobs.state(job) != Some(JobState::Pending) {
                    log_debug!(env.ctx, "{}: job {} was withdrawn", self.name, job);
                    return;
                }
                self.pending.push_back(job);
                self.dispatch_pending(env);
            }
            ComputeServiceMessage::WorkUnit { job, unit, step } => {
                let Some(running) = self.standard_jobs.get_mut(&job) else {
                    return;
                };
                if let Some(outcome) = running.executor.on_work_unit_step(env, unit, step) {
                    self.on_standard_job_done(env, job, outcome, true);
                }
            }
            ComputeServiceMessage::PilotLeaseExpired { job } => {
                log_info!(env.ctx, "{}: lease of pilot job {} expired", self.name, job);
                self.teardown_pilot(env, job, PilotEnd::Expired);
                self.dispatch_pending(env);
            }
            ComputeServiceMessage::PilotServiceStopped { job } => {
                self.teardown_pilot(env, job, PilotEnd::NestedStopped);
                self.dispatch_pending(env);
            }
            other => {
                log_warn!(env.ctx, "{}: unexpected message {:?}", self.name, other);
            }
        }
    }

    fn terminate_standard_job(
        &mut self,
        env: &mut ServiceEnv,
        job: JobId,
    ) -> Result<(), FailureCause> {
        if let Some(pos) = self.pending.iter().position(|j| *j == job) {
            self.pending.remove(pos);
            env.terminate_standard_job(job);
            return Ok(());
        }
        let Some(mut running) = self.standard_jobs.remove(&job) else {
            return Err(FailureCause::JobCannotBeTerminated { job });
        };
        running.executor.kill(env);
        if let Err(e) = self.ledger.release_all(&running.allocation) {
            log_error!(env.ctx, "job {}: {}", job, e);
        }
        env.terminate_standard_job(job);
        self.dispatch_pending(env);
        Ok(())
    }

    fn terminate_pilot_job(&mut self, env: &mut ServiceEnv, job: JobId) -> Result<(), FailureCause> {
        if let Some(pos) = self.pending.iter().position(|j| *j == job) {
            self.pending.remove(pos);
            let now = env.now();
            env.jobs.mark_finished(job, JobState::Terminated, now);
            return Ok(());
        }
        if !self.pilot_jobs.contains_key(&job) {
            return Err(FailureCause::JobCannotBeTerminated { job });
        }
        self.teardown_pilot(env, job, PilotEnd::Terminated);
        self.dispatch_pending(env);
        Ok(())
    }

    fn stop(&mut self, env: &mut ServiceEnv) {
        if !self.up {
            return;
        }
        self.up = false;
        log_info!(env.ctx, "{}: stopping", self.name);
        let cause = FailureCause::service_down_compute(self.id);

        for job in std::mem::take(&mut self.pending) {
            env.fail_job(self.id, job, cause.clone());
        }
        let running = self.standard_jobs.keys().copied().collect::<Vec<_>>();
        for job in running {
            if let Some(r) = self.standard_jobs.get_mut(&job) {
                r.executor.kill(env);
            }
            self.on_standard_job_done(env, job, JobOutcome::Failed(cause.clone()), false);
        }
        let pilots = self.pilot_jobs.keys().copied().collect::<Vec<_>>();
        for job in pilots {
            self.teardown_pilot(env, job, PilotEnd::ServiceDown);
        }
        if let Some(lease) = &self.lease {
            env.send(
                lease.parent,
                ComputeServiceMessage::PilotServiceStopped { job: lease.job },
            );
        }
    }

    fn inject_compute_thread_failure(&mut self, env: &mut ServiceEnv, hostname: &str) -> bool {
        let jobs = self.standard_jobs.keys().copied().collect::<Vec<_>>();
        for job in jobs {
            let Some(running) = self.standard_jobs.get_mut(&job) else {
                continue;
            };
            if let Some(outcome) = running.executor.kill_thread_on(env, hostname) {
                if let Some(outcome) = outcome {
                    self.on_standard_job_done(env, job, outcome, true);
                }
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MultihostMulticoreComputeService {
        let hosts = ["h1", "h2"].into_iter().map(|h| {
            (
                h.to_string(),
                HostResources {
                    cores: 4,
                    ram: 1000,
                    flop_rate: 1.,
                },
            )
        });
        MultihostMulticoreComputeService::new(
            0,
            "mc",
            hosts,
            true,
            true,
            None,
            MulticoreProperties::default(),
        )
    }

    #[test]
    fn aggressive_allocation_spreads_over_hosts() {
        let mut workflow = Workflow::new();
        let a = workflow.add_task("a", 10., 1, 3, 1., 100).unwrap();
        let b = workflow.add_task("b", 10., 2, 3, 1., 100).unwrap();
        let service = service();
        let allocation = service
            .aggressive_allocation(&StandardJob::new(vec![a, b]), &workflow)
            .unwrap();
        assert_eq!(allocation.len(), 2);
        assert_eq!(allocation[0].cores, 4);
        assert_eq!(allocation[1].cores, 2);
        assert_eq!(allocation[0].ram, 200);
    }

    #[test]
    fn static_admission_checks_total_capacity() {
        let mut workflow = Workflow::new();
        let big = workflow.add_task("big", 10., 5, 5, 1., 0).unwrap();
        let service = service();
        let err = service
            .admit_standard_job(&StandardJob::new(vec![big]), &ServiceArgs::new(), &workflow)
            .unwrap_err();
        assert_eq!(
            err,
            SubmitError::Failure(FailureCause::NotEnoughComputeResources { service: 0 })
        );

        let pilot = PilotJob {
            num_hosts: 3,
            cores_per_host: 1,
            ram_per_host: 0,
            duration: 10.,
        };
        assert!(service.admit_pilot_job(&pilot, &ServiceArgs::new()).is_err());
    }
}
