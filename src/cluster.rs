use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use dslab_compute::multicore::{CompFailed, CompFinished, CompStarted};
use dslab_core::{
    cast, log_debug, log_error, log_info, log_warn, Event, EventHandler, Id, SimulationContext,
};
use dslab_network::DataTransferCompleted;
use dslab_storage::events::{DataReadCompleted, DataReadFailed, DataWriteCompleted, DataWriteFailed};

use crate::{
    cluster_events::{ComputeServiceMessage, ServiceEvent, WorkUnitStep},
    config::properties::{BatchProperties, MulticoreProperties},
    failure::{FailureCause, SubmitError},
    platform::{ClusterHost, IoRequest, Platform},
    resources::HostResources,
    services::{
        batch::{BatchService, OracleLink},
        job_table::{JobRecord, JobState, JobTable},
        multicore::MultihostMulticoreComputeService,
        ComputeService, ResourceInformation, ServiceArgs, ServiceEnv, ServiceId, ServiceRegistry,
        WaitTimeQuery,
    },
    storage::{StorageId, StorageRegistry, StorageService},
    workflow::{
        job::{JobId, JobType, PilotJob, StandardJob, WorkflowJob},
        task::TaskState,
        Workflow,
    },
};

/// Component hosting every compute service of the platform and the jobs submitted to them.
///
/// Clients call its methods directly to submit, terminate or inspect jobs, and receive
/// `JobEvent`s at the callback id given on submission. Service timers and control messages
/// travel as `ServiceEvent`s addressed to this component, and so do the completions of
/// computations, transfers and disk operations started by work units.
pub struct Cluster {
    platform: Platform,
    services: ServiceRegistry,
    jobs: JobTable,
    workflow: Rc<RefCell<Workflow>>,
    storages: StorageRegistry,
    ctx: SimulationContext,
}

impl Cluster {
    pub fn new(ctx: SimulationContext, workflow: Rc<RefCell<Workflow>>, platform: Platform) -> Self {
        Cluster {
            platform,
            services: ServiceRegistry::new(),
            jobs: JobTable::new(),
            workflow,
            storages: StorageRegistry::new(),
            ctx,
        }
    }

    pub fn get_id(&self) -> Id {
        self.ctx.id()
    }

    pub fn workflow(&self) -> Rc<RefCell<Workflow>> {
        self.workflow.clone()
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn add_host(&mut self, hostname: &str, host: ClusterHost) {
        log_debug!(
            self.ctx,
            "host {} added: {} cores, {} bytes of RAM, {} flop/s",
            hostname,
            host.resources.cores,
            host.resources.ram,
            host.resources.flop_rate
        );
        self.platform.add_host(hostname, host);
    }

    pub fn host(&self, hostname: &str) -> Option<&HostResources> {
        self.platform.host(hostname).map(|h| &h.resources)
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.platform.hostnames()
    }

    fn resolve_hosts(&self, hostnames: &[&str]) -> Result<Vec<(String, HostResources)>, String> {
        hostnames
            .iter()
            .map(|h| {
                self.host(h)
                    .map(|r| (h.to_string(), r.clone()))
                    .ok_or_else(|| h.to_string())
            })
            .collect()
    }

    pub fn add_storage<S, F>(&mut self, build: F) -> StorageId
    where
        S: StorageService + 'static,
        F: FnOnce(StorageId) -> S,
    {
        self.storages.add(build)
    }

    pub fn storage(&self, id: StorageId) -> Option<Rc<RefCell<dyn StorageService>>> {
        self.storages.get(id)
    }

    pub fn storages(&self) -> &StorageRegistry {
        &self.storages
    }

    /// Returns the name of the first unknown host on failure.
    pub fn add_multicore_service(
        &mut self,
        name: &str,
        hostnames: &[&str],
        supports_standard: bool,
        supports_pilot: bool,
        default_storage: Option<StorageId>,
        properties: MulticoreProperties,
    ) -> Result<ServiceId, String> {
        let hosts = self.resolve_hosts(hostnames)?;
        let id = self.services.add(|id| {
            MultihostMulticoreComputeService::new(
                id,
                name,
                hosts,
                supports_standard,
                supports_pilot,
                default_storage,
                properties,
            )
        });
        log_info!(self.ctx, "multicore service {} ({}) created", name, id);
        Ok(id)
    }

    /// Returns the name of the first unknown host on failure.
    #[allow(clippy::too_many_arguments)]
    pub fn add_batch_service(
        &mut self,
        name: &str,
        hostnames: &[&str],
        supports_standard: bool,
        supports_pilot: bool,
        default_storage: Option<StorageId>,
        properties: BatchProperties,
        oracle: Option<OracleLink>,
    ) -> Result<ServiceId, String> {
        let hosts = self.resolve_hosts(hostnames)?;
        let id = self.services.add(|id| {
            BatchService::new(
                id,
                name,
                hosts,
                supports_standard,
                supports_pilot,
                default_storage,
                properties,
                oracle,
            )
        });
        log_info!(self.ctx, "batch service {} ({}) created", name, id);
        Ok(id)
    }

    pub fn service(&self, id: ServiceId) -> Option<Rc<RefCell<dyn ComputeService>>> {
        self.services.get(id)
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.services.ids().collect()
    }

    fn lookup_service(&self, id: ServiceId) -> Result<Rc<RefCell<dyn ComputeService>>, SubmitError> {
        self.services
            .get(id)
            .ok_or_else(|| SubmitError::InvalidArgument(format!("unknown compute service {}", id)))
    }

    fn with_env<R>(&mut self, f: impl FnOnce(&mut ServiceEnv) -> R) -> R {
        let mut env = ServiceEnv {
            ctx: &mut self.ctx,
            services: &mut self.services,
            jobs: &mut self.jobs,
            workflow: &self.workflow,
            storages: &self.storages,
            platform: &mut self.platform,
        };
        f(&mut env)
    }

    /// Validates and records the job; it reaches the service after one control message delay.
    pub fn submit_job(
        &mut self,
        service: ServiceId,
        job: WorkflowJob,
        args: ServiceArgs,
        callback: Id,
    ) -> Result<JobId, SubmitError> {
        let target = self.lookup_service(service)?;
        if let WorkflowJob::Standard(standard) = &job {
            let workflow = self.workflow.borrow();
            for task in standard.tasks.iter() {
                if *task >= workflow.num_tasks() {
                    return Err(SubmitError::InvalidArgument(format!("unknown task {}", task)));
                }
                let id = *task;
                let task = workflow.task(id);
                if !task.can_be_submitted() {
                    return Err(SubmitError::InvalidArgument(format!(
                        "task {} is {:?}",
                        task.id,
                        task.state()
                    )));
                }
                if task.state() == TaskState::NotReady {
                    let blocked = workflow.parents(id).find(|p| {
                        workflow.task(*p).state() != TaskState::Completed
                            && !standard.tasks.contains(p)
                    });
                    if let Some(parent) = blocked {
                        return Err(SubmitError::InvalidArgument(format!(
                            "task {} depends on task {} which is neither completed nor in the job",
                            task.id,
                            workflow.task(parent).id
                        )));
                    }
                }
            }
        }
        target
            .borrow()
            .validate_job(&job, &args, &self.workflow.borrow())?;

        let tasks = job.as_standard().map(|j| j.tasks.clone());
        let job_type = job.job_type();
        let now = self.ctx.time();
        let id = self
            .jobs
            .insert(JobRecord::new(job, args, service, callback, now));
        if let Some(tasks) = tasks {
            self.workflow.borrow_mut().tasks_submitted(&tasks, id);
        }
        log_debug!(
            self.ctx,
            "{} job {} submitted to service {}",
            job_type,
            id,
            service
        );
        self.with_env(|env| env.send(service, ComputeServiceMessage::JobSubmitted { job: id }));
        Ok(id)
    }

    pub fn submit_standard_job(
        &mut self,
        service: ServiceId,
        job: StandardJob,
        args: ServiceArgs,
        callback: Id,
    ) -> Result<JobId, SubmitError> {
        self.submit_job(service, job.into(), args, callback)
    }

    pub fn submit_pilot_job(
        &mut self,
        service: ServiceId,
        job: PilotJob,
        args: ServiceArgs,
        callback: Id,
    ) -> Result<JobId, SubmitError> {
        self.submit_job(service, job.into(), args, callback)
    }

    /// Terminates a pending or running job. No notification is sent for it.
    pub fn terminate_job(&mut self, job: JobId) -> Result<(), FailureCause> {
        let Some(record) = self.jobs.get(job) else {
            return Err(FailureCause::JobCannotBeTerminated { job });
        };
        if record.state.is_terminal() {
            return Err(FailureCause::JobCannotBeTerminated { job });
        }
        let pending = record.state == JobState::Pending;
        let job_type = record.job.job_type();
        let service = record.service;
        let target = self
            .services
            .get(service)
            .ok_or(FailureCause::JobCannotBeTerminated { job })?;

        let result = self.with_env(|env| target.borrow_mut().terminate_job(env, job, job_type));
        match result {
            // still travelling to the service, which drops it on arrival
            Err(FailureCause::JobCannotBeTerminated { .. }) if pending => {
                self.with_env(|env| match job_type {
                    JobType::Standard => env.terminate_standard_job(job),
                    JobType::Pilot => {
                        let now = env.now();
                        env.jobs.mark_finished(job, JobState::Terminated, now)
                    }
                });
                log_debug!(self.ctx, "job {} terminated before reaching its service", job);
                Ok(())
            }
            other => other,
        }
    }

    /// Drops the record of a finished job.
    pub fn forget_job(&mut self, job: JobId) -> Result<(), FailureCause> {
        match self.jobs.state(job) {
            Some(state) if state.is_terminal() => {
                self.jobs.remove(job);
                Ok(())
            }
            _ => Err(FailureCause::JobCannotBeForgotten { job }),
        }
    }

    pub fn job_state(&self, job: JobId) -> Option<JobState> {
        self.jobs.state(job)
    }

    pub fn job_record(&self, job: JobId) -> Option<&JobRecord> {
        self.jobs.get(job)
    }

    pub fn job_failure(&self, job: JobId) -> Option<&FailureCause> {
        self.jobs.get(job).and_then(|r| r.failure.as_ref())
    }

    /// Service spawned by a started pilot job.
    pub fn pilot_service(&self, job: JobId) -> Option<ServiceId> {
        self.jobs.get(job).and_then(|r| r.pilot_service)
    }

    pub fn resource_information(&self, service: ServiceId) -> Result<ResourceInformation, FailureCause> {
        let target = self
            .services
            .get(service)
            .ok_or(FailureCause::service_down_compute(service))?;
        let result = target.borrow().resource_information(self.ctx.time());
        result
    }

    /// Remaining lifetime of a pilot-spawned service, `None` for top-level services.
    pub fn service_ttl(&self, service: ServiceId) -> Option<f64> {
        let target = self.services.get(service)?;
        let ttl = target.borrow().ttl(self.ctx.time());
        ttl
    }

    pub fn is_service_up(&self, service: ServiceId) -> bool {
        match self.services.get(service) {
            Some(target) => {
                let up = target.borrow().is_up();
                up
            }
            None => false,
        }
    }

    /// Estimated seconds each `(id, num_hosts, duration)` job would wait in a batch queue.
    pub fn queue_waiting_time_estimates(
        &mut self,
        service: ServiceId,
        queries: &[(String, u32, f64)],
    ) -> Result<BTreeMap<String, f64>, SubmitError> {
        let target = self.lookup_service(service)?;
        let queries = queries
            .iter()
            .map(|(id, num_hosts, duration)| WaitTimeQuery {
                id: id.clone(),
                num_hosts: *num_hosts,
                duration: *duration,
            })
            .collect::<Vec<_>>();
        self.with_env(|env| target.borrow_mut().queue_waiting_time_estimates(env, &queries))
    }

    pub fn stop_service(&mut self, service: ServiceId) -> Result<(), SubmitError> {
        let target = self.lookup_service(service)?;
        self.with_env(|env| target.borrow_mut().stop(env));
        Ok(())
    }

    /// Kills one compute thread on `hostname`; false if no thread was running there.
    pub fn inject_compute_thread_failure(
        &mut self,
        service: ServiceId,
        hostname: &str,
    ) -> Result<bool, SubmitError> {
        let target = self.lookup_service(service)?;
        Ok(self.with_env(|env| target.borrow_mut().inject_compute_thread_failure(env, hostname)))
    }

    fn on_service_event(&mut self, service: ServiceId, message: ComputeServiceMessage) {
        let Some(target) = self.services.get(service) else {
            log_warn!(self.ctx, "message for unknown service {}: {:?}", service, message);
            return;
        };
        self.with_env(|env| target.borrow_mut().on_message(env, message));
    }

    /// Hands the completion of a computation, transfer or disk operation to its work unit.
    fn on_request_done(&mut self, component: Id, id: u64, step: WorkUnitStep) {
        let request = IoRequest { component, id };
        let Some(waiter) = self.platform.take_waiter(request) else {
            log_debug!(
                self.ctx,
                "ignoring completion of withdrawn request {} of component {}",
                id,
                component
            );
            return;
        };
        self.on_service_event(
            waiter.service,
            ComputeServiceMessage::WorkUnit {
                job: waiter.job,
                unit: waiter.unit,
                step,
            },
        );
    }
}

impl EventHandler for Cluster {
    fn on(&mut self, event: Event) {
        let src = event.src;
        cast!(match event.data {
            ServiceEvent { service, message } => {
                self.on_service_event(service, message);
            }
            CompStarted { id, cores } => {
                log_debug!(self.ctx, "computation {} started on {} cores", id, cores);
            }
            CompFinished { id } => {
                self.on_request_done(src, id, WorkUnitStep::RequestDone);
            }
            CompFailed { id, reason } => {
                let reason = serde_json::to_string(&reason)
                    .unwrap_or_else(|_| "computation failed".to_string());
                log_error!(self.ctx, "computation {} failed: {}", id, reason);
                self.on_request_done(src, id, WorkUnitStep::RequestFailed { reason });
            }
            DataTransferCompleted { dt } => {
                self.on_request_done(src, dt.id as u64, WorkUnitStep::RequestDone);
            }
            DataReadCompleted { request_id, .. } => {
                self.on_request_done(src, request_id, WorkUnitStep::RequestDone);
            }
            DataReadFailed { request_id, error } => {
                self.on_request_done(src, request_id, WorkUnitStep::RequestFailed { reason: error });
            }
            DataWriteCompleted { request_id, .. } => {
                self.on_request_done(src, request_id, WorkUnitStep::RequestDone);
            }
            DataWriteFailed { request_id, error } => {
                self.on_request_done(src, request_id, WorkUnitStep::RequestFailed { reason: error });
            }
        })
    }
}
