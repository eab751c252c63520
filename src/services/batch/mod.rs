pub mod algorithms;
pub mod batch_job;
pub mod network_listener;
pub mod oracle;
pub mod profile;

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
};

use dslab_core::{event::EventId, log_debug, log_error, log_info, log_warn, Id};

use crate::{
    cluster_events::{ComputeServiceMessage, OracleRequest, WorkflowExecutionEvent},
    config::properties::{BatchProperties, BatchSchedulingAlgorithm, MulticoreProperties},
    executors::standard_job_executor::{JobOutcome, StandardJobExecutor},
    failure::{FailureCause, NetworkOperation, SubmitError},
    resources::{Allocation, HostResources, ResourceLedger},
    services::{
        batch::{
            algorithms::{HostSlot, QueuedSlot, RunningSlot, SchedulingState},
            batch_job::{BatchJob, BatchRequest},
            oracle::{decode_reply, Decision, OracleRequestDoc, ProtocolEvent, SchedulingOracle},
        },
        job_table::JobState,
        multicore::MultihostMulticoreComputeService,
        ComputeService, ServiceArgs, ServiceEnv, ServiceId, WaitTimeQuery,
    },
    storage::StorageId,
    workflow::{
        job::{JobId, JobType, PilotJob, StandardJob},
        Workflow,
    },
};

/// Connection of an oracle-driven batch service to its network listener.
pub struct OracleLink {
    listener: Id,
    mailbox: String,
    transport: Rc<RefCell<dyn SchedulingOracle>>,
    events: Vec<ProtocolEvent>,
    in_flight: Vec<JobId>,
    busy: bool,
    dirty: bool,
}

impl OracleLink {
    pub fn new(listener: Id, mailbox: &str, transport: Rc<RefCell<dyn SchedulingOracle>>) -> Self {
        OracleLink {
            listener,
            mailbox: mailbox.to_string(),
            transport,
            events: Vec::new(),
            in_flight: Vec::new(),
            busy: false,
            dirty: false,
        }
    }
}

enum BatchWork {
    Standard(StandardJobExecutor),
    Pilot(ServiceId),
}

struct RunningBatchJob {
    batch: BatchJob,
    start_time: f64,
    allocation: Vec<Allocation>,
    alarm: EventId,
    work: BatchWork,
}

enum JobStart {
    Rejected,
    Running,
    Finished(JobOutcome),
}

#[derive(Debug)]
enum BatchEnd {
    Finished(JobOutcome),
    WalltimeExpired,
    Terminated,
    NestedStopped,
    ServiceDown,
}

/// Queue-based compute service: jobs ask for `-N` nodes with `-c` cores each for `-t` minutes.
pub struct BatchService {
    id: ServiceId,
    name: String,
    up: bool,
    supports_standard: bool,
    supports_pilot: bool,
    ledger: ResourceLedger,
    properties: BatchProperties,
    default_storage: Option<StorageId>,
    queue: VecDeque<BatchJob>,
    running: BTreeMap<JobId, RunningBatchJob>,
    cursor: usize,
    oracle: Option<OracleLink>,
    oracle_estimates: BTreeMap<String, f64>,
}

impl BatchService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ServiceId,
        name: &str,
        hosts: impl IntoIterator<Item = (String, HostResources)>,
        supports_standard: bool,
        supports_pilot: bool,
        default_storage: Option<StorageId>,
        properties: BatchProperties,
        oracle: Option<OracleLink>,
    ) -> Self {
        let mut ledger = ResourceLedger::new();
        for (hostname, resources) in hosts {
            ledger.add_host(&hostname, resources);
        }
        BatchService {
            id,
            name: name.to_string(),
            up: true,
            supports_standard,
            supports_pilot,
            ledger,
            properties,
            default_storage,
            queue: VecDeque::new(),
            running: BTreeMap::new(),
            cursor: 0,
            oracle,
            oracle_estimates: BTreeMap::new(),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Latest waiting time answers pushed by the oracle.
    pub fn oracle_estimates(&self) -> &BTreeMap<String, f64> {
        &self.oracle_estimates
    }

    fn uses_oracle(&self) -> bool {
        self.properties.scheduling_algorithm == BatchSchedulingAlgorithm::Oracle
            && self.oracle.is_some()
    }

    /// RAM granted along with `cores` cores on `hostname`, proportional to the host's share.
    fn ram_share(&self, hostname: &str, cores: u32) -> u64 {
        match self.ledger.capacity(hostname) {
            Some(c) if c.cores > 0 => {
                (c.ram as u128 * cores.min(c.cores) as u128 / c.cores as u128) as u64
            }
            _ => 0,
        }
    }

    fn scheduling_state(&self, now: f64) -> SchedulingState {
        SchedulingState {
            now,
            hosts: self
                .ledger
                .hostnames()
                .map(|h| HostSlot {
                    name: h.to_string(),
                    cores: self.ledger.capacity(h).map_or(0, |c| c.cores),
                })
                .collect(),
            running: self
                .running
                .iter()
                .map(|(job, r)| RunningSlot {
                    job_id: job.to_string(),
                    hosts: r.allocation.iter().map(|a| a.hostname.clone()).collect(),
                    cores_per_node: r.batch.request.cores_per_node,
                    end_time: r.start_time + r.batch.request.walltime,
                })
                .collect(),
            queue: self
                .queue
                .iter()
                .map(|b| QueuedSlot {
                    job_id: b.job.to_string(),
                    nodes: b.request.nodes,
                    cores_per_node: b.request.cores_per_node,
                    walltime: b.request.walltime,
                })
                .collect(),
        }
    }

    fn static_check(&self, request: &BatchRequest) -> Result<(), SubmitError> {
        let fitting = self
            .ledger
            .hostnames()
            .filter_map(|h| self.ledger.capacity(h))
            .filter(|c| c.cores >= request.cores_per_node)
            .count();
        if fitting < request.nodes as usize {
            return Err(FailureCause::NotEnoughComputeResources { service: self.id }.into());
        }
        Ok(())
    }

    fn schedule(&mut self, env: &mut ServiceEnv) {
        if !self.up {
            return;
        }
        if self.uses_oracle() {
            self.request_oracle_decisions(env);
            return;
        }
        let state = self.scheduling_state(env.now());
        let decisions = state.decide(
            self.properties.scheduling_algorithm,
            self.properties.host_selection_algorithm,
            &mut self.cursor,
        );
        // decisions were taken together, so jobs that end at once release their hosts afterwards
        let mut finished = Vec::new();
        for decision in decisions {
            match decision.job_id.parse::<JobId>() {
                Ok(job) => {
                    if let JobStart::Finished(outcome) = self.start_job(env, job, &decision.hosts) {
                        finished.push((job, outcome));
                    }
                }
                Err(_) => log_error!(env.ctx, "bad job id {} in decision", decision.job_id),
            }
        }
        if finished.is_empty() {
            return;
        }
        for (job, outcome) in finished {
            self.finish_running_job(env, job, BatchEnd::Finished(outcome));
        }
        self.schedule(env);
    }

    fn request_oracle_decisions(&mut self, env: &mut ServiceEnv) {
        let state = self.scheduling_state(env.now());
        let Some(link) = self.oracle.as_mut() else {
            return;
        };
        if link.busy {
            link.dirty = true;
            return;
        }
        let doc = OracleRequestDoc {
            state,
            events: std::mem::take(&mut link.events),
        };
        let payload = match serde_json::to_string(&doc) {
            Ok(payload) => payload,
            Err(e) => {
                log_error!(env.ctx, "cannot encode oracle request: {}", e);
                return;
            }
        };
        link.busy = true;
        link.dirty = false;
        link.in_flight = self.queue.iter().map(|b| b.job).collect();
        let delay = env.platform.latency();
        env.ctx.emit(
            OracleRequest {
                service: self.id,
                payload,
            },
            link.listener,
            delay,
        );
    }

    fn push_oracle_event(&mut self, event: ProtocolEvent) {
        if let Some(link) = self.oracle.as_mut() {
            link.events.push(event);
        }
    }

    /// Starts queued job `job` on `hosts`.
    ///
    /// A job that ends right away keeps its hosts until the caller tears it down.
    fn start_job(&mut self, env: &mut ServiceEnv, job: JobId, hosts: &[String]) -> JobStart {
        let Some(pos) = self.queue.iter().position(|b| b.job == job) else {
            log_warn!(env.ctx, "{}: job {} is not queued", self.name, job);
            return JobStart::Rejected;
        };
        let cores = self.queue[pos].request.cores_per_node;
        if hosts.len() != self.queue[pos].request.nodes as usize {
            log_warn!(
                env.ctx,
                "{}: job {} needs {} hosts, got {}",
                self.name,
                job,
                self.queue[pos].request.nodes,
                hosts.len()
            );
            return JobStart::Rejected;
        }
        let allocation = hosts
            .iter()
            .map(|h| Allocation {
                hostname: h.clone(),
                cores,
                ram: self.ram_share(h, cores),
            })
            .collect::<Vec<_>>();
        if let Err(e) = self.ledger.reserve_all(&allocation) {
            log_warn!(env.ctx, "{}: cannot start job {}: {}", self.name, job, e);
            return JobStart::Rejected;
        }
        let Some(batch) = self.queue.remove(pos) else {
            return JobStart::Rejected;
        };
        let now = env.now();
        log_info!(
            env.ctx,
            "{}: starting {} job {} on {:?}",
            self.name,
            batch.job_type,
            job,
            hosts
        );

        match batch.job_type {
            JobType::Standard => {
                let Some(definition) = env.standard_job(job) else {
                    log_warn!(env.ctx, "{}: job {} has no record, dropping it", self.name, job);
                    if let Err(e) = self.ledger.release_all(&allocation) {
                        log_error!(env.ctx, "job {}: {}", job, e);
                    }
                    return JobStart::Rejected;
                };
                let alarm = env.schedule(
                    self.id,
                    ComputeServiceMessage::WalltimeExpired { job },
                    batch.request.walltime,
                );
                env.jobs.mark_running(job, now);
                let mut executor = StandardJobExecutor::new(
                    env,
                    self.id,
                    job,
                    definition,
                    allocation.clone(),
                    &self.ledger,
                    self.default_storage,
                    self.properties.executor.clone(),
                );
                let outcome = executor.start(env);
                self.running.insert(
                    job,
                    RunningBatchJob {
                        batch,
                        start_time: now,
                        allocation,
                        alarm,
                        work: BatchWork::Standard(executor),
                    },
                );
                if let Some(outcome) = outcome {
                    return JobStart::Finished(outcome);
                }
            }
            JobType::Pilot => {
                let duration = env.pilot_job(job).map_or(f64::INFINITY, |p| p.duration);
                let ttl = duration.min(batch.request.walltime);
                let nested = MultihostMulticoreComputeService::spawn_for_pilot(
                    env,
                    self.id,
                    job,
                    &allocation,
                    &self.ledger,
                    ttl,
                    self.default_storage,
                    MulticoreProperties {
                        executor: self.properties.executor.clone(),
                    },
                );
                let alarm = env.schedule(
                    self.id,
                    ComputeServiceMessage::WalltimeExpired { job },
                    ttl,
                );
                self.running.insert(
                    job,
                    RunningBatchJob {
                        batch,
                        start_time: now,
                        allocation,
                        alarm,
                        work: BatchWork::Pilot(nested),
                    },
                );
                env.notify(WorkflowExecutionEvent::PilotJobStarted {
                    job,
                    service: self.id,
                    pilot_service: nested,
                });
            }
        }
        JobStart::Running
    }

    fn end_running_job(&mut self, env: &mut ServiceEnv, job: JobId, end: BatchEnd) {
        self.finish_running_job(env, job, end);
        self.schedule(env);
    }

    /// Single teardown path of a started job, whatever ended it.
    fn finish_running_job(&mut self, env: &mut ServiceEnv, job: JobId, end: BatchEnd) {
        let Some(running) = self.running.remove(&job) else {
            return;
        };
        if !matches!(end, BatchEnd::WalltimeExpired) {
            env.cancel(running.alarm);
        }
        if let Err(e) = self.ledger.release_all(&running.allocation) {
            log_error!(env.ctx, "job {}: {}", job, e);
        }
        let now = env.now();
        log_debug!(env.ctx, "{}: job {} ended: {:?}", self.name, job, end);

        let killed = !matches!(end, BatchEnd::Finished(JobOutcome::Completed));
        match running.work {
            BatchWork::Standard(mut executor) => {
                executor.kill(env);
                match end {
                    BatchEnd::Finished(outcome) => env.finish_standard_job(self.id, job, outcome),
                    BatchEnd::WalltimeExpired => env.finish_standard_job(
                        self.id,
                        job,
                        JobOutcome::Failed(FailureCause::JobTimeout { job }),
                    ),
                    BatchEnd::Terminated | BatchEnd::NestedStopped => {
                        env.terminate_standard_job(job)
                    }
                    BatchEnd::ServiceDown => env.finish_standard_job(
                        self.id,
                        job,
                        JobOutcome::Failed(FailureCause::service_down_compute(self.id)),
                    ),
                }
            }
            BatchWork::Pilot(nested) => {
                if !matches!(end, BatchEnd::NestedStopped) {
                    env.stop_service(nested);
                }
                match end {
                    BatchEnd::WalltimeExpired => {
                        env.notify(WorkflowExecutionEvent::PilotJobExpired {
                            job,
                            service: self.id,
                        })
                    }
                    BatchEnd::ServiceDown => env.notify(WorkflowExecutionEvent::PilotJobFailed {
                        job,
                        service: self.id,
                        cause: FailureCause::service_down_compute(self.id),
                    }),
                    _ => env.jobs.mark_finished(job, JobState::Terminated, now),
                }
            }
        }

        self.push_oracle_event(ProtocolEvent::job_ended(now, &job.to_string(), killed));
    }

    fn on_oracle_unreachable(&mut self, env: &mut ServiceEnv, reason: &str) {
        let Some(link) = self.oracle.as_mut() else {
            return;
        };
        link.busy = false;
        let mailbox = link.mailbox.clone();
        let jobs = std::mem::take(&mut link.in_flight);
        log_warn!(env.ctx, "{}: oracle unreachable: {}", self.name, reason);
        for job in jobs {
            if let Some(pos) = self.queue.iter().position(|b| b.job == job) {
                self.queue.remove(pos);
                env.fail_job(
                    self.id,
                    job,
                    FailureCause::NetworkError {
                        operation: NetworkOperation::Sending,
                        mailbox: mailbox.clone(),
                    },
                );
            }
        }
    }

    fn oracle_estimates_for(
        &mut self,
        env: &mut ServiceEnv,
        queries: &[WaitTimeQuery],
    ) -> Result<BTreeMap<String, f64>, SubmitError> {
        let now = env.now();
        let state = self.scheduling_state(now);
        let Some(link) = self.oracle.as_ref() else {
            return Err(SubmitError::InvalidArgument("no oracle attached".to_string()));
        };
        let network_error = || FailureCause::NetworkError {
            operation: NetworkOperation::Sending,
            mailbox: link.mailbox.clone(),
        };
        let doc = OracleRequestDoc {
            state,
            events: vec![ProtocolEvent::query(now, queries)],
        };
        let payload = serde_json::to_string(&doc).map_err(|_| network_error())?;
        let reply = link
            .transport
            .borrow_mut()
            .exchange(&payload)
            .and_then(|r| decode_reply(&r));
        let (_, decisions) = reply.map_err(|e| {
            log_warn!(env.ctx, "{}: waiting time query failed: {}", self.name, e);
            network_error()
        })?;
        Ok(decisions
            .into_iter()
            .filter_map(|d| match d {
                Decision::Answer {
                    job_id,
                    estimated_waiting_time,
                    ..
                } => Some((job_id, estimated_waiting_time)),
                Decision::ExecuteJob { .. } => None,
            })
            .collect())
    }
}

impl ComputeService for BatchService {
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

    fn admit_standard_job(
        &self,
        job: &StandardJob,
        args: &ServiceArgs,
        workflow: &Workflow,
    ) -> Result<(), SubmitError> {
        let request = BatchRequest::from_args(args)?;
        self.static_check(&request)?;
        let largest_share = self
            .ledger
            .hostnames()
            .filter(|h| {
                self.ledger
                    .capacity(h)
                    .is_some_and(|c| c.cores >= request.cores_per_node)
            })
            .map(|h| self.ram_share(h, request.cores_per_node))
            .max()
            .unwrap_or(0);
        let fits = job.tasks.iter().all(|t| {
            let task = workflow.task(*t);
            task.min_cores <= request.cores_per_node && task.memory <= largest_share
        });
        if !fits {
            return Err(FailureCause::NotEnoughComputeResources { service: self.id }.into());
        }
        Ok(())
    }

    fn admit_pilot_job(&self, job: &PilotJob, args: &ServiceArgs) -> Result<(), SubmitError> {
        let request = BatchRequest::from_args(args)?;
        self.static_check(&request)?;
        if job.duration <= 0. {
            return Err(SubmitError::InvalidArgument(
                "pilot jobs need a positive duration".to_string(),
            ));
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
                let Some((job_type, args)) = env
                    .jobs
                    .get(job)
                    .filter(|r| r.state == JobState::Pending)
                    .map(|r| (r.job.job_type(), r.args.clone()))
                else {
                    log_debug!(env.ctx, "{}: job {} was withdrawn", self.name, job);
                    return;
                };
                let request = match BatchRequest::from_args(&args) {
                    Ok(request) => request,
                    Err(e) => {
                        log_error!(env.ctx, "{}: job {}: {}", self.name, job, e);
                        env.fail_job(self.id, job, FailureCause::FatalFailure);
                        return;
                    }
                };
                let batch = BatchJob {
                    job,
                    job_type,
                    request,
                    submit_time: env.now(),
                };
                self.queue.push_back(batch);
                let now = env.now();
                self.push_oracle_event(ProtocolEvent::job_submitted(now, &job.to_string()));
                self.schedule(env);
            }
            ComputeServiceMessage::WorkUnit { job, unit, step } => {
                let Some(running) = self.running.get_mut(&job) else {
                    return;
                };
                let BatchWork::Standard(executor) = &mut running.work else {
                    return;
                };
                if let Some(outcome) = executor.on_work_unit_step(env, unit, step) {
                    self.end_running_job(env, job, BatchEnd::Finished(outcome));
                }
            }
            ComputeServiceMessage::WalltimeExpired { job } => {
                log_info!(env.ctx, "{}: job {} reached its walltime", self.name, job);
                self.end_running_job(env, job, BatchEnd::WalltimeExpired);
            }
            ComputeServiceMessage::PilotServiceStopped { job } => {
                self.end_running_job(env, job, BatchEnd::NestedStopped);
            }
            ComputeServiceMessage::OracleExecuteJob { job_id, hosts } => {
                match job_id.parse::<JobId>() {
                    Ok(job) => {
                        if let JobStart::Finished(outcome) = self.start_job(env, job, &hosts) {
                            self.end_running_job(env, job, BatchEnd::Finished(outcome));
                        }
                    }
                    Err(_) => log_warn!(env.ctx, "{}: unknown job id {}", self.name, job_id),
                }
            }
            ComputeServiceMessage::OracleAnswer {
                job_id,
                estimated_waiting_time,
            } => {
                self.oracle_estimates.insert(job_id, estimated_waiting_time);
            }
            ComputeServiceMessage::OracleReady => {
                let resend = match self.oracle.as_mut() {
                    Some(link) => {
                        link.busy = false;
                        link.in_flight.clear();
                        link.dirty
                    }
                    None => false,
                };
                if resend {
                    self.schedule(env);
                }
            }
            ComputeServiceMessage::OracleUnreachable { reason } => {
                self.on_oracle_unreachable(env, &reason);
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
        if let Some(pos) = self.queue.iter().position(|b| b.job == job) {
            self.queue.remove(pos);
            env.terminate_standard_job(job);
            return Ok(());
        }
        if !self.running.contains_key(&job) {
            return Err(FailureCause::JobCannotBeTerminated { job });
        }
        self.end_running_job(env, job, BatchEnd::Terminated);
        Ok(())
    }

    fn terminate_pilot_job(&mut self, env: &mut ServiceEnv, job: JobId) -> Result<(), FailureCause> {
        if let Some(pos) = self.queue.iter().position(|b| b.job == job) {
            self.queue.remove(pos);
            let now = env.now();
            env.jobs.mark_finished(job, JobState::Terminated, now);
            return Ok(());
        }
        if !self.running.contains_key(&job) {
            return Err(FailureCause::JobCannotBeTerminated { job });
        }
        self.end_running_job(env, job, BatchEnd::Terminated);
        Ok(())
    }

    fn stop(&mut self, env: &mut ServiceEnv) {
        if !self.up {
            return;
        }
        self.up = false;
        log_info!(env.ctx, "{}: stopping", self.name);
        let cause = FailureCause::service_down_compute(self.id);
        for batch in std::mem::take(&mut self.queue) {
            env.fail_job(self.id, batch.job, cause.clone());
        }
        let running = self.running.keys().copied().collect::<Vec<_>>();
        for job in running {
            self.end_running_job(env, job, BatchEnd::ServiceDown);
        }
    }

    fn inject_compute_thread_failure(&mut self, env: &mut ServiceEnv, hostname: &str) -> bool {
        let jobs = self.running.keys().copied().collect::<Vec<_>>();
        for job in jobs {
            let Some(running) = self.running.get_mut(&job) else {
                continue;
            };
            let BatchWork::Standard(executor) = &mut running.work else {
                continue;
            };
            if let Some(outcome) = executor.kill_thread_on(env, hostname) {
                if let Some(outcome) = outcome {
                    self.end_running_job(env, job, BatchEnd::Finished(outcome));
                }
                return true;
            }
        }
        false
    }

    fn queue_waiting_time_estimates(
        &mut self,
        env: &mut ServiceEnv,
        queries: &[WaitTimeQuery],
    ) -> Result<BTreeMap<String, f64>, SubmitError> {
        if !self.up {
            return Err(FailureCause::service_down_compute(self.id).into());
        }
        for query in queries {
            if query.num_hosts == 0 || query.num_hosts as usize > self.ledger.num_hosts() {
                return Err(SubmitError::InvalidArgument(format!(
                    "query {} asks for {} hosts out of {}",
                    query.id,
                    query.num_hosts,
                    self.ledger.num_hosts()
                )));
            }
            if query.duration <= 0. {
                return Err(SubmitError::InvalidArgument(format!(
                    "query {} has a non-positive duration",
                    query.id
                )));
            }
        }
        if self.uses_oracle() {
            return self.oracle_estimates_for(env, queries);
        }
        let state = self.scheduling_state(env.now());
        Ok(state.estimate_waiting_times(self.properties.scheduling_algorithm, queries))
    }
}
