use std::collections::BTreeMap;

use dslab_core::{log_debug, log_error};

use crate::{
    cluster_events::WorkUnitStep,
    config::properties::ExecutorProperties,
    executors::{
        selection::{compare_candidates, select_host, Candidate},
        work_unit::{WorkUnitGraph, WorkUnitId},
        work_unit_executor::{WorkUnitExecutor, WorkUnitOutcome},
    },
    failure::FailureCause,
    resources::{Allocation, ResourceLedger},
    services::{ServiceEnv, ServiceId},
    storage::StorageId,
    workflow::job::{JobId, StandardJob},
};

#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed(FailureCause),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExecutorState {
    Created,
    Running,
    Finished,
}

/// Executes one standard job on the resources granted to it by its service.
pub struct StandardJobExecutor {
    service: ServiceId,
    job_id: JobId,
    job: StandardJob,
    grant: Vec<Allocation>,
    availability: ResourceLedger,
    units: WorkUnitGraph,
    running: BTreeMap<WorkUnitId, WorkUnitExecutor>,
    default_storage: Option<StorageId>,
    properties: ExecutorProperties,
    state: ExecutorState,
}

impl StandardJobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        env: &ServiceEnv,
        service: ServiceId,
        job_id: JobId,
        job: StandardJob,
        grant: Vec<Allocation>,
        flop_rates: &ResourceLedger,
        default_storage: Option<StorageId>,
        properties: ExecutorProperties,
    ) -> Self {
        let units = WorkUnitGraph::from_job(&job, &env.workflow.borrow());
        let availability = ResourceLedger::from_allocations(&grant, |h| flop_rates.flop_rate(h));
        StandardJobExecutor {
            service,
            job_id,
            job,
            grant,
            availability,
            units,
            running: BTreeMap::new(),
            default_storage,
            properties,
            state: ExecutorState::Created,
        }
    }

    pub fn grant(&self) -> &[Allocation] {
        &self.grant
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn start(&mut self, env: &mut ServiceEnv) -> Option<JobOutcome> {
        if self.state != ExecutorState::Created {
            return None;
        }
        self.state = ExecutorState::Running;
        log_debug!(
            env.ctx,
            "job {} starts {} work units on {} hosts",
            self.job_id,
            self.units.len(),
            self.grant.len()
        );
        self.dispatch(env)
    }

    pub fn on_work_unit_step(
        &mut self,
        env: &mut ServiceEnv,
        unit: WorkUnitId,
        step: WorkUnitStep,
    ) -> Option<JobOutcome> {
        if self.state != ExecutorState::Running {
            return None;
        }
        let outcome = self.running.get_mut(&unit)?.on_step(env, step)?;
        self.on_work_unit_done(env, unit, outcome)
    }

    /// Crashes a computing work unit on `hostname`, if there is one.
    pub fn kill_thread_on(&mut self, env: &mut ServiceEnv, hostname: &str) -> Option<Option<JobOutcome>> {
        if self.state != ExecutorState::Running {
            return None;
        }
        let unit = self
            .running
            .iter()
            .find(|(_, wue)| wue.allocation().hostname == hostname && wue.is_computing())
            .map(|(id, _)| *id)?;
        let outcome = self.running.get_mut(&unit)?.kill_thread(env)?;
        Some(self.on_work_unit_done(env, unit, outcome))
    }

    /// Stops every running work unit; no outcome is ever reported afterwards.
    pub fn kill(&mut self, env: &mut ServiceEnv) {
        if self.state == ExecutorState::Finished {
            return;
        }
        self.state = ExecutorState::Finished;
        self.kill_running(env);
    }

    fn kill_running(&mut self, env: &mut ServiceEnv) {
        let running = std::mem::take(&mut self.running);
        for (_, mut wue) in running {
            wue.kill(env);
            if let Err(e) = self.availability.release(wue.allocation()) {
                log_error!(env.ctx, "job {}: {}", self.job_id, e);
            }
        }
    }

    fn on_work_unit_done(
        &mut self,
        env: &mut ServiceEnv,
        unit: WorkUnitId,
        outcome: WorkUnitOutcome,
    ) -> Option<JobOutcome> {
        let wue = self.running.remove(&unit)?;
        if let Err(e) = self.availability.release(wue.allocation()) {
            log_error!(env.ctx, "job {}: {}", self.job_id, e);
        }
        match outcome {
            WorkUnitOutcome::Completed => {
                if let Some(task) = wue.task() {
                    let now = env.now();
                    env.workflow.borrow_mut().task_completed(task, now);
                }
                self.units.complete(unit);
                self.dispatch(env)
            }
            WorkUnitOutcome::Failed(cause) => {
                log_debug!(
                    env.ctx,
                    "job {}: work unit {} failed: {}",
                    self.job_id,
                    unit,
                    cause
                );
                Some(self.fail(env, cause))
            }
        }
    }

    fn fail(&mut self, env: &mut ServiceEnv, cause: FailureCause) -> JobOutcome {
        self.state = ExecutorState::Finished;
        self.kill_running(env);
        JobOutcome::Failed(cause)
    }

    fn dispatch(&mut self, env: &mut ServiceEnv) -> Option<JobOutcome> {
        if self.units.all_completed() {
            self.state = ExecutorState::Finished;
            return Some(JobOutcome::Completed);
        }

        let ready = {
            let workflow = env.workflow.borrow();
            let mut ready = self
                .units
                .ready()
                .filter(|id| !self.running.contains_key(id))
                .map(|id| {
                    let task = self.units.unit(id).task;
                    let candidate = Candidate {
                        task: task.map(|t| workflow.task(t)),
                        top_level: task.map_or(0, |t| workflow.top_level(t)),
                    };
                    (id, candidate)
                })
                .collect::<Vec<_>>();
            ready.sort_by(|(_, a), (_, b)| {
                compare_candidates(a, b, self.properties.task_selection)
            });
            let shapes = ready
                .into_iter()
                .map(|(id, c)| {
                    let shape = c.task.map_or((1, 1, 0), |t| (t.min_cores, t.max_cores, t.memory));
                    (id, shape)
                })
                .collect::<Vec<(WorkUnitId, (u32, u32, u64))>>();
            shapes
        };

        for (unit_id, (min_cores, max_cores, ram)) in ready {
            let Some(placement) = select_host(
                &self.availability,
                min_cores,
                max_cores,
                ram,
                self.properties.host_selection,
                self.properties.core_allocation,
            ) else {
                continue;
            };
            let allocation = Allocation {
                hostname: placement.hostname,
                cores: placement.cores,
                ram,
            };
            if let Err(e) = self.availability.reserve(&allocation) {
                log_error!(env.ctx, "job {}: {}", self.job_id, e);
                continue;
            }

            let unit = self.units.unit(unit_id).clone();
            let (inputs, outputs) = match unit.task {
                Some(task) => {
                    let now = env.now();
                    let mut workflow = env.workflow.borrow_mut();
                    workflow.task_started(task, now);
                    let t = workflow.task(task);
                    (t.input_files.clone(), t.output_files.clone())
                }
                None => (Vec::new(), Vec::new()),
            };
            let mut wue = WorkUnitExecutor::new(
                self.service,
                self.job_id,
                unit_id,
                &unit,
                &self.job,
                allocation,
                &inputs,
                &outputs,
                self.default_storage,
                &self.properties,
            );
            self.units.start(unit_id);
            let immediate = wue.start(env);
            self.running.insert(unit_id, wue);
            if let Some(outcome) = immediate {
                return self.on_work_unit_done(env, unit_id, outcome);
            }
        }

        if self.running.is_empty() {
            return Some(self.fail(
                env,
                FailureCause::NotEnoughComputeResources {
                    service: self.service,
                },
            ));
        }
        None
    }
}
