use std::collections::VecDeque;

use dslab_core::{event::EventId, log_debug, log_error, Id};

use crate::{
    cluster_events::{ComputeServiceMessage, WorkUnitStep},
    config::properties::ExecutorProperties,
    executors::work_unit::{WorkUnit, WorkUnitId},
    failure::{FailureCause, NetworkOperation},
    platform::{IoRequest, Waiter},
    resources::Allocation,
    services::{ServiceEnv, ServiceId},
    storage::StorageId,
    workflow::{
        job::{FileCopy, FileDeletion, JobId, StandardJob},
        FileId, TaskId,
    },
};

#[derive(Clone, Debug, PartialEq)]
pub enum WorkUnitOutcome {
    Completed,
    Failed(FailureCause),
}

#[derive(Clone, Debug)]
enum Operation {
    Startup(f64),
    Copy(FileCopy),
    Read {
        file: FileId,
        storage: Option<StorageId>,
    },
    Compute,
    Write {
        file: FileId,
        storage: Option<StorageId>,
    },
    Delete(FileDeletion),
}

/// Part of a file operation served by a disk or by the network.
#[derive(Clone, Copy, Debug)]
enum Phase {
    DiskRead { storage: StorageId, size: u64 },
    Transfer { src: Id, dst: Id, size: u64 },
    DiskWrite { storage: StorageId, size: u64 },
}

/// Runs one work unit on a single host as a chain of operations.
pub struct WorkUnitExecutor {
    service: ServiceId,
    job: JobId,
    unit: WorkUnitId,
    task: Option<TaskId>,
    allocation: Allocation,
    network_timeout: Option<f64>,
    operations: VecDeque<Operation>,
    current: Option<Operation>,
    phases: VecDeque<Phase>,
    phase: Option<Phase>,
    request: Option<IoRequest>,
    timer: Option<EventId>,
}

impl WorkUnitExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: ServiceId,
        job_id: JobId,
        unit_id: WorkUnitId,
        unit: &WorkUnit,
        job: &StandardJob,
        allocation: Allocation,
        input_files: &[FileId],
        output_files: &[FileId],
        default_storage: Option<StorageId>,
        properties: &ExecutorProperties,
    ) -> Self {
        let location = |file: &FileId| job.file_locations.get(file).copied().or(default_storage);

        let mut operations = VecDeque::new();
        if properties.thread_startup_overhead > 0. {
            operations.push_back(Operation::Startup(properties.thread_startup_overhead));
        }
        operations.extend(unit.pre_file_copies.iter().cloned().map(Operation::Copy));
        if unit.task.is_some() {
            operations.extend(input_files.iter().map(|file| Operation::Read {
                file: *file,
                storage: location(file),
            }));
            operations.push_back(Operation::Compute);
            operations.extend(output_files.iter().map(|file| Operation::Write {
                file: *file,
                storage: location(file),
            }));
        }
        operations.extend(unit.post_file_copies.iter().cloned().map(Operation::Copy));
        operations.extend(
            unit.cleanup_file_deletions
                .iter()
                .cloned()
                .map(Operation::Delete),
        );

        WorkUnitExecutor {
            service,
            job: job_id,
            unit: unit_id,
            task: unit.task,
            allocation,
            network_timeout: properties.network_timeout,
            operations,
            current: None,
            phases: VecDeque::new(),
            phase: None,
            request: None,
            timer: None,
        }
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    pub fn is_computing(&self) -> bool {
        matches!(self.current, Some(Operation::Compute)) && self.request.is_some()
    }

    pub fn start(&mut self, env: &mut ServiceEnv) -> Option<WorkUnitOutcome> {
        self.advance(env)
    }

    pub fn on_step(&mut self, env: &mut ServiceEnv, step: WorkUnitStep) -> Option<WorkUnitOutcome> {
        match step {
            WorkUnitStep::StartupDone => {
                self.timer = None;
                self.current = None;
                self.advance(env)
            }
            WorkUnitStep::RequestDone => {
                self.request = None;
                self.phase = None;
                if !self.phases.is_empty() {
                    if let Err(cause) = self.next_phase(env) {
                        self.kill(env);
                        return Some(WorkUnitOutcome::Failed(cause));
                    }
                    return None;
                }
                if let Some(timer) = self.timer.take() {
                    env.cancel(timer);
                }
                if let Some(op) = self.current.take() {
                    if let Err(cause) = self.complete_operation(env, &op) {
                        self.kill(env);
                        return Some(WorkUnitOutcome::Failed(cause));
                    }
                }
                self.advance(env)
            }
            WorkUnitStep::RequestFailed { reason } => {
                self.request = None;
                let cause = self.request_failure(env, &reason);
                self.phase = None;
                self.kill(env);
                Some(WorkUnitOutcome::Failed(cause))
            }
            WorkUnitStep::TransferTimedOut => {
                self.timer = None;
                let mailbox = match &self.current {
                    Some(op) => self.transfer_mailbox(env, op),
                    None => String::new(),
                };
                self.kill(env);
                Some(WorkUnitOutcome::Failed(FailureCause::NetworkTimeout {
                    operation: NetworkOperation::Receiving,
                    mailbox,
                }))
            }
        }
    }

    /// Withdraws the pending request and timer. Calling it again is a no-op.
    pub fn kill(&mut self, env: &mut ServiceEnv) {
        if let Some(timer) = self.timer.take() {
            env.cancel(timer);
        }
        if let Some(request) = self.request.take() {
            env.platform.forget(request);
            // the disk holds the bytes from the moment the write was issued
            if let Some(Phase::DiskWrite { storage, size }) = self.phase {
                let discarded = match env.storages.lookup(storage) {
                    Ok(storage) => {
                        let result = storage.borrow_mut().discard_write(size);
                        result
                    }
                    Err(cause) => Err(cause),
                };
                if let Err(e) = discarded {
                    log_error!(env.ctx, "job {}: unit {}: {}", self.job, self.unit, e);
                }
            }
        }
        self.phase = None;
        self.phases.clear();
        self.operations.clear();
        self.current = None;
    }

    /// Crashes the unit if it is computing.
    pub fn kill_thread(&mut self, env: &mut ServiceEnv) -> Option<WorkUnitOutcome> {
        if !self.is_computing() {
            return None;
        }
        self.kill(env);
        Some(WorkUnitOutcome::Failed(FailureCause::ComputeThreadHasDied))
    }

    fn advance(&mut self, env: &mut ServiceEnv) -> Option<WorkUnitOutcome> {
        while let Some(op) = self.operations.pop_front() {
            match self.begin_operation(env, &op) {
                Ok(true) => {
                    self.current = Some(op);
                    return None;
                }
                Ok(false) => continue,
                Err(cause) => {
                    self.kill(env);
                    return Some(WorkUnitOutcome::Failed(cause));
                }
            }
        }
        Some(WorkUnitOutcome::Completed)
    }

    fn schedule_step(&self, env: &mut ServiceEnv, step: WorkUnitStep, delay: f64) -> EventId {
        env.schedule(
            self.service,
            ComputeServiceMessage::WorkUnit {
                job: self.job,
                unit: self.unit,
                step,
            },
            delay,
        )
    }

    fn wait_for(&mut self, env: &mut ServiceEnv, request: IoRequest) {
        env.platform.track(
            request,
            Waiter {
                service: self.service,
                job: self.job,
                unit: self.unit,
            },
        );
        self.request = Some(request);
    }

    fn host_location(&self, env: &ServiceEnv) -> Result<Id, FailureCause> {
        env.platform
            .host(&self.allocation.hostname)
            .map(|h| h.location())
            .ok_or(FailureCause::FatalFailure)
    }

    fn begin_file_operation(
        &mut self,
        env: &mut ServiceEnv,
        phases: impl IntoIterator<Item = Phase>,
    ) -> Result<bool, FailureCause> {
        self.phases.extend(phases);
        if let Some(timeout) = self.network_timeout {
            self.timer = Some(self.schedule_step(env, WorkUnitStep::TransferTimedOut, timeout));
        }
        self.next_phase(env)?;
        Ok(true)
    }

    fn next_phase(&mut self, env: &mut ServiceEnv) -> Result<(), FailureCause> {
        let Some(phase) = self.phases.pop_front() else {
            return Ok(());
        };
        let requester = env.ctx.id();
        let request = match phase {
            Phase::DiskRead { storage, size } => {
                let storage = env.storages.lookup(storage)?;
                let request = storage.borrow_mut().read(size, requester);
                request
            }
            Phase::Transfer { src, dst, size } => env.platform.transfer(src, dst, size, requester),
            Phase::DiskWrite { storage, size } => {
                let storage = env.storages.lookup(storage)?;
                let request = storage.borrow_mut().write(size, requester);
                request
            }
        };
        self.phase = Some(phase);
        self.wait_for(env, request);
        Ok(())
    }

    /// Returns whether the operation is now waiting for an event.
    fn begin_operation(
        &mut self,
        env: &mut ServiceEnv,
        op: &Operation,
    ) -> Result<bool, FailureCause> {
        match op {
            Operation::Startup(overhead) => {
                self.timer = Some(self.schedule_step(env, WorkUnitStep::StartupDone, *overhead));
                Ok(true)
            }
            Operation::Copy(copy) => {
                let size = env.workflow.borrow().file(copy.file).size;
                let src = env.storages.lookup(copy.src)?;
                let dst = env.storages.lookup(copy.dst)?;
                if copy.src == copy.dst || dst.borrow().has_file(copy.file) {
                    log_debug!(
                        env.ctx,
                        "file {} already on storage {}, skipping copy",
                        copy.file,
                        copy.dst
                    );
                    return Ok(false);
                }
                src.borrow().check_read(copy.file, NetworkOperation::Receiving)?;
                dst.borrow().check_write(copy.file, size)?;
                let (from, to) = (src.borrow().location(), dst.borrow().location());
                self.begin_file_operation(
                    env,
                    [
                        Phase::DiskRead {
                            storage: copy.src,
                            size,
                        },
                        Phase::Transfer {
                            src: from,
                            dst: to,
                            size,
                        },
                        Phase::DiskWrite {
                            storage: copy.dst,
                            size,
                        },
                    ],
                )
            }
            Operation::Read { file, storage } => {
                let id = storage.ok_or(FailureCause::NoStorageServiceForFile { file: *file })?;
                let size = env.workflow.borrow().file(*file).size;
                let storage = env.storages.lookup(id)?;
                storage.borrow().check_read(*file, NetworkOperation::Receiving)?;
                let from = storage.borrow().location();
                let to = self.host_location(env)?;
                self.begin_file_operation(
                    env,
                    [
                        Phase::DiskRead { storage: id, size },
                        Phase::Transfer {
                            src: from,
                            dst: to,
                            size,
                        },
                    ],
                )
            }
            Operation::Compute => {
                let Some(task) = self.task else {
                    return Ok(false);
                };
                let cores = self.allocation.cores.max(1);
                let (flops, dependency) = {
                    let workflow = env.workflow.borrow();
                    let task = workflow.task(task);
                    (task.flops, task.cores_dependency(cores))
                };
                log_debug!(
                    env.ctx,
                    "task {} computes {} flops on {} with {} cores",
                    task,
                    flops,
                    self.allocation.hostname,
                    cores
                );
                let requester = env.ctx.id();
                let request = env.platform.run_compute(
                    &self.allocation.hostname,
                    flops,
                    cores,
                    dependency,
                    requester,
                )?;
                self.wait_for(env, request);
                Ok(true)
            }
            Operation::Write { file, storage } => {
                let id = storage.ok_or(FailureCause::NoStorageServiceForFile { file: *file })?;
                let size = env.workflow.borrow().file(*file).size;
                let storage = env.storages.lookup(id)?;
                storage.borrow().check_write(*file, size)?;
                let from = self.host_location(env)?;
                let to = storage.borrow().location();
                self.begin_file_operation(
                    env,
                    [
                        Phase::Transfer {
                            src: from,
                            dst: to,
                            size,
                        },
                        Phase::DiskWrite { storage: id, size },
                    ],
                )
            }
            Operation::Delete(deletion) => {
                let storage = env.storages.lookup(deletion.storage)?;
                storage.borrow_mut().delete_file(deletion.file)?;
                Ok(false)
            }
        }
    }

    fn complete_operation(&self, env: &mut ServiceEnv, op: &Operation) -> Result<(), FailureCause> {
        let (file, storage) = match op {
            Operation::Copy(copy) => (copy.file, copy.dst),
            Operation::Write {
                file,
                storage: Some(storage),
            } => (*file, *storage),
            _ => return Ok(()),
        };
        let size = env.workflow.borrow().file(file).size;
        let storage = env.storages.lookup(storage)?;
        let result = storage.borrow_mut().commit_file(file, size);
        result
    }

    fn request_failure(&self, env: &mut ServiceEnv, reason: &str) -> FailureCause {
        let file = match &self.current {
            Some(Operation::Copy(copy)) => Some(copy.file),
            Some(Operation::Read { file, .. }) | Some(Operation::Write { file, .. }) => Some(*file),
            _ => None,
        };
        match (self.phase, file) {
            (Some(Phase::DiskRead { storage, .. }), Some(file)) => {
                FailureCause::FileNotFound { file, storage }
            }
            (Some(Phase::DiskWrite { storage, .. }), Some(file)) => {
                FailureCause::StorageNotEnoughSpace { file, storage }
            }
            _ => {
                log_error!(
                    env.ctx,
                    "job {}: unit {} on {}: {}",
                    self.job,
                    self.unit,
                    self.allocation.hostname,
                    reason
                );
                FailureCause::FatalFailure
            }
        }
    }

    fn transfer_mailbox(&self, env: &ServiceEnv, op: &Operation) -> String {
        let storage = match op {
            Operation::Copy(copy) => Some(copy.src),
            Operation::Read { storage, .. } | Operation::Write { storage, .. } => *storage,
            _ => None,
        };
        storage
            .and_then(|id| env.storages.get(id))
            .map(|s| s.borrow().name().to_string())
            .unwrap_or_default()
    }
}
