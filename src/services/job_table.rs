use std::collections::BTreeMap;

use dslab_core::Id;
use serde::Serialize;

use crate::{
    failure::FailureCause,
    services::{ServiceArgs, ServiceId},
    workflow::job::{JobId, WorkflowJob},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    Expired,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }
}

pub struct JobRecord {
    pub job: WorkflowJob,
    pub args: ServiceArgs,
    pub service: ServiceId,
    /// Component notified about the job's fate.
    pub callback: Id,
    pub state: JobState,
    pub submit_time: f64,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub pilot_service: Option<ServiceId>,
    pub failure: Option<FailureCause>,
}

impl JobRecord {
    pub fn new(
        job: WorkflowJob,
        args: ServiceArgs,
        service: ServiceId,
        callback: Id,
        submit_time: f64,
    ) -> Self {
        JobRecord {
            job,
            args,
            service,
            callback,
            state: JobState::Pending,
            submit_time,
            start_time: None,
            end_time: None,
            pilot_service: None,
            failure: None,
        }
    }
}

/// Every job known to the cluster, keyed by the id handed back on submission.
#[derive(Default)]
pub struct JobTable {
    jobs: BTreeMap<JobId, JobRecord>,
    next_id: JobId,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: JobRecord) -> JobId {
        let id = self.next_id;
        self.next_id += 1;
        self.jobs.insert(id, record);
        id
    }

    pub fn get(&self, job: JobId) -> Option<&JobRecord> {
        self.jobs.get(&job)
    }

    pub fn get_mut(&mut self, job: JobId) -> Option<&mut JobRecord> {
        self.jobs.get_mut(&job)
    }

    pub fn remove(&mut self, job: JobId) -> Option<JobRecord> {
        self.jobs.remove(&job)
    }

    pub fn state(&self, job: JobId) -> Option<JobState> {
        self.jobs.get(&job).map(|r| r.state)
    }

    pub fn mark_running(&mut self, job: JobId, time: f64) {
        if let Some(record) = self.jobs.get_mut(&job) {
            record.state = JobState::Running;
            record.start_time = Some(time);
        }
    }

    pub fn mark_finished(&mut self, job: JobId, state: JobState, time: f64) {
        if let Some(record) = self.jobs.get_mut(&job) {
            record.state = state;
            record.end_time = Some(time);
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
