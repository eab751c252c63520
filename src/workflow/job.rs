use std::{collections::BTreeMap, fmt};

use serde::Serialize;

use crate::{
    storage::StorageId,
    workflow::{FileId, TaskId},
};

pub type JobId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum JobType {
    Standard,
    Pilot,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Standard => write!(f, "standard"),
            JobType::Pilot => write!(f, "pilot"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileCopy {
    pub file: FileId,
    pub src: StorageId,
    pub dst: StorageId,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileDeletion {
    pub file: FileId,
    pub storage: StorageId,
}

/// A set of tasks executed together, with file staging before and after.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StandardJob {
    pub tasks: Vec<TaskId>,
    /// Where task input and output files are read from and written to.
    pub file_locations: BTreeMap<FileId, StorageId>,
    pub pre_file_copies: Vec<FileCopy>,
    pub post_file_copies: Vec<FileCopy>,
    pub cleanup_file_deletions: Vec<FileDeletion>,
}

impl StandardJob {
    pub fn new(tasks: Vec<TaskId>) -> Self {
        StandardJob {
            tasks,
            ..Default::default()
        }
    }

    pub fn with_file_location(mut self, file: FileId, storage: StorageId) -> Self {
        self.file_locations.insert(file, storage);
        self
    }

    pub fn with_pre_copy(mut self, file: FileId, src: StorageId, dst: StorageId) -> Self {
        self.pre_file_copies.push(FileCopy { file, src, dst });
        self
    }

    pub fn with_post_copy(mut self, file: FileId, src: StorageId, dst: StorageId) -> Self {
        self.post_file_copies.push(FileCopy { file, src, dst });
        self
    }

    pub fn with_cleanup_deletion(mut self, file: FileId, storage: StorageId) -> Self {
        self.cleanup_file_deletions.push(FileDeletion { file, storage });
        self
    }
}

/// A resource lease that becomes a nested compute service for its duration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PilotJob {
    pub num_hosts: u32,
    pub cores_per_host: u32,
    pub ram_per_host: u64,
    pub duration: f64,
}

#[derive(Clone, Debug, Serialize)]
pub enum WorkflowJob {
    Standard(StandardJob),
    Pilot(PilotJob),
}

impl WorkflowJob {
    pub fn job_type(&self) -> JobType {
        match self {
            WorkflowJob::Standard(_) => JobType::Standard,
            WorkflowJob::Pilot(_) => JobType::Pilot,
        }
    }

    pub fn as_standard(&self) -> Option<&StandardJob> {
        match self {
            WorkflowJob::Standard(job) => Some(job),
            WorkflowJob::Pilot(_) => None,
        }
    }

    pub fn as_pilot(&self) -> Option<&PilotJob> {
        match self {
            WorkflowJob::Pilot(job) => Some(job),
            WorkflowJob::Standard(_) => None,
        }
    }
}

impl From<StandardJob> for WorkflowJob {
    fn from(job: StandardJob) -> Self {
        WorkflowJob::Standard(job)
    }
}

impl From<PilotJob> for WorkflowJob {
    fn from(job: PilotJob) -> Self {
        WorkflowJob::Pilot(job)
    }
}
