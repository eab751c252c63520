use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::{
    services::ServiceId,
    storage::StorageId,
    workflow::{job::JobId, job::JobType, FileId},
};

/// Identifies either kind of service a failure can point at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ServiceRef {
    Compute(ServiceId),
    Storage(StorageId),
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceRef::Compute(id) => write!(f, "compute service {}", id),
            ServiceRef::Storage(id) => write!(f, "storage service {}", id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NetworkOperation {
    Sending,
    Receiving,
}

impl fmt::Display for NetworkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkOperation::Sending => write!(f, "sending"),
            NetworkOperation::Receiving => write!(f, "receiving"),
        }
    }
}

/// Reason a job (or a client request) did not succeed.
#[derive(Clone, Debug, PartialEq, Serialize, Error)]
pub enum FailureCause {
    #[error("internal fatal failure")]
    FatalFailure,
    #[error("no storage service is known for file {file}")]
    NoStorageServiceForFile { file: FileId },
    #[error("file {file} not found on storage service {storage}")]
    FileNotFound { file: FileId, storage: StorageId },
    #[error("file {file} is already on storage service {storage}")]
    FileAlreadyThere { file: FileId, storage: StorageId },
    #[error("not enough space on storage service {storage} for file {file}")]
    StorageNotEnoughSpace { file: FileId, storage: StorageId },
    #[error("{service} is down")]
    ServiceDown { service: ServiceRef },
    #[error("compute service {service} does not support {job_type} jobs")]
    JobTypeNotSupported {
        job_type: JobType,
        service: ServiceId,
    },
    #[error("compute service {service} does not have enough compute resources")]
    NotEnoughComputeResources { service: ServiceId },
    #[error("network error while {operation} on {mailbox}")]
    NetworkError {
        operation: NetworkOperation,
        mailbox: String,
    },
    #[error("network timeout while {operation} on {mailbox}")]
    NetworkTimeout {
        operation: NetworkOperation,
        mailbox: String,
    },
    #[error("job {job} cannot be terminated")]
    JobCannotBeTerminated { job: JobId },
    #[error("job {job} cannot be forgotten")]
    JobCannotBeForgotten { job: JobId },
    #[error("a compute thread has died")]
    ComputeThreadHasDied,
    #[error("job {job} ran out of its requested walltime")]
    JobTimeout { job: JobId },
}

impl FailureCause {
    pub fn service_down_compute(service: ServiceId) -> Self {
        FailureCause::ServiceDown {
            service: ServiceRef::Compute(service),
        }
    }

    pub fn service_down_storage(storage: StorageId) -> Self {
        FailureCause::ServiceDown {
            service: ServiceRef::Storage(storage),
        }
    }
}

/// Synchronous rejection of a job submission or a service query.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum SubmitError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Failure(#[from] FailureCause),
}
