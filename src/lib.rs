#![doc = include_str!("../readme.md")]

pub mod cluster;
pub mod cluster_events;
pub mod config;
pub mod executors;
pub mod failure;
pub mod platform;
pub mod resources;
pub mod services;
pub mod simulation;
pub mod storage;
pub mod workflow;
pub mod workload_generators;

pub use cluster::Cluster;
pub use cluster_events::{JobEvent, WorkflowExecutionEvent};
pub use failure::{FailureCause, SubmitError};
pub use resources::{HostResources, ResourceLedger};
pub use services::{
    batch::BatchService, multicore::MultihostMulticoreComputeService, ComputeService, ServiceArgs,
    ServiceId,
};
pub use simulation::ComputeSimulation;
pub use workflow::{
    job::{JobId, PilotJob, StandardJob, WorkflowJob},
    Workflow,
};
