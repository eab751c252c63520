use std::{cell::RefCell, rc::Rc};

use dslab_core::{cast, log_debug, log_info, log_warn, Event, EventHandler, Id, SimulationContext};
use serde::Serialize;

use crate::{
    cluster::Cluster,
    cluster_events::{JobEvent, WorkflowExecutionEvent},
    services::{ServiceArgs, ServiceId},
    workflow::job::{JobId, StandardJob},
    workload_generators::swf::TraceJob,
};

#[derive(Clone, Serialize)]
pub struct SubmitTraceJob {
    pub index: usize,
}

/// How trace jobs are shaped into batch requests.
#[derive(Clone, Debug)]
pub struct ReplayOptions {
    /// Cores per node requested with `-c`, also used for tasks without core bounds.
    pub cores_per_node: u32,
    /// Jobs asking for more nodes are skipped.
    pub max_nodes: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ReplayStats {
    pub submitted: u64,
    pub rejected: u64,
    pub skipped: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Submits every trace job to a batch service at its arrival time, one task per job.
pub struct TraceReplayer {
    trace: Vec<(f64, TraceJob)>,
    options: ReplayOptions,
    service: ServiceId,
    cluster: Rc<RefCell<Cluster>>,
    jobs: Vec<JobId>,
    stats: ReplayStats,
    ctx: SimulationContext,
}

impl TraceReplayer {
    pub fn new(
        ctx: SimulationContext,
        cluster: Rc<RefCell<Cluster>>,
        service: ServiceId,
        trace: Vec<(f64, TraceJob)>,
        options: ReplayOptions,
    ) -> Self {
        TraceReplayer {
            trace,
            options,
            service,
            cluster,
            jobs: Vec::new(),
            stats: ReplayStats::default(),
            ctx,
        }
    }

    pub fn get_id(&self) -> Id {
        self.ctx.id()
    }

    /// Schedules the arrival of every trace job.
    pub fn start(&mut self) {
        let now = self.ctx.time();
        for (index, (time, _)) in self.trace.iter().enumerate() {
            self.ctx
                .emit_self(SubmitTraceJob { index }, (*time - now).max(0.));
        }
        log_info!(self.ctx, "replaying {} trace jobs", self.trace.len());
    }

    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    pub fn jobs(&self) -> &[JobId] {
        &self.jobs
    }

    pub fn is_done(&self) -> bool {
        self.stats.completed + self.stats.failed == self.stats.submitted
            && self.stats.submitted + self.stats.rejected + self.stats.skipped
                == self.trace.len() as u64
    }

    fn submit(&mut self, index: usize) {
        let Some((_, job)) = self.trace.get(index) else {
            return;
        };
        if job.num_nodes > self.options.max_nodes {
            log_debug!(self.ctx, "skipping trace job {}: {} nodes", job.id, job.num_nodes);
            self.stats.skipped += 1;
            return;
        }
        let cores = self.options.cores_per_node;
        let min_cores = job.min_cores.unwrap_or(cores);
        let max_cores = job.max_cores.unwrap_or(cores);

        let cluster = self.cluster.clone();
        let mut cluster = cluster.borrow_mut();
        let workflow = cluster.workflow();
        let task = workflow.borrow_mut().add_task(
            &job.id,
            job.flops,
            min_cores,
            max_cores,
            job.parallel_efficiency,
            0,
        );
        let task = match task {
            Ok(task) => task,
            Err(e) => {
                log_warn!(self.ctx, "trace job {}: {}", job.id, e);
                self.stats.rejected += 1;
                return;
            }
        };

        let args = ServiceArgs::from([
            ("-N".to_string(), job.num_nodes.to_string()),
            ("-t".to_string(), (job.requested_time / 60.).to_string()),
            ("-c".to_string(), cores.to_string()),
        ]);
        match cluster.submit_standard_job(
            self.service,
            StandardJob::new(vec![task]),
            args,
            self.ctx.id(),
        ) {
            Ok(id) => {
                self.jobs.push(id);
                self.stats.submitted += 1;
            }
            Err(e) => {
                log_warn!(self.ctx, "trace job {} rejected: {}", job.id, e);
                self.stats.rejected += 1;
            }
        }
    }
}

impl EventHandler for TraceReplayer {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            SubmitTraceJob { index } => {
                self.submit(index);
            }
            JobEvent { event } => {
                match event {
                    WorkflowExecutionEvent::StandardJobCompleted { .. } => {
                        self.stats.completed += 1
                    }
                    WorkflowExecutionEvent::StandardJobFailed { job, cause, .. } => {
                        log_debug!(self.ctx, "trace job {} failed: {}", job, cause);
                        self.stats.failed += 1;
                    }
                    other => log_warn!(self.ctx, "unexpected job event {:?}", other),
                }
            }
        })
    }
}
