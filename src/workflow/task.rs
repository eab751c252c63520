use dslab_compute::multicore::CoresDependency;
use serde::Serialize;

use crate::workflow::{job::JobId, FileId};

pub type TaskId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TaskState {
    NotReady,
    Ready,
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkflowTask {
    pub id: String,
    pub flops: f64,
    pub min_cores: u32,
    pub max_cores: u32,
    /// Fraction of linear speedup achieved when running on more than one core.
    pub parallel_efficiency: f64,
    pub memory: u64,
    pub input_files: Vec<FileId>,
    pub output_files: Vec<FileId>,
    pub(crate) state: TaskState,
    pub(crate) failure_count: u32,
    pub(crate) start_date: Option<f64>,
    pub(crate) end_date: Option<f64>,
    pub(crate) job: Option<JobId>,
}

impl WorkflowTask {
    pub(crate) fn new(
        id: &str,
        flops: f64,
        min_cores: u32,
        max_cores: u32,
        parallel_efficiency: f64,
        memory: u64,
    ) -> Self {
        WorkflowTask {
            id: id.to_string(),
            flops,
            min_cores: min_cores.max(1),
            max_cores: max_cores.max(min_cores).max(1),
            parallel_efficiency: parallel_efficiency.clamp(0., 1.),
            memory,
            input_files: Vec::new(),
            output_files: Vec::new(),
            state: TaskState::Ready,
            failure_count: 0,
            start_date: None,
            end_date: None,
            job: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn start_date(&self) -> Option<f64> {
        self.start_date
    }

    pub fn end_date(&self) -> Option<f64> {
        self.end_date
    }

    /// Job the task was last submitted in.
    pub fn job(&self) -> Option<JobId> {
        self.job
    }

    /// Speedup model of the task on `cores` cores.
    ///
    /// The fixed part is chosen so that the speedup on `cores` cores is `cores * parallel_efficiency`.
    pub fn cores_dependency(&self, cores: u32) -> CoresDependency {
        let efficiency = self.parallel_efficiency;
        if cores <= 1 || efficiency <= 0. || efficiency >= 1. {
            return CoresDependency::Linear;
        }
        CoresDependency::LinearWithFixed {
            fixed_part: (1. / efficiency - 1.) / (cores - 1) as f64,
        }
    }

    pub fn can_be_submitted(&self) -> bool {
        matches!(
            self.state,
            TaskState::Ready | TaskState::NotReady | TaskState::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn efficiency_becomes_fixed_part() {
        let task = WorkflowTask::new("t", 100., 1, 4, 0.5, 0);
        assert!(matches!(task.cores_dependency(1), CoresDependency::Linear));
        // 1 / (f + (1 - f) / 4) == 2
        assert!(matches!(
            task.cores_dependency(4),
            CoresDependency::LinearWithFixed { fixed_part } if (fixed_part - 1. / 3.).abs() < 1e-9
        ));
        let task = WorkflowTask::new("t", 100., 1, 4, 1., 0);
        assert!(matches!(task.cores_dependency(4), CoresDependency::Linear));
    }

    #[test]
    fn core_bounds_are_normalized() {
        let task = WorkflowTask::new("t", 1., 0, 0, 2., 0);
        assert_eq!(task.min_cores, 1);
        assert_eq!(task.max_cores, 1);
        assert_eq!(task.parallel_efficiency, 1.);
    }
}
