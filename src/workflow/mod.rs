pub mod file;
pub mod job;
pub mod task;

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use thiserror::Error;

pub use file::{FileId, WorkflowFile};
pub use task::{TaskId, TaskState, WorkflowTask};

use crate::workflow::job::JobId;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum WorkflowError {
    #[error("duplicate task id {0}")]
    DuplicateTask(String),
    #[error("duplicate file id {0}")]
    DuplicateFile(String),
    #[error("file {file} is already an input or output of task {task}")]
    FileAlreadyUsed { task: String, file: String },
    #[error("file {0} already has a producer task")]
    FileAlreadyProduced(String),
    #[error("dependency {parent} -> {child} would create a cycle")]
    Cycle { parent: String, child: String },
}

/// Arena of tasks and files with the dependency graph between tasks.
#[derive(Default)]
pub struct Workflow {
    tasks: Vec<WorkflowTask>,
    files: Vec<WorkflowFile>,
    task_names: FxHashMap<String, TaskId>,
    file_names: FxHashMap<String, FileId>,
    parents: Vec<BTreeSet<TaskId>>,
    children: Vec<BTreeSet<TaskId>>,
    producers: FxHashMap<FileId, TaskId>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(
        &mut self,
        id: &str,
        flops: f64,
        min_cores: u32,
        max_cores: u32,
        parallel_efficiency: f64,
        memory: u64,
    ) -> Result<TaskId, WorkflowError> {
        if self.task_names.contains_key(id) {
            return Err(WorkflowError::DuplicateTask(id.to_string()));
        }
        let task_id = self.tasks.len();
        self.tasks.push(WorkflowTask::new(
            id,
            flops,
            min_cores,
            max_cores,
            parallel_efficiency,
            memory,
        ));
        self.parents.push(BTreeSet::new());
        self.children.push(BTreeSet::new());
        self.task_names.insert(id.to_string(), task_id);
        Ok(task_id)
    }

    pub fn add_file(&mut self, id: &str, size: u64) -> Result<FileId, WorkflowError> {
        if self.file_names.contains_key(id) {
            return Err(WorkflowError::DuplicateFile(id.to_string()));
        }
        let file_id = self.files.len();
        self.files.push(WorkflowFile {
            id: id.to_string(),
            size,
        });
        self.file_names.insert(id.to_string(), file_id);
        Ok(file_id)
    }

    /// Declares `file` as an input of `task`; a dependency on the file's producer is added.
    pub fn add_input_file(&mut self, task: TaskId, file: FileId) -> Result<(), WorkflowError> {
        self.check_unused(task, file)?;
        if let Some(&producer) = self.producers.get(&file) {
            self.add_control_dependency(producer, task)?;
        }
        self.tasks[task].input_files.push(file);
        Ok(())
    }

    /// Declares `file` as an output of `task`; every task reading it now depends on `task`.
    pub fn add_output_file(&mut self, task: TaskId, file: FileId) -> Result<(), WorkflowError> {
        self.check_unused(task, file)?;
        if self.producers.contains_key(&file) {
            return Err(WorkflowError::FileAlreadyProduced(self.files[file].id.clone()));
        }
        let consumers = (0..self.tasks.len())
            .filter(|t| self.tasks[*t].input_files.contains(&file))
            .collect::<Vec<_>>();
        for consumer in consumers {
            self.add_control_dependency(task, consumer)?;
        }
        self.producers.insert(file, task);
        self.tasks[task].output_files.push(file);
        Ok(())
    }

    pub fn add_control_dependency(
        &mut self,
        parent: TaskId,
        child: TaskId,
    ) -> Result<(), WorkflowError> {
        if parent == child || self.path_exists(child, parent) {
            return Err(WorkflowError::Cycle {
                parent: self.tasks[parent].id.clone(),
                child: self.tasks[child].id.clone(),
            });
        }
        self.parents[child].insert(parent);
        self.children[parent].insert(child);
        self.refresh_readiness(child);
        Ok(())
    }

    fn check_unused(&self, task: TaskId, file: FileId) -> Result<(), WorkflowError> {
        let t = &self.tasks[task];
        if t.input_files.contains(&file) || t.output_files.contains(&file) {
            return Err(WorkflowError::FileAlreadyUsed {
                task: t.id.clone(),
                file: self.files[file].id.clone(),
            });
        }
        Ok(())
    }

    fn path_exists(&self, from: TaskId, to: TaskId) -> bool {
        let mut stack = vec![from];
        let mut visited = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if visited.insert(current) {
                stack.extend(self.children[current].iter().copied());
            }
        }
        false
    }

    pub fn task(&self, id: TaskId) -> &WorkflowTask {
        &self.tasks[id]
    }

    pub fn file(&self, id: FileId) -> &WorkflowFile {
        &self.files[id]
    }

    pub fn task_by_name(&self, name: &str) -> Option<TaskId> {
        self.task_names.get(name).copied()
    }

    pub fn file_by_name(&self, name: &str) -> Option<FileId> {
        self.file_names.get(name).copied()
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn tasks(&self) -> impl Iterator<Item = (TaskId, &WorkflowTask)> {
        self.tasks.iter().enumerate()
    }

    pub fn parents(&self, task: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.parents[task].iter().copied()
    }

    pub fn children(&self, task: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.children[task].iter().copied()
    }

    pub fn file_producer(&self, file: FileId) -> Option<TaskId> {
        self.producers.get(&file).copied()
    }

    pub fn ready_tasks(&self) -> Vec<TaskId> {
        (0..self.tasks.len())
            .filter(|t| self.tasks[*t].state == TaskState::Ready)
            .collect()
    }

    pub fn is_done(&self) -> bool {
        self.tasks.iter().all(|t| t.state == TaskState::Completed)
    }

    /// Length of the longest path from an entry task, entry tasks being at level 0.
    pub fn top_level(&self, task: TaskId) -> usize {
        self.parents[task]
            .iter()
            .map(|p| self.top_level(*p) + 1)
            .max()
            .unwrap_or(0)
    }

    fn parents_completed(&self, task: TaskId) -> bool {
        self.parents[task]
            .iter()
            .all(|p| self.tasks[*p].state == TaskState::Completed)
    }

    fn refresh_readiness(&mut self, task: TaskId) {
        let ready = self.parents_completed(task);
        let t = &mut self.tasks[task];
        match t.state {
            TaskState::Ready if !ready => t.state = TaskState::NotReady,
            TaskState::NotReady if ready => t.state = TaskState::Ready,
            _ => {}
        }
    }

    pub(crate) fn tasks_submitted(&mut self, tasks: &[TaskId], job: JobId) {
        for &task in tasks {
            let t = &mut self.tasks[task];
            t.state = TaskState::Pending;
            t.job = Some(job);
        }
    }

    pub(crate) fn task_started(&mut self, task: TaskId, time: f64) {
        let t = &mut self.tasks[task];
        t.state = TaskState::Running;
        t.start_date = Some(time);
        t.end_date = None;
    }

    pub(crate) fn task_completed(&mut self, task: TaskId, time: f64) {
        let t = &mut self.tasks[task];
        t.state = TaskState::Completed;
        t.end_date = Some(time);
        let children = self.children[task].iter().copied().collect::<Vec<_>>();
        for child in children {
            self.refresh_readiness(child);
        }
    }

    /// Tasks that were executing become FAILED, the rest of the unfinished ones
    /// go back to READY or NOT_READY so they can be resubmitted.
    pub(crate) fn job_failed(&mut self, tasks: &[TaskId]) {
        for &task in tasks {
            match self.tasks[task].state {
                TaskState::Running => {
                    let t = &mut self.tasks[task];
                    t.state = TaskState::Failed;
                    t.failure_count += 1;
                }
                TaskState::Pending => self.reset(task),
                _ => {}
            }
        }
    }

    /// Unfinished tasks of a terminated job go back to READY or NOT_READY.
    pub(crate) fn job_terminated(&mut self, tasks: &[TaskId]) {
        for &task in tasks {
            if matches!(
                self.tasks[task].state,
                TaskState::Running | TaskState::Pending
            ) {
                self.reset(task);
            }
        }
    }

    fn reset(&mut self, task: TaskId) {
        let ready = self.parents_completed(task);
        let t = &mut self.tasks[task];
        t.state = if ready {
            TaskState::Ready
        } else {
            TaskState::NotReady
        };
        t.start_date = None;
    }
}
