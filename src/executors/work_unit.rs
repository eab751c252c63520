use std::collections::BTreeSet;

use crate::workflow::{
    job::{FileCopy, FileDeletion, StandardJob},
    TaskId, Workflow,
};

pub type WorkUnitId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkUnitState {
    NonReady,
    Ready,
    Running,
    Completed,
}

/// A piece of a standard job: file copies, at most one task, then more copies and deletions.
#[derive(Clone, Debug, Default)]
pub struct WorkUnit {
    pub task: Option<TaskId>,
    pub pre_file_copies: Vec<FileCopy>,
    pub post_file_copies: Vec<FileCopy>,
    pub cleanup_file_deletions: Vec<FileDeletion>,
    parents: BTreeSet<WorkUnitId>,
    children: BTreeSet<WorkUnitId>,
}

impl WorkUnit {
    pub fn parents(&self) -> impl Iterator<Item = WorkUnitId> + '_ {
        self.parents.iter().copied()
    }

    pub fn children(&self) -> impl Iterator<Item = WorkUnitId> + '_ {
        self.children.iter().copied()
    }
}

/// Dependency graph of the work units of one standard job.
pub struct WorkUnitGraph {
    units: Vec<WorkUnit>,
    states: Vec<WorkUnitState>,
    non_ready: BTreeSet<WorkUnitId>,
    ready: BTreeSet<WorkUnitId>,
    running: BTreeSet<WorkUnitId>,
    completed: BTreeSet<WorkUnitId>,
}

impl WorkUnitGraph {
    /// Splits a job into a pre-copy unit, one unit per task, a post-copy unit and
    /// a cleanup unit, the copy units only when the job has such copies.
    pub fn from_job(job: &StandardJob, workflow: &Workflow) -> Self {
        let mut units = Vec::new();

        let pre = (!job.pre_file_copies.is_empty()).then(|| {
            units.push(WorkUnit {
                pre_file_copies: job.pre_file_copies.clone(),
                ..Default::default()
            });
            units.len() - 1
        });

        let task_units = job
            .tasks
            .iter()
            .map(|task| {
                units.push(WorkUnit {
                    task: Some(*task),
                    ..Default::default()
                });
                (*task, units.len() - 1)
            })
            .collect::<Vec<_>>();

        let post = (!job.post_file_copies.is_empty()).then(|| {
            units.push(WorkUnit {
                post_file_copies: job.post_file_copies.clone(),
                ..Default::default()
            });
            units.len() - 1
        });

        let cleanup = (!job.cleanup_file_deletions.is_empty()).then(|| {
            units.push(WorkUnit {
                cleanup_file_deletions: job.cleanup_file_deletions.clone(),
                ..Default::default()
            });
            units.len() - 1
        });

        let mut graph = WorkUnitGraph {
            states: vec![WorkUnitState::NonReady; units.len()],
            units,
            non_ready: BTreeSet::new(),
            ready: BTreeSet::new(),
            running: BTreeSet::new(),
            completed: BTreeSet::new(),
        };

        for (task, unit) in task_units.iter() {
            if let Some(pre) = pre {
                graph.add_dependency(pre, *unit);
            }
            for child in workflow.children(*task) {
                if let Some((_, child_unit)) = task_units.iter().find(|(t, _)| *t == child) {
                    graph.add_dependency(*unit, *child_unit);
                }
            }
            if let Some(next) = post.or(cleanup) {
                graph.add_dependency(*unit, next);
            }
        }
        if task_units.is_empty() {
            if let (Some(pre), Some(next)) = (pre, post.or(cleanup)) {
                graph.add_dependency(pre, next);
            }
        }
        if let (Some(post), Some(cleanup)) = (post, cleanup) {
            graph.add_dependency(post, cleanup);
        }

        for id in 0..graph.units.len() {
            if graph.units[id].parents.is_empty() {
                graph.states[id] = WorkUnitState::Ready;
                graph.ready.insert(id);
            } else {
                graph.non_ready.insert(id);
            }
        }
        graph
    }

    fn add_dependency(&mut self, parent: WorkUnitId, child: WorkUnitId) {
        self.units[parent].children.insert(child);
        self.units[child].parents.insert(parent);
    }

    pub fn unit(&self, id: WorkUnitId) -> &WorkUnit {
        &self.units[id]
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn state(&self, id: WorkUnitId) -> WorkUnitState {
        self.states[id]
    }

    pub fn ready(&self) -> impl Iterator<Item = WorkUnitId> + '_ {
        self.ready.iter().copied()
    }

    pub fn all_completed(&self) -> bool {
        self.completed.len() == self.units.len()
    }

    pub fn start(&mut self, id: WorkUnitId) {
        if self.ready.remove(&id) {
            self.running.insert(id);
            self.states[id] = WorkUnitState::Running;
        }
    }

    /// Marks a running unit completed and returns the children that became ready.
    pub fn complete(&mut self, id: WorkUnitId) -> Vec<WorkUnitId> {
        if !self.running.remove(&id) {
            return Vec::new();
        }
        self.completed.insert(id);
        self.states[id] = WorkUnitState::Completed;

        let mut newly_ready = Vec::new();
        let children = self.units[id].children.iter().copied().collect::<Vec<_>>();
        for child in children {
            let ready = self.units[child]
                .parents
                .iter()
                .all(|p| self.states[*p] == WorkUnitState::Completed);
            if ready && self.non_ready.remove(&child) {
                self.ready.insert(child);
                self.states[child] = WorkUnitState::Ready;
                newly_ready.push(child);
            }
        }
        newly_ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_follow_job_structure() {
        let mut workflow = Workflow::new();
        let a = workflow.add_task("a", 1., 1, 1, 1., 0).unwrap();
        let b = workflow.add_task("b", 1., 1, 1, 1., 0).unwrap();
        workflow.add_control_dependency(a, b).unwrap();
        let job = StandardJob::new(vec![a, b])
            .with_pre_copy(0, 0, 1)
            .with_cleanup_deletion(0, 1);

        let mut graph = WorkUnitGraph::from_job(&job, &workflow);
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.ready().collect::<Vec<_>>(), vec![0]);
        assert_eq!(graph.unit(2).parents().collect::<Vec<_>>(), vec![0, 1]);

        graph.start(0);
        assert_eq!(graph.complete(0), vec![1]);
        graph.start(1);
        assert_eq!(graph.complete(1), vec![2]);
        graph.start(2);
        assert_eq!(graph.complete(2), vec![3]);
        graph.start(3);
        graph.complete(3);
        assert!(graph.all_completed());
    }

    #[test]
    fn ready_iff_parents_completed() {
        let mut workflow = Workflow::new();
        let a = workflow.add_task("a", 1., 1, 1, 1., 0).unwrap();
        let b = workflow.add_task("b", 1., 1, 1, 1., 0).unwrap();
        let c = workflow.add_task("c", 1., 1, 1, 1., 0).unwrap();
        workflow.add_control_dependency(a, c).unwrap();
        workflow.add_control_dependency(b, c).unwrap();
        let mut graph = WorkUnitGraph::from_job(&StandardJob::new(vec![a, b, c]), &workflow);

        graph.start(0);
        graph.start(1);
        assert!(graph.complete(0).is_empty());
        assert_eq!(graph.state(2), WorkUnitState::NonReady);
        assert_eq!(graph.complete(1), vec![2]);
    }
}
