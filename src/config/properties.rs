use serde::{Deserialize, Serialize};

use crate::executors::selection::{CoreAllocation, HostSelection, TaskSelection};

/// Tunables of a standard job executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorProperties {
    /// Delay before a work unit starts doing anything, in seconds.
    pub thread_startup_overhead: f64,
    pub task_selection: TaskSelection,
    pub host_selection: HostSelection,
    pub core_allocation: CoreAllocation,
    /// File transfers longer than this fail with a network timeout.
    pub network_timeout: Option<f64>,
}

impl Default for ExecutorProperties {
    fn default() -> Self {
        Self {
            thread_startup_overhead: 0.,
            task_selection: TaskSelection::default(),
            host_selection: HostSelection::default(),
            core_allocation: CoreAllocation::default(),
            network_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticoreProperties {
    #[serde(flatten)]
    pub executor: ExecutorProperties,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSchedulingAlgorithm {
    #[default]
    Fcfs,
    EasyBf,
    ConservativeBf,
    /// Decisions come from an external scheduler through the network listener.
    Oracle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchHostSelection {
    #[default]
    FirstFit,
    BestFit,
    RoundRobin,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchProperties {
    pub scheduling_algorithm: BatchSchedulingAlgorithm,
    pub host_selection_algorithm: BatchHostSelection,
    #[serde(flatten)]
    pub executor: ExecutorProperties,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_parse_with_defaults() {
        let props: BatchProperties = serde_yaml::from_str(
            "scheduling_algorithm: conservative_bf\nhost_selection_algorithm: BESTFIT\nthread_startup_overhead: 0.5\n",
        )
        .unwrap();
        assert_eq!(
            props.scheduling_algorithm,
            BatchSchedulingAlgorithm::ConservativeBf
        );
        assert_eq!(props.host_selection_algorithm, BatchHostSelection::BestFit);
        assert_eq!(props.executor.thread_startup_overhead, 0.5);
        assert_eq!(props.executor.task_selection, TaskSelection::MaximumFlops);
    }
}
