use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{resources::ResourceLedger, workflow::WorkflowTask};

/// Order in which ready work units are considered for dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSelection {
    #[default]
    MaximumFlops,
    MaximumMinimumCores,
    MinimumTopLevel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostSelection {
    #[default]
    BestFit,
    FirstFit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreAllocation {
    #[default]
    Maximum,
    Minimum,
}

/// A work unit as seen by the dispatcher: its task (if any) and the task's top level.
pub struct Candidate<'a> {
    pub task: Option<&'a WorkflowTask>,
    pub top_level: usize,
}

/// Work units without a task go first, ties are broken by task id.
pub fn compare_candidates(a: &Candidate, b: &Candidate, policy: TaskSelection) -> Ordering {
    let (ta, tb) = match (a.task, b.task) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return Ordering::Less,
        (Some(_), None) => return Ordering::Greater,
        (Some(ta), Some(tb)) => (ta, tb),
    };
    let primary = match policy {
        TaskSelection::MaximumFlops => tb.flops.total_cmp(&ta.flops),
        TaskSelection::MaximumMinimumCores => tb.min_cores.cmp(&ta.min_cores),
        TaskSelection::MinimumTopLevel => a.top_level.cmp(&b.top_level),
    };
    primary.then_with(|| ta.id.cmp(&tb.id))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub hostname: String,
    pub cores: u32,
}

/// Chooses a host with at least `min_cores` idle cores and `ram` available memory.
pub fn select_host(
    ledger: &ResourceLedger,
    min_cores: u32,
    max_cores: u32,
    ram: u64,
    host_selection: HostSelection,
    core_allocation: CoreAllocation,
) -> Option<Placement> {
    let mut best: Option<(Placement, u32)> = None;
    for hostname in ledger.hostnames() {
        let available = ledger.available_cores(hostname);
        if available < min_cores || ledger.available_ram(hostname) < ram {
            continue;
        }
        let cores = match core_allocation {
            CoreAllocation::Maximum => available.min(max_cores).max(min_cores),
            CoreAllocation::Minimum => min_cores,
        };
        let leftover = available - cores;
        let placement = Placement {
            hostname: hostname.to_string(),
            cores,
        };
        match host_selection {
            HostSelection::FirstFit => return Some(placement),
            HostSelection::BestFit => {
                if best.as_ref().map_or(true, |(_, l)| leftover < *l) {
                    best = Some((placement, leftover));
                }
            }
        }
    }
    best.map(|(placement, _)| placement)
}
