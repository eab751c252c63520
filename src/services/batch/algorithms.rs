use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    config::properties::{BatchHostSelection, BatchSchedulingAlgorithm},
    services::{batch::profile::AvailabilityProfile, WaitTimeQuery},
};

const EPSILON: f64 = 1e-9;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostSlot {
    pub name: String,
    pub cores: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunningSlot {
    pub job_id: String,
    pub hosts: Vec<String>,
    pub cores_per_node: u32,
    /// Time the job's walltime runs out.
    pub end_time: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedSlot {
    pub job_id: String,
    pub nodes: u32,
    pub cores_per_node: u32,
    pub walltime: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartDecision {
    pub job_id: String,
    pub hosts: Vec<String>,
}

/// What a batch scheduler knows at one instant: hosts, running jobs and the queue in order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulingState {
    pub now: f64,
    pub hosts: Vec<HostSlot>,
    pub running: Vec<RunningSlot>,
    pub queue: Vec<QueuedSlot>,
}

impl SchedulingState {
    pub fn base_profile(&self) -> AvailabilityProfile {
        let mut profile =
            AvailabilityProfile::new(self.hosts.iter().map(|h| (h.name.clone(), h.cores)));
        for job in self.running.iter() {
            profile.reserve(
                self.now,
                job.end_time.max(self.now),
                &job.hosts,
                Some(job.cores_per_node),
            );
        }
        profile
    }

    /// Jobs to start right now. `cursor` carries round-robin state between calls.
    pub fn decide(
        &self,
        algorithm: BatchSchedulingAlgorithm,
        selection: BatchHostSelection,
        cursor: &mut usize,
    ) -> Vec<StartDecision> {
        match algorithm {
            BatchSchedulingAlgorithm::Fcfs => self.decide_fcfs(selection, cursor),
            BatchSchedulingAlgorithm::EasyBf => self.decide_easy(selection, cursor),
            BatchSchedulingAlgorithm::ConservativeBf | BatchSchedulingAlgorithm::Oracle => {
                self.decide_conservative(selection, cursor)
            }
        }
    }

    fn start_now(
        &self,
        profile: &mut AvailabilityProfile,
        job: &QueuedSlot,
        selection: BatchHostSelection,
        cursor: &mut usize,
    ) -> Option<StartDecision> {
        let (start, hosts) = profile.earliest_start(
            self.now,
            job.nodes,
            Some(job.cores_per_node),
            job.walltime,
            selection,
            *cursor,
        )?;
        if start > self.now + EPSILON {
            return None;
        }
        profile.reserve(
            self.now,
            self.now + job.walltime,
            &hosts,
            Some(job.cores_per_node),
        );
        *cursor = profile.next_cursor(&hosts);
        Some(StartDecision {
            job_id: job.job_id.clone(),
            hosts,
        })
    }

    fn decide_fcfs(&self, selection: BatchHostSelection, cursor: &mut usize) -> Vec<StartDecision> {
        let mut profile = self.base_profile();
        let mut decisions = Vec::new();
        for job in self.queue.iter() {
            match self.start_now(&mut profile, job, selection, cursor) {
                Some(decision) => decisions.push(decision),
                None => break,
            }
        }
        decisions
    }

    fn decide_easy(&self, selection: BatchHostSelection, cursor: &mut usize) -> Vec<StartDecision> {
        let mut profile = self.base_profile();
        let mut decisions = Vec::new();
        let mut shadow_reserved = false;
        for job in self.queue.iter() {
            if let Some(decision) = self.start_now(&mut profile, job, selection, cursor) {
                decisions.push(decision);
                continue;
            }
            if !shadow_reserved {
                // the first blocked job keeps its earliest start, later ones may not delay it
                if let Some((start, hosts)) = profile.earliest_start(
                    self.now,
                    job.nodes,
                    Some(job.cores_per_node),
                    job.walltime,
                    selection,
                    *cursor,
                ) {
                    profile.reserve(start, start + job.walltime, &hosts, Some(job.cores_per_node));
                }
                shadow_reserved = true;
            }
        }
        decisions
    }

    fn decide_conservative(
        &self,
        selection: BatchHostSelection,
        cursor: &mut usize,
    ) -> Vec<StartDecision> {
        let mut profile = self.base_profile();
        let mut decisions = Vec::new();
        for job in self.queue.iter() {
            let Some((start, hosts)) = profile.earliest_start(
                self.now,
                job.nodes,
                Some(job.cores_per_node),
                job.walltime,
                selection,
                *cursor,
            ) else {
                continue;
            };
            profile.reserve(start, start + job.walltime, &hosts, Some(job.cores_per_node));
            if start <= self.now + EPSILON {
                *cursor = profile.next_cursor(&hosts);
                decisions.push(StartDecision {
                    job_id: job.job_id.clone(),
                    hosts,
                });
            }
        }
        decisions
    }

    /// Profile with every queued job placed where the algorithm would eventually start it,
    /// and the time before which no new job may start.
    fn projected_profile(&self, algorithm: BatchSchedulingAlgorithm) -> (AvailabilityProfile, f64) {
        let mut profile = self.base_profile();
        let mut not_before = self.now;
        for job in self.queue.iter() {
            let after = match algorithm {
                BatchSchedulingAlgorithm::Fcfs => not_before,
                _ => self.now,
            };
            let Some((start, hosts)) = profile.earliest_start(
                after,
                job.nodes,
                Some(job.cores_per_node),
                job.walltime,
                BatchHostSelection::FirstFit,
                0,
            ) else {
                continue;
            };
            profile.reserve(start, start + job.walltime, &hosts, Some(job.cores_per_node));
            not_before = not_before.max(start);
        }
        let floor = match algorithm {
            BatchSchedulingAlgorithm::Fcfs => not_before,
            _ => self.now,
        };
        (profile, floor)
    }

    /// Seconds each hypothetical whole-node job would wait before starting.
    pub fn estimate_waiting_times(
        &self,
        algorithm: BatchSchedulingAlgorithm,
        queries: &[WaitTimeQuery],
    ) -> BTreeMap<String, f64> {
        let (profile, floor) = self.projected_profile(algorithm);
        queries
            .iter()
            .filter_map(|q| {
                let (start, _) = profile.earliest_start(
                    floor,
                    q.num_hosts,
                    None,
                    q.duration,
                    BatchHostSelection::FirstFit,
                    0,
                )?;
                Some((q.id.clone(), start - self.now))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(queue: Vec<QueuedSlot>) -> SchedulingState {
        SchedulingState {
            now: 0.,
            hosts: (1..=2)
                .map(|i| HostSlot {
                    name: format!("h{}", i),
                    cores: 4,
                })
                .collect(),
            running: vec![RunningSlot {
                job_id: "r".to_string(),
                hosts: vec!["h1".to_string()],
                cores_per_node: 4,
                end_time: 100.,
            }],
            queue,
        }
    }

    fn queued(id: &str, nodes: u32, walltime: f64) -> QueuedSlot {
        QueuedSlot {
            job_id: id.to_string(),
            nodes,
            cores_per_node: 4,
            walltime,
        }
    }

    fn started(
        state: &SchedulingState,
        algorithm: BatchSchedulingAlgorithm,
    ) -> Vec<String> {
        let mut cursor = 0;
        state
            .decide(algorithm, BatchHostSelection::FirstFit, &mut cursor)
            .into_iter()
            .map(|d| d.job_id)
            .collect()
    }

    #[test]
    fn fcfs_never_overtakes_the_head() {
        let state = state(vec![queued("big", 2, 50.), queued("small", 1, 50.)]);
        assert!(started(&state, BatchSchedulingAlgorithm::Fcfs).is_empty());
    }

    #[test]
    fn backfilling_starts_jobs_that_do_not_delay_the_head() {
        let state = state(vec![queued("big", 2, 50.), queued("small", 1, 50.)]);
        assert_eq!(
            started(&state, BatchSchedulingAlgorithm::EasyBf),
            vec!["small".to_string()]
        );
        assert_eq!(
            started(&state, BatchSchedulingAlgorithm::ConservativeBf),
            vec!["small".to_string()]
        );

        let state = state_with_long_small();
        assert!(started(&state, BatchSchedulingAlgorithm::EasyBf).is_empty());
        assert!(started(&state, BatchSchedulingAlgorithm::ConservativeBf).is_empty());
    }

    fn state_with_long_small() -> SchedulingState {
        state(vec![queued("big", 2, 50.), queued("small", 1, 200.)])
    }

    #[test]
    fn estimates_account_for_running_and_queued_jobs() {
        let state = state(vec![queued("big", 2, 50.)]);
        let queries = vec![
            WaitTimeQuery {
                id: "one".to_string(),
                num_hosts: 1,
                duration: 10.,
            },
            WaitTimeQuery {
                id: "two".to_string(),
                num_hosts: 2,
                duration: 10.,
            },
        ];
        let conservative =
            state.estimate_waiting_times(BatchSchedulingAlgorithm::ConservativeBf, &queries);
        assert_eq!(conservative["one"], 0.);
        assert_eq!(conservative["two"], 150.);

        let fcfs = state.estimate_waiting_times(BatchSchedulingAlgorithm::Fcfs, &queries);
        assert_eq!(fcfs["one"], 150.);
    }
}
