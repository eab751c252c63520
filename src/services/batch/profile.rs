use std::collections::BTreeMap;

use crate::config::properties::BatchHostSelection;

const EPSILON: f64 = 1e-9;

#[derive(Clone, Debug)]
struct Reservation {
    start: f64,
    end: f64,
    cores: Vec<(String, u32)>,
}

/// Cores reserved over time on every host of a batch cluster.
#[derive(Clone, Debug)]
pub struct AvailabilityProfile {
    capacity: BTreeMap<String, u32>,
    reservations: Vec<Reservation>,
}

impl AvailabilityProfile {
    pub fn new(capacity: impl IntoIterator<Item = (String, u32)>) -> Self {
        AvailabilityProfile {
            capacity: capacity.into_iter().collect(),
            reservations: Vec::new(),
        }
    }

    pub fn num_hosts(&self) -> usize {
        self.capacity.len()
    }

    /// Cores needed on `host`; `None` asks for the whole node.
    fn demand(&self, host: &str, cores: Option<u32>) -> u32 {
        let capacity = self.capacity.get(host).copied().unwrap_or(0);
        cores.unwrap_or(capacity)
    }

    pub fn reserve(&mut self, start: f64, end: f64, hosts: &[String], cores: Option<u32>) {
        if end <= start + EPSILON {
            return;
        }
        let cores = hosts
            .iter()
            .map(|h| (h.clone(), self.demand(h, cores)))
            .collect();
        self.reservations.push(Reservation { start, end, cores });
    }

    fn used_at(&self, host: &str, time: f64) -> u32 {
        self.reservations
            .iter()
            .filter(|r| r.start <= time + EPSILON && time + EPSILON < r.end)
            .flat_map(|r| r.cores.iter())
            .filter(|(h, _)| h == host)
            .map(|(_, c)| *c)
            .sum()
    }

    /// Minimum number of free cores on `host` over `[start, end)`.
    pub fn free_cores(&self, host: &str, start: f64, end: f64) -> u32 {
        let capacity = self.capacity.get(host).copied().unwrap_or(0);
        let mut points = vec![start];
        points.extend(
            self.reservations
                .iter()
                .map(|r| r.start)
                .filter(|s| *s > start && *s < end),
        );
        let used = points
            .iter()
            .map(|p| self.used_at(host, *p))
            .max()
            .unwrap_or(0);
        capacity.saturating_sub(used)
    }

    fn ever_fits(&self, nodes: u32, cores: Option<u32>) -> bool {
        let fitting = self
            .capacity
            .iter()
            .filter(|(_, cap)| cores.map_or(true, |c| c <= **cap))
            .count();
        fitting >= nodes as usize
    }

    /// Earliest time not before `after` at which `nodes` hosts have the requested
    /// cores free for `duration`, with the hosts picked according to `selection`.
    pub fn earliest_start(
        &self,
        after: f64,
        nodes: u32,
        cores: Option<u32>,
        duration: f64,
        selection: BatchHostSelection,
        cursor: usize,
    ) -> Option<(f64, Vec<String>)> {
        if nodes == 0 || !self.ever_fits(nodes, cores) {
            return None;
        }
        let mut candidates = vec![after];
        candidates.extend(
            self.reservations
                .iter()
                .map(|r| r.end)
                .filter(|end| *end > after),
        );
        candidates.sort_by(|a, b| a.total_cmp(b));
        candidates.dedup_by(|a, b| (*a - *b).abs() < EPSILON);

        for t in candidates {
            let fitting = self
                .capacity
                .keys()
                .filter_map(|h| {
                    let need = self.demand(h, cores);
                    let free = self.free_cores(h, t, t + duration);
                    (free >= need).then(|| (h.clone(), free - need))
                })
                .collect::<Vec<_>>();
            if fitting.len() >= nodes as usize {
                return Some((t, self.pick_hosts(fitting, nodes, selection, cursor)));
            }
        }
        None
    }

    fn pick_hosts(
        &self,
        mut fitting: Vec<(String, u32)>,
        nodes: u32,
        selection: BatchHostSelection,
        cursor: usize,
    ) -> Vec<String> {
        match selection {
            BatchHostSelection::FirstFit => {}
            BatchHostSelection::BestFit => {
                fitting.sort_by(|(ha, la), (hb, lb)| la.cmp(lb).then_with(|| ha.cmp(hb)));
            }
            BatchHostSelection::RoundRobin => {
                let n = self.capacity.len().max(1);
                let position = |host: &str| {
                    let index = self
                        .capacity
                        .keys()
                        .position(|h| h == host)
                        .unwrap_or(0);
                    (index + n - cursor % n) % n
                };
                fitting.sort_by_key(|(h, _)| position(h));
            }
        }
        fitting
            .into_iter()
            .take(nodes as usize)
            .map(|(h, _)| h)
            .collect()
    }

    /// Index following the last host of `hosts`, for round-robin selection.
    pub fn next_cursor(&self, hosts: &[String]) -> usize {
        hosts
            .last()
            .and_then(|last| self.capacity.keys().position(|h| h == last))
            .map_or(0, |i| (i + 1) % self.capacity.len().max(1))
    }
}
