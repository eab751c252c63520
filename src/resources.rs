use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capacity of a single host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostResources {
    pub cores: u32,
    pub ram: u64,
    /// Per-core speed in flop/s.
    pub flop_rate: f64,
}

/// Cores and RAM held on one host.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Allocation {
    pub hostname: String,
    pub cores: u32,
    pub ram: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HostSnapshot {
    pub hostname: String,
    pub cores: u32,
    pub idle_cores: u32,
    pub ram: u64,
    pub available_ram: u64,
    pub flop_rate: f64,
}

/// Request for `num_hosts` distinct hosts with the same per-host shape.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocationRequest {
    pub num_hosts: u32,
    pub min_cores_per_host: u32,
    pub max_cores_per_host: u32,
    pub ram_per_host: u64,
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum LedgerError {
    #[error("unknown host {0}")]
    UnknownHost(String),
    #[error("not enough resources")]
    NotEnoughResources,
    #[error("releasing {cores} cores / {ram} bytes on {hostname} exceeds its grant")]
    OverRelease {
        hostname: String,
        cores: u32,
        ram: u64,
    },
}

struct LedgerEntry {
    capacity: HostResources,
    available_cores: u32,
    available_ram: u64,
}

/// Per-host bookkeeping of the cores and RAM a service may hand out.
#[derive(Default)]
pub struct ResourceLedger {
    hosts: BTreeMap<String, LedgerEntry>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger whose capacity is exactly the given grant.
    pub fn from_allocations(allocations: &[Allocation], flop_rate: impl Fn(&str) -> f64) -> Self {
        let mut ledger = Self::new();
        for allocation in allocations {
            let (cores, ram) = ledger
                .capacity(&allocation.hostname)
                .map_or((0, 0), |c| (c.cores, c.ram));
            ledger.add_host(
                &allocation.hostname,
                HostResources {
                    cores: cores + allocation.cores,
                    ram: ram + allocation.ram,
                    flop_rate: flop_rate(&allocation.hostname),
                },
            );
        }
        ledger
    }

    pub fn add_host(&mut self, hostname: &str, capacity: HostResources) {
        self.hosts.insert(
            hostname.to_string(),
            LedgerEntry {
                available_cores: capacity.cores,
                available_ram: capacity.ram,
                capacity,
            },
        );
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(|h| h.as_str())
    }

    pub fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn capacity(&self, hostname: &str) -> Option<&HostResources> {
        self.hosts.get(hostname).map(|e| &e.capacity)
    }

    pub fn available_cores(&self, hostname: &str) -> u32 {
        self.hosts.get(hostname).map_or(0, |e| e.available_cores)
    }

    pub fn available_ram(&self, hostname: &str) -> u64 {
        self.hosts.get(hostname).map_or(0, |e| e.available_ram)
    }

    pub fn flop_rate(&self, hostname: &str) -> f64 {
        self.hosts.get(hostname).map_or(0., |e| e.capacity.flop_rate)
    }

    pub fn idle_cores(&self) -> u32 {
        self.hosts.values().map(|e| e.available_cores).sum()
    }

    /// Whether some host could ever hold `cores` and `ram` at once.
    pub fn could_ever_fit(&self, cores: u32, ram: u64) -> bool {
        self.hosts
            .values()
            .any(|e| e.capacity.cores >= cores && e.capacity.ram >= ram)
    }

    pub fn fits_now(&self, hostname: &str, cores: u32, ram: u64) -> bool {
        self.hosts
            .get(hostname)
            .is_some_and(|e| e.available_cores >= cores && e.available_ram >= ram)
    }

    pub fn is_idle(&self, hostname: &str) -> bool {
        self.hosts.get(hostname).is_some_and(|e| {
            e.available_cores == e.capacity.cores && e.available_ram == e.capacity.ram
        })
    }

    /// Picks hosts first-fit in name order and reserves them, all or nothing.
    pub fn try_allocate(
        &mut self,
        request: &AllocationRequest,
    ) -> Result<Vec<Allocation>, LedgerError> {
        let mut chosen = Vec::new();
        for (hostname, entry) in self.hosts.iter() {
            if chosen.len() == request.num_hosts as usize {
                break;
            }
            if entry.available_cores >= request.min_cores_per_host
                && entry.available_ram >= request.ram_per_host
            {
                chosen.push(Allocation {
                    hostname: hostname.clone(),
                    cores: entry.available_cores.min(request.max_cores_per_host),
                    ram: request.ram_per_host,
                });
            }
        }
        if chosen.len() < request.num_hosts as usize {
            return Err(LedgerError::NotEnoughResources);
        }
        for allocation in chosen.iter() {
            self.reserve(allocation)?;
        }
        Ok(chosen)
    }

    pub fn reserve(&mut self, allocation: &Allocation) -> Result<(), LedgerError> {
        let entry = self
            .hosts
            .get_mut(&allocation.hostname)
            .ok_or_else(|| LedgerError::UnknownHost(allocation.hostname.clone()))?;
        if entry.available_cores < allocation.cores || entry.available_ram < allocation.ram {
            return Err(LedgerError::NotEnoughResources);
        }
        entry.available_cores -= allocation.cores;
        entry.available_ram -= allocation.ram;
        Ok(())
    }

    pub fn reserve_all(&mut self, allocations: &[Allocation]) -> Result<(), LedgerError> {
        for (i, allocation) in allocations.iter().enumerate() {
            if let Err(e) = self.reserve(allocation) {
                for done in &allocations[..i] {
                    self.release(done)?;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn release(&mut self, allocation: &Allocation) -> Result<(), LedgerError> {
        let entry = self
            .hosts
            .get_mut(&allocation.hostname)
            .ok_or_else(|| LedgerError::UnknownHost(allocation.hostname.clone()))?;
        if entry.available_cores + allocation.cores > entry.capacity.cores
            || entry.available_ram + allocation.ram > entry.capacity.ram
        {
            return Err(LedgerError::OverRelease {
                hostname: allocation.hostname.clone(),
                cores: allocation.cores,
                ram: allocation.ram,
            });
        }
        entry.available_cores += allocation.cores;
        entry.available_ram += allocation.ram;
        Ok(())
    }

    pub fn release_all(&mut self, allocations: &[Allocation]) -> Result<(), LedgerError> {
        for allocation in allocations {
            self.release(allocation)?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<HostSnapshot> {
        self.hosts
            .iter()
            .map(|(hostname, e)| HostSnapshot {
                hostname: hostname.clone(),
                cores: e.capacity.cores,
                idle_cores: e.available_cores,
                ram: e.capacity.ram,
                available_ram: e.available_ram,
                flop_rate: e.capacity.flop_rate,
            })
            .collect()
    }
}
