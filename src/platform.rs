use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use dslab_compute::multicore::{Compute, CoresDependency};
use dslab_core::Id;
use dslab_network::Network;
use rustc_hash::FxHashMap;

use crate::{
    executors::work_unit::WorkUnitId, failure::FailureCause, resources::HostResources,
    services::ServiceId, workflow::job::JobId,
};

/// Asynchronous request served by a dslab component: a computation, a transfer or disk I/O.
///
/// Request ids are only unique per serving component, so the component id is part of the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IoRequest {
    pub component: Id,
    pub id: u64,
}

/// Work unit that is waiting for a request to complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Waiter {
    pub service: ServiceId,
    pub job: JobId,
    pub unit: WorkUnitId,
}

pub struct ClusterHost {
    pub resources: HostResources,
    compute: Rc<RefCell<Compute>>,
    compute_id: Id,
}

impl ClusterHost {
    pub fn new(resources: HostResources, compute: Rc<RefCell<Compute>>, compute_id: Id) -> Self {
        ClusterHost {
            resources,
            compute,
            compute_id,
        }
    }

    /// Network location of the host.
    pub fn location(&self) -> Id {
        self.compute_id
    }
}

/// Hosts, network and the requests work units are waiting on.
pub struct Platform {
    hosts: BTreeMap<String, ClusterHost>,
    network: Rc<RefCell<Network>>,
    network_id: Id,
    latency: f64,
    waiters: FxHashMap<IoRequest, Waiter>,
}

impl Platform {
    pub fn new(network: Rc<RefCell<Network>>, network_id: Id, latency: f64) -> Self {
        Platform {
            hosts: BTreeMap::new(),
            network,
            network_id,
            latency,
            waiters: FxHashMap::default(),
        }
    }

    pub fn add_host(&mut self, hostname: &str, host: ClusterHost) {
        self.hosts.insert(hostname.to_string(), host);
    }

    pub fn host(&self, hostname: &str) -> Option<&ClusterHost> {
        self.hosts.get(hostname)
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(|h| h.as_str())
    }

    /// Delay of a control message between two components.
    pub fn latency(&self) -> f64 {
        self.latency
    }

    /// Runs `flops` on `cores` cores of `hostname`; `CompFinished` goes to `requester`.
    pub fn run_compute(
        &mut self,
        hostname: &str,
        flops: f64,
        cores: u32,
        dependency: CoresDependency,
        requester: Id,
    ) -> Result<IoRequest, FailureCause> {
        let host = self.hosts.get(hostname).ok_or(FailureCause::FatalFailure)?;
        // memory is accounted by the service ledgers
        let id = host
            .compute
            .borrow_mut()
            .run(flops, 0, cores, cores, dependency, requester);
        Ok(IoRequest {
            component: host.compute_id,
            id,
        })
    }

    /// Moves `size` bytes from `src` to `dst`; `DataTransferCompleted` goes to `requester`.
    pub fn transfer(&mut self, src: Id, dst: Id, size: u64, requester: Id) -> IoRequest {
        let id = self
            .network
            .borrow_mut()
            .transfer_data(src, dst, size as f64, requester);
        IoRequest {
            component: self.network_id,
            id: id as u64,
        }
    }

    pub fn track(&mut self, request: IoRequest, waiter: Waiter) {
        self.waiters.insert(request, waiter);
    }

    /// Drops interest in a request; its completion will be ignored.
    pub fn forget(&mut self, request: IoRequest) {
        self.waiters.remove(&request);
    }

    pub fn take_waiter(&mut self, request: IoRequest) -> Option<Waiter> {
        self.waiters.remove(&request)
    }

    /// Number of requests some work unit still waits on.
    pub fn num_waiting(&self) -> usize {
        self.waiters.len()
    }
}
