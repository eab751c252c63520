#![allow(dead_code)]

use std::{cell::RefCell, io::Write, rc::Rc};

use dslab_core::{cast, Event, EventHandler, Id, Simulation, SimulationContext};
use env_logger::Builder;
use sugars::{rc, refcell};

use workflow_compute::{
    config::{
        properties::{BatchProperties, MulticoreProperties},
        sim_config::NetworkConfig,
    },
    ComputeSimulation, HostResources, JobEvent, JobId, ServiceArgs, ServiceId,
    WorkflowExecutionEvent,
};

pub const HOSTS: [&str; 4] = ["host0", "host1", "host2", "host3"];

pub fn init_logger() {
    let _ = Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .is_test(true)
        .try_init();
}

/// Records every job notification with the time it arrived.
pub struct Wms {
    pub events: Vec<(f64, WorkflowExecutionEvent)>,
    ctx: SimulationContext,
}

impl Wms {
    pub fn events_of(&self, job: JobId) -> Vec<(f64, WorkflowExecutionEvent)> {
        self.events
            .iter()
            .filter(|(_, e)| e.job() == job)
            .cloned()
            .collect()
    }
}

impl EventHandler for Wms {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            JobEvent { event } => {
                self.events.push((self.ctx.time(), event));
            }
        })
    }
}

/// Registers a job event recorder named `wms`.
pub fn attach_wms(sim: &mut ComputeSimulation) -> (Rc<RefCell<Wms>>, Id) {
    let ctx = sim.create_context("wms");
    let id = ctx.id();
    let wms = rc!(refcell!(Wms {
        events: Vec::new(),
        ctx
    }));
    sim.add_handler("wms", wms.clone());
    (wms, id)
}

pub struct Platform {
    pub sim: ComputeSimulation,
    pub wms: Rc<RefCell<Wms>>,
    pub wms_id: Id,
}

impl Platform {
    /// Four hosts with 10 cores at 1 flop/s each and no control message cost.
    pub fn new() -> Self {
        init_logger();
        let mut sim = ComputeSimulation::new(Simulation::new(42), NetworkConfig::default());
        for host in HOSTS {
            sim.add_host(
                host,
                HostResources {
                    cores: 10,
                    ram: 1_000_000,
                    flop_rate: 1.,
                },
            );
        }
        let (wms, wms_id) = attach_wms(&mut sim);
        Platform { sim, wms, wms_id }
    }

    pub fn batch(&mut self, properties: BatchProperties) -> ServiceId {
        self.sim
            .add_batch_service("batch", &HOSTS, None, properties)
            .unwrap()
    }

    pub fn multicore(&mut self, hosts: &[&str], properties: MulticoreProperties) -> ServiceId {
        self.sim
            .add_multicore_service("multicore", hosts, None, properties)
            .unwrap()
    }

    pub fn events(&self) -> Vec<(f64, WorkflowExecutionEvent)> {
        self.wms.borrow().events.clone()
    }

    pub fn events_of(&self, job: JobId) -> Vec<(f64, WorkflowExecutionEvent)> {
        self.wms.borrow().events_of(job)
    }
}

pub fn batch_args(nodes: u32, minutes: f64, cores: u32) -> ServiceArgs {
    ServiceArgs::from([
        ("-N".to_string(), nodes.to_string()),
        ("-t".to_string(), minutes.to_string()),
        ("-c".to_string(), cores.to_string()),
    ])
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {}, got {}",
        expected,
        actual
    );
}
