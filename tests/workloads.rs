mod common;

use common::{assert_close, attach_wms, batch_args, init_logger, Platform};
use dslab_core::Simulation;
use sugars::{rc, refcell};
use workflow_compute::{
    config::{properties::BatchProperties, sim_config::SimulationConfig, ConfigError},
    workload_generators::{
        replay::{ReplayOptions, ReplayStats, TraceReplayer},
        swf::load_from_reader,
    },
    ComputeSimulation, StandardJob, Workflow, WorkflowExecutionEvent,
};

const TRACE: &str = "\
; Computer: replay test
    1      0     0    100     2  -1  -1     2    120  -1  1  1  1  1  1  1  -1  -1
    2      5     0     50     1  -1  -1     1     -1  -1  1  1  1  1  1  1  -1  -1
    3      7     0     10     8  -1  -1     8     60  -1  1  1  1  1  1  1  -1  -1
";

#[test]
fn swf_trace_is_replayed_on_a_batch_service() {
    let mut platform = Platform::new();
    let batch = platform.batch(BatchProperties::default());
    let trace = load_from_reader(TRACE.as_bytes(), 0.).unwrap();
    assert_eq!(trace.len(), 3);

    let ctx = platform.sim.create_context("replayer");
    let replayer = rc!(refcell!(TraceReplayer::new(
        ctx,
        platform.sim.cluster(),
        batch,
        trace,
        ReplayOptions {
            cores_per_node: 10,
            max_nodes: 4,
        },
    )));
    platform.sim.add_handler("replayer", replayer.clone());
    replayer.borrow_mut().start();
    platform.sim.step_until_no_events();

    let replayer = replayer.borrow();
    assert_eq!(
        replayer.stats(),
        &ReplayStats {
            submitted: 2,
            rejected: 0,
            skipped: 1,
            completed: 2,
            failed: 0,
        }
    );
    assert!(replayer.is_done());
    assert_eq!(replayer.jobs().len(), 2);
    // trace jobs notify the replayer, not the platform's recorder
    assert!(platform.events().is_empty());
}

const CONFIG: &str = r#"
hosts:
  - name_prefix: node
    cpus: 10
    memory: 1000000
    amount: 4
storages:
  - name: shared
    capacity: 1000000
    bandwidth: 100
compute_services:
  - name: batch
    type: batch
    hosts: [node0, node1, node2]
    default_storage: shared
    properties:
      scheduling_algorithm: conservative_bf
      host_selection_algorithm: BESTFIT
  - name: interactive
    type: multicore
    hosts: [node3]
    supports_pilot_jobs: false
"#;

#[test]
fn platform_is_built_from_yaml() {
    init_logger();
    let config = SimulationConfig::from_yaml_str(CONFIG).unwrap();
    let mut sim = ComputeSimulation::from_config(Simulation::new(7), Workflow::new(), config).unwrap();
    let (wms, wms_id) = attach_wms(&mut sim);

    let cluster = sim.cluster();
    let services = cluster.borrow().service_ids();
    assert_eq!(services.len(), 2);
    let (batch, interactive) = (services[0], services[1]);
    assert_eq!(cluster.borrow().hostnames().count(), 4);
    assert!(cluster.borrow().storages().by_name("shared").is_some());

    let info = cluster.borrow().resource_information(batch).unwrap();
    assert_eq!(info.num_hosts, 3);
    let info = cluster.borrow().resource_information(interactive).unwrap();
    assert_eq!(info.num_cores()["node3"], 10);

    let task = sim
        .workflow()
        .borrow_mut()
        .add_task("task", 30., 1, 1, 1., 0)
        .unwrap();
    let job = cluster
        .borrow_mut()
        .submit_standard_job(
            batch,
            StandardJob::new(vec![task]),
            batch_args(3, 1., 1),
            wms_id,
        )
        .unwrap();
    sim.step_until_no_events();

    let events = wms.borrow().events_of(job);
    assert_close(events[0].0, 30.);
    assert_eq!(
        events[0].1,
        WorkflowExecutionEvent::StandardJobCompleted {
            job,
            service: batch
        }
    );
}

#[test]
fn pilot_jobs_can_be_disabled_per_service() {
    let config = SimulationConfig::from_yaml_str(CONFIG).unwrap();
    let sim = ComputeSimulation::from_config(Simulation::new(7), Workflow::new(), config).unwrap();
    let cluster = sim.cluster();
    let interactive = cluster.borrow().service_ids()[1];
    let service = cluster.borrow().service(interactive).unwrap();
    assert!(!service.borrow().supports_pilot_jobs());
    assert!(service.borrow().supports_standard_jobs());
}

#[test]
fn config_errors_name_the_culprit() {
    let unknown_host = r#"
hosts:
  - name: node0
    cpus: 4
    memory: 100
compute_services:
  - name: batch
    type: batch
    hosts: [node7]
"#;
    let config = SimulationConfig::from_yaml_str(unknown_host).unwrap();
    let result = ComputeSimulation::from_config(Simulation::new(1), Workflow::new(), config);
    assert!(matches!(result, Err(ConfigError::UnknownHost(host)) if host == "node7"));

    let unknown_storage = r#"
hosts:
  - name: node0
    cpus: 4
    memory: 100
compute_services:
  - name: mc
    type: multicore
    default_storage: scratch
"#;
    let config = SimulationConfig::from_yaml_str(unknown_storage).unwrap();
    let result = ComputeSimulation::from_config(Simulation::new(1), Workflow::new(), config);
    assert!(matches!(result, Err(ConfigError::UnknownStorage(name)) if name == "scratch"));

    let duplicate = r#"
hosts:
  - name: node0
    cpus: 4
    memory: 100
  - name: node0
    cpus: 8
    memory: 100
"#;
    let config = SimulationConfig::from_yaml_str(duplicate).unwrap();
    let result = ComputeSimulation::from_config(Simulation::new(1), Workflow::new(), config);
    assert!(matches!(result, Err(ConfigError::DuplicateHost(host)) if host == "node0"));

    assert!(matches!(
        SimulationConfig::from_yaml_str("hosts: 3"),
        Err(ConfigError::Yaml(_))
    ));
}
