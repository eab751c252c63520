use std::{cell::RefCell, rc::Rc};

use dslab_compute::multicore::Compute;
use dslab_core::{EventHandler, Id, Simulation, SimulationContext};
use dslab_network::{
    models::{ConstantBandwidthNetworkModel, SharedBandwidthNetworkModel},
    Network, NetworkModel,
};
use dslab_storage::disk::DiskBuilder;
use sugars::{boxed, rc, refcell};

use crate::{
    cluster::Cluster,
    config::{
        properties::{BatchProperties, MulticoreProperties},
        sim_config::{ComputeServiceKind, NetworkConfig, SimulationConfig},
        ConfigError,
    },
    platform::{ClusterHost, Platform},
    resources::HostResources,
    services::{
        batch::{network_listener::BatchNetworkListener, oracle::SchedulingOracle, OracleLink},
        ServiceId,
    },
    storage::{SimpleStorageService, StorageId},
    workflow::Workflow,
};

/// Owns the dslab simulation, the cluster component and the workflow shared with clients.
pub struct ComputeSimulation {
    sim: Simulation,
    cluster: Rc<RefCell<Cluster>>,
    workflow: Rc<RefCell<Workflow>>,
    network: Rc<RefCell<Network>>,
    network_config: NetworkConfig,
    listeners: Vec<Rc<RefCell<BatchNetworkListener>>>,
}

impl ComputeSimulation {
    pub fn new(sim: Simulation, network: NetworkConfig) -> Self {
        Self::with_workflow(sim, Workflow::new(), network)
    }

    pub fn with_workflow(
        mut sim: Simulation,
        workflow: Workflow,
        network_config: NetworkConfig,
    ) -> Self {
        let workflow = rc!(refcell!(workflow));
        let (network, network_id) = Self::build_network(&mut sim, &network_config);

        let platform = Platform::new(network.clone(), network_id, network_config.latency);
        let cluster_ctx = sim.create_context("cluster");
        let cluster = rc!(refcell!(Cluster::new(cluster_ctx, workflow.clone(), platform)));
        sim.add_handler("cluster", cluster.clone());
        ComputeSimulation {
            sim,
            cluster,
            workflow,
            network,
            network_config,
            listeners: Vec::new(),
        }
    }

    fn build_network(sim: &mut Simulation, config: &NetworkConfig) -> (Rc<RefCell<Network>>, Id) {
        let network_model: Box<dyn NetworkModel> = if config.shared {
            boxed!(SharedBandwidthNetworkModel::new(
                config.bandwidth,
                config.latency
            ))
        } else {
            boxed!(ConstantBandwidthNetworkModel::new(
                config.bandwidth,
                config.latency
            ))
        };

        let network_ctx = sim.create_context("network");
        let network_id = network_ctx.id();
        let network = rc!(refcell!(Network::new(network_model, network_ctx)));
        sim.add_handler("network", network.clone());
        (network, network_id)
    }

    fn add_network_node(&mut self, node: &str, location: Id) {
        let mut network = self.network.borrow_mut();
        network.add_node(
            node,
            boxed!(SharedBandwidthNetworkModel::new(
                self.network_config.local_bandwidth,
                self.network_config.local_latency
            )),
        );
        network.set_location(location, node);
    }

    /// Builds hosts, storages and compute services described by `config`.
    pub fn from_config(
        sim: Simulation,
        workflow: Workflow,
        config: SimulationConfig,
    ) -> Result<Self, ConfigError> {
        let mut simulation = Self::with_workflow(sim, workflow, config.network.clone());

        for host in config.host_configs() {
            if simulation.cluster.borrow().host(&host.name).is_some() {
                return Err(ConfigError::DuplicateHost(host.name));
            }
            simulation.add_host(
                &host.name,
                HostResources {
                    cores: host.cpus,
                    ram: host.memory,
                    flop_rate: host.cpu_speed,
                },
            );
        }
        for storage in config.storages.iter() {
            simulation.add_storage(&storage.name, storage.capacity, storage.bandwidth);
        }

        for service in config.compute_services.iter() {
            let hosts = match &service.hosts {
                Some(hosts) => hosts.clone(),
                None => simulation
                    .cluster
                    .borrow()
                    .hostnames()
                    .map(|h| h.to_string())
                    .collect(),
            };
            let hosts = hosts.iter().map(|h| h.as_str()).collect::<Vec<_>>();
            let default_storage = match &service.default_storage {
                Some(name) => Some(
                    simulation
                        .cluster
                        .borrow()
                        .storages()
                        .by_name(name)
                        .ok_or_else(|| ConfigError::UnknownStorage(name.clone()))?,
                ),
                None => None,
            };
            let properties = service
                .properties
                .clone()
                .unwrap_or(serde_yaml::Value::Null);
            let mut cluster = simulation.cluster.borrow_mut();
            let created = match service.kind {
                ComputeServiceKind::Multicore => {
                    let properties: MulticoreProperties = if properties.is_null() {
                        MulticoreProperties::default()
                    } else {
                        serde_yaml::from_value(properties)?
                    };
                    cluster.add_multicore_service(
                        &service.name,
                        &hosts,
                        service.supports_standard_jobs,
                        service.supports_pilot_jobs,
                        default_storage,
                        properties,
                    )
                }
                ComputeServiceKind::Batch => {
                    let properties: BatchProperties = if properties.is_null() {
                        BatchProperties::default()
                    } else {
                        serde_yaml::from_value(properties)?
                    };
                    cluster.add_batch_service(
                        &service.name,
                        &hosts,
                        service.supports_standard_jobs,
                        service.supports_pilot_jobs,
                        default_storage,
                        properties,
                        None,
                    )
                }
            };
            created.map_err(ConfigError::UnknownHost)?;
        }
        Ok(simulation)
    }

    pub fn add_host(&mut self, hostname: &str, resources: HostResources) {
        let compute_name = format!("compute-{}", hostname);
        let compute_ctx = self.sim.create_context(&compute_name);
        let compute_id = compute_ctx.id();
        // core admission happens in the service ledgers, computations of killed units run out here
        let compute = rc!(refcell!(Compute::new(
            resources.flop_rate,
            u32::MAX,
            resources.ram,
            compute_ctx
        )));
        self.sim.add_handler(&compute_name, compute.clone());
        self.add_network_node(hostname, compute_id);

        self.cluster
            .borrow_mut()
            .add_host(hostname, ClusterHost::new(resources, compute, compute_id));
    }

    /// Storage backed by a disk reading and writing at `bandwidth` bytes per second.
    pub fn add_storage(&mut self, name: &str, capacity: u64, bandwidth: f64) -> StorageId {
        let disk_name = format!("disk-{}", name);
        let disk_ctx = self.sim.create_context(&disk_name);
        let disk_id = disk_ctx.id();
        let disk = rc!(refcell!(
            DiskBuilder::simple(capacity, bandwidth, bandwidth).build(disk_ctx)
        ));
        self.sim.add_handler(&disk_name, disk.clone());
        self.add_network_node(&format!("storage-{}", name), disk_id);

        self.cluster
            .borrow_mut()
            .add_storage(|id| SimpleStorageService::new(id, name, disk, disk_id))
    }

    pub fn add_multicore_service(
        &mut self,
        name: &str,
        hosts: &[&str],
        default_storage: Option<StorageId>,
        properties: MulticoreProperties,
    ) -> Result<ServiceId, ConfigError> {
        self.cluster
            .borrow_mut()
            .add_multicore_service(name, hosts, true, true, default_storage, properties)
            .map_err(ConfigError::UnknownHost)
    }

    pub fn add_batch_service(
        &mut self,
        name: &str,
        hosts: &[&str],
        default_storage: Option<StorageId>,
        properties: BatchProperties,
    ) -> Result<ServiceId, ConfigError> {
        self.cluster
            .borrow_mut()
            .add_batch_service(name, hosts, true, true, default_storage, properties, None)
            .map_err(ConfigError::UnknownHost)
    }

    /// Batch service whose decisions come from `oracle`, reached through a network listener.
    pub fn add_oracle_batch_service(
        &mut self,
        name: &str,
        hosts: &[&str],
        default_storage: Option<StorageId>,
        properties: BatchProperties,
        oracle: Rc<RefCell<dyn SchedulingOracle>>,
    ) -> Result<ServiceId, ConfigError> {
        let listener_name = format!("{}-listener", name);
        let listener_ctx = self.sim.create_context(&listener_name);
        let listener = rc!(refcell!(BatchNetworkListener::new(
            listener_ctx,
            self.cluster.borrow().get_id(),
            oracle.clone()
        )));
        self.sim.add_handler(&listener_name, listener.clone());
        let link = OracleLink::new(listener.borrow().get_id(), &listener_name, oracle);
        self.listeners.push(listener);
        self.cluster
            .borrow_mut()
            .add_batch_service(name, hosts, true, true, default_storage, properties, Some(link))
            .map_err(ConfigError::UnknownHost)
    }

    pub fn create_context(&mut self, name: &str) -> SimulationContext {
        self.sim.create_context(name)
    }

    pub fn add_handler(&mut self, name: &str, handler: Rc<RefCell<dyn EventHandler>>) -> Id {
        self.sim.add_handler(name, handler)
    }

    pub fn cluster(&self) -> Rc<RefCell<Cluster>> {
        self.cluster.clone()
    }

    pub fn workflow(&self) -> Rc<RefCell<Workflow>> {
        self.workflow.clone()
    }

    pub fn time(&self) -> f64 {
        self.sim.time()
    }

    pub fn event_count(&self) -> u64 {
        self.sim.event_count()
    }

    pub fn step_until_no_events(&mut self) {
        self.sim.step_until_no_events();
    }

    pub fn step_for_duration(&mut self, duration: f64) {
        self.sim.step_for_duration(duration);
    }

    pub fn step_until_time(&mut self, time: f64) {
        self.sim.step_until_time(time);
    }
}
