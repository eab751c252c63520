use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Group of identical hosts; `amount` hosts are named `{name_prefix}{i}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupHostConfig {
    pub name: Option<String>,
    pub name_prefix: Option<String>,
    pub cpus: u32,
    pub memory: u64,
    /// Per-core speed in flop/s.
    pub cpu_speed: Option<f64>,
    pub amount: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub cpus: u32,
    pub memory: u64,
    pub cpu_speed: f64,
}

impl HostConfig {
    pub fn from_group_config(group: &GroupHostConfig, idx: Option<u32>) -> Self {
        let name = match idx {
            Some(i) => format!(
                "{}{}",
                group
                    .name_prefix
                    .clone()
                    .or_else(|| group.name.clone())
                    .unwrap_or_else(|| "host".to_string()),
                i
            ),
            None => group
                .name
                .clone()
                .or_else(|| group.name_prefix.clone())
                .unwrap_or_else(|| "host".to_string()),
        };
        HostConfig {
            name,
            cpus: group.cpus,
            memory: group.memory,
            cpu_speed: group.cpu_speed.unwrap_or(1.),
        }
    }
}

fn default_bandwidth() -> f64 {
    f64::INFINITY
}

/// Network between hosts and storages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Seconds; also the delay of every control message.
    #[serde(default)]
    pub latency: f64,
    /// Bytes per second.
    #[serde(default = "default_bandwidth")]
    pub bandwidth: f64,
    /// Concurrent transfers share the bandwidth instead of getting it in full.
    #[serde(default)]
    pub shared: bool,
    /// Transfers inside a single host or storage.
    #[serde(default = "default_bandwidth")]
    pub local_bandwidth: f64,
    #[serde(default)]
    pub local_latency: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            latency: 0.,
            bandwidth: default_bandwidth(),
            shared: false,
            local_bandwidth: default_bandwidth(),
            local_latency: 0.,
        }
    }
}

fn default_storage_bandwidth() -> f64 {
    f64::INFINITY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub name: String,
    pub capacity: u64,
    #[serde(default = "default_storage_bandwidth")]
    pub bandwidth: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeServiceKind {
    Multicore,
    Batch,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeServiceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ComputeServiceKind,
    /// Host names; all platform hosts when omitted.
    pub hosts: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub supports_standard_jobs: bool,
    #[serde(default = "default_true")]
    pub supports_pilot_jobs: bool,
    pub default_storage: Option<String>,
    /// Parsed into the properties of the service kind.
    pub properties: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub hosts: Vec<GroupHostConfig>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storages: Vec<StorageConfig>,
    #[serde(default)]
    pub compute_services: Vec<ComputeServiceConfig>,
}

impl SimulationConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml_str(&data)
    }

    pub fn from_yaml_str(data: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(data)?)
    }

    /// Expands host groups into individual hosts.
    pub fn host_configs(&self) -> Vec<HostConfig> {
        let mut hosts = Vec::new();
        for group in self.hosts.iter() {
            match group.amount {
                None => hosts.push(HostConfig::from_group_config(group, None)),
                Some(amount) => {
                    for i in 0..amount {
                        hosts.push(HostConfig::from_group_config(group, Some(i)));
                    }
                }
            }
        }
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_expand_into_named_hosts() {
        let config = SimulationConfig::from_yaml_str(
            r#"
hosts:
  - name_prefix: batch
    cpus: 10
    memory: 1000
    amount: 2
  - name: login
    cpus: 1
    memory: 10
    cpu_speed: 2.0
"#,
        )
        .unwrap();
        let hosts = config.host_configs();
        assert_eq!(
            hosts.iter().map(|h| h.name.as_str()).collect::<Vec<_>>(),
            vec!["batch0", "batch1", "login"]
        );
        assert_eq!(hosts[2].cpu_speed, 2.);
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn network_defaults_fill_missing_fields() {
        let config = SimulationConfig::from_yaml_str(
            r#"
hosts: []
network:
  latency: 0.5
  bandwidth: 1000
  shared: true
"#,
        )
        .unwrap();
        assert_eq!(config.network.latency, 0.5);
        assert_eq!(config.network.bandwidth, 1000.);
        assert!(config.network.shared);
        assert!(config.network.local_bandwidth.is_infinite());
        assert_eq!(config.network.local_latency, 0.);
    }
}
