pub mod properties;
pub mod sim_config;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unknown host {0}")]
    UnknownHost(String),
    #[error("unknown storage service {0}")]
    UnknownStorage(String),
    #[error("duplicate host {0}")]
    DuplicateHost(String),
}
