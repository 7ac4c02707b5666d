use std::path::PathBuf;

use ipnet::IpNet;
use thiserror::Error;
use weft_config::ConfigError;

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("subnet {subnet} is too small: {host_bits} host bits")]
    SubnetTooSmall { subnet: IpNet, host_bits: u8 },

    #[error("subnet {subnet} has no available address")]
    Exhausted { subnet: IpNet },

    #[error("invalid allocation record: {0}")]
    InvalidRecord(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt allocation store {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode allocation store: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("allocation store {0} is not initialized, is weftd running on this node?")]
    NotBootstrapped(PathBuf),

    #[error("network config at {0} differs from the one requested")]
    NetworkChanged(PathBuf),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ipam(#[from] IpamError),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| StorageError::Io { path, source }
    }
}
