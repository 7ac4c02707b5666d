use thiserror::Error;
use weft_config::ConfigError;
use weft_devices::DeviceError;
use weft_ipam::StorageError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to encode annotations: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("kube-proxy configuration has no clusterCIDR")]
    ClusterCidrNotFound,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
