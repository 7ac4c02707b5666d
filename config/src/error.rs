use ipnet::IpNet;
use thiserror::Error;

use crate::Family;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid cidr {value}: {source}")]
    InvalidCidr {
        value: String,
        #[source]
        source: ipnet::AddrParseError,
    },

    #[error("invalid hardware address {0}")]
    InvalidHardwareAddr(String),

    #[error("no pod cidr assigned")]
    NoPodCidr,

    #[error("no {family} cluster cidr for pod cidr {pod_cidr}")]
    MissingClusterCidr { family: Family, pod_cidr: IpNet },

    #[error("pod cidr {pod_cidr} is outside cluster cidr {cluster_cidr}")]
    PodOutsideCluster { pod_cidr: IpNet, cluster_cidr: IpNet },

    #[error("more than one {0} pod cidr")]
    DuplicateFamily(Family),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
