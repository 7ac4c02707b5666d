use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use serde::Serialize;
use weft_devices::NetworkInfo;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Ip {
    /// `"4"` or `"6"`, only present in results before 1.0.0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<&'static str>,
    pub address: IpNet,
    pub gateway: IpAddr,
    /// Index into the result's interface list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Route {
    pub dst: IpNet,
    pub gw: IpAddr,
}

impl Ip {
    pub fn new(network: &NetworkInfo, interface: usize, with_version: bool) -> Self {
        let version = match network.addr {
            IpNet::V4(_) => "4",
            IpNet::V6(_) => "6",
        };
        Self {
            version: with_version.then_some(version),
            address: network.addr,
            gateway: network.gateway,
            interface: Some(interface),
        }
    }
}

impl Route {
    /// Default and cluster routes installed inside the container.
    pub fn for_network(network: &NetworkInfo) -> [Self; 2] {
        let default = match network.gateway {
            IpAddr::V4(_) => IpNet::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => IpNet::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
        .unwrap_or(network.cluster_cidr);

        [
            Self {
                dst: default,
                gw: network.gateway,
            },
            Self {
                dst: network.cluster_cidr,
                gw: network.gateway,
            },
        ]
    }
}
