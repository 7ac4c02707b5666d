use std::{
    fs,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::Path,
};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, Family};

/// Address plan of one family on this node. Read-only once written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub cluster_cidr: IpNet,
    pub pod_cidr: IpNet,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfigs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<NetworkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<NetworkConfig>,
}

impl NetworkConfigs {
    /// Pairs every pod CIDR with the cluster CIDR of the same family.
    pub fn from_cidrs(cluster_cidrs: &[IpNet], pod_cidrs: &[IpNet]) -> Result<Self, ConfigError> {
        if pod_cidrs.is_empty() {
            return Err(ConfigError::NoPodCidr);
        }

        let mut configs = Self::default();
        for pod_cidr in pod_cidrs {
            let family = Family::of(pod_cidr);
            let cluster_cidr = cluster_cidrs
                .iter()
                .find(|cidr| Family::of(cidr) == family)
                .ok_or(ConfigError::MissingClusterCidr {
                    family,
                    pod_cidr: *pod_cidr,
                })?;

            if !cluster_cidr.contains(pod_cidr) {
                return Err(ConfigError::PodOutsideCluster {
                    pod_cidr: *pod_cidr,
                    cluster_cidr: *cluster_cidr,
                });
            }

            let slot = match family {
                Family::V4 => &mut configs.ipv4,
                Family::V6 => &mut configs.ipv6,
            };
            if slot.is_some() {
                return Err(ConfigError::DuplicateFamily(family));
            }
            *slot = Some(NetworkConfig {
                cluster_cidr: cluster_cidr.trunc(),
                pod_cidr: pod_cidr.trunc(),
            });
        }

        Ok(configs)
    }

    pub fn get(&self, family: Family) -> Option<&NetworkConfig> {
        match family {
            Family::V4 => self.ipv4.as_ref(),
            Family::V6 => self.ipv6.as_ref(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Family, &NetworkConfig)> {
        Family::ALL
            .into_iter()
            .filter_map(|family| self.get(family).map(|config| (family, config)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }
}

/// Parses a comma separated CIDR list such as `10.244.0.0/16,fd00:10:244::/56`.
pub fn parse_cidrs(s: &str) -> Result<Vec<IpNet>, ConfigError> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<IpNet>()
                .map_err(|source| ConfigError::InvalidCidr {
                    value: part.to_owned(),
                    source,
                })
        })
        .collect()
}

/// The `n`-th address of `net`, counted from the network address.
///
/// `n` must lie inside `net`; callers derive it from the subnet's host bits.
pub fn nth_addr(net: &IpNet, n: u128) -> IpAddr {
    match net.network() {
        IpAddr::V4(base) => {
            debug_assert!(n <= u128::from(u32::MAX), "offset {n} exceeds an ipv4 address");
            let n = u32::try_from(n).unwrap_or(u32::MAX);
            IpAddr::V4(Ipv4Addr::from(u32::from(base).wrapping_add(n)))
        }
        IpAddr::V6(base) => IpAddr::V6(Ipv6Addr::from(u128::from(base).wrapping_add(n))),
    }
}

/// First host address of `net`, which is where the node's pod gateway lives.
pub fn first_host(net: &IpNet) -> IpAddr {
    nth_addr(net, 1)
}
