use std::{fmt, net::IpAddr, path::PathBuf};

use ipnet::IpNet;
use weft_config::{Family, HardwareAddr};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub index: u32,
    pub kind: LinkKind,
    pub mac: Option<HardwareAddr>,
    /// Global scope addresses only.
    pub addrs: Vec<IpNet>,
    pub up: bool,
}

impl Link {
    pub fn addr_of(&self, family: Family) -> Option<IpNet> {
        self.addrs
            .iter()
            .find(|addr| Family::of(addr) == family)
            .copied()
    }

    pub fn has_addr(&self, addr: &IpNet) -> bool {
        self.addrs.contains(addr)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Veth,
    Vxlan(VxlanInfo),
    /// Physical devices report no kind.
    Other(Option<String>),
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Bridge => f.write_str("bridge"),
            LinkKind::Veth => f.write_str("veth"),
            LinkKind::Vxlan(_) => f.write_str("vxlan"),
            LinkKind::Other(Some(kind)) => f.write_str(kind),
            LinkKind::Other(None) => f.write_str("physical"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VxlanInfo {
    pub vni: u32,
    pub local: Option<IpAddr>,
    pub port: u16,
    pub learning: bool,
}

/// Desired shape of a VXLAN device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VxlanSpec {
    pub name: String,
    pub vni: u32,
    pub port: u16,
    pub learning: bool,
    /// Underlay address the tunnel is bound to.
    pub local: IpAddr,
    /// Underlay device.
    pub parent: String,
    /// Only applied when the device is created.
    pub mac: HardwareAddr,
    pub addr: IpNet,
}

impl VxlanSpec {
    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }

    fn matches(&self, info: &VxlanInfo) -> bool {
        info.vni == self.vni
            && info.port == self.port
            && info.learning == self.learning
            && info.local == Some(self.local)
    }
}

/// How an existing link compares to the device we want under its name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Configured,
    Misconfigured,
    Conflicting,
    Absent,
}

impl LinkState {
    pub fn bridge(link: Option<&Link>, addrs: &[IpNet]) -> Self {
        let Some(link) = link else {
            return LinkState::Absent;
        };
        if link.kind != LinkKind::Bridge {
            return LinkState::Conflicting;
        }
        if !link.up || !addrs.iter().all(|addr| link.has_addr(addr)) {
            return LinkState::Misconfigured;
        }
        LinkState::Configured
    }

    pub fn vxlan(link: Option<&Link>, spec: &VxlanSpec) -> Self {
        let Some(link) = link else {
            return LinkState::Absent;
        };
        let LinkKind::Vxlan(info) = &link.kind else {
            return LinkState::Conflicting;
        };
        if !spec.matches(info) || !link.up || !link.has_addr(&spec.addr) {
            return LinkState::Misconfigured;
        }
        LinkState::Configured
    }

    /// A VXLAN device whose tunnel parameters differ has to be recreated;
    /// missing addresses can be added in place.
    pub fn vxlan_needs_recreate(link: &Link, spec: &VxlanSpec) -> bool {
        match &link.kind {
            LinkKind::Vxlan(info) => !spec.matches(info),
            _ => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    pub dst: IpNet,
    pub via: IpAddr,
    pub dev: String,
    pub onlink: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Neighbor {
    pub addr: IpAddr,
    pub mac: HardwareAddr,
    pub dev: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FdbEntry {
    pub mac: HardwareAddr,
    pub dst: IpAddr,
    pub dev: String,
}

/// One family's worth of addressing for a container interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Allocated address with the pod subnet's prefix.
    pub addr: IpNet,
    pub gateway: IpAddr,
    pub cluster_cidr: IpNet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerLink {
    pub host_if: String,
    pub host_mac: Option<HardwareAddr>,
    pub container_if: String,
    pub container_mac: Option<HardwareAddr>,
    pub sandbox: PathBuf,
}
