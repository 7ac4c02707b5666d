//! In-memory [`Devices`] that records every mutation.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Mutex, MutexGuard},
};

use ipnet::IpNet;
use weft_config::{Family, HardwareAddr};

use crate::{
    ContainerLink, DeviceError, Devices, FdbEntry, Link, LinkKind, Neighbor, NetworkInfo, Route,
    VxlanInfo, VxlanSpec,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    EnsureBridge { name: String, gateways: Vec<IpNet> },
    SetupVeth { container_id: String, if_name: String, addrs: Vec<IpNet> },
    DelVeth { container_id: String, if_name: String },
    EnsureVxlan(VxlanSpec),
    RouteAdd(Route),
    RouteDel(Route),
    NeighAdd(Neighbor),
    NeighDel(Neighbor),
    FdbAdd(FdbEntry),
    FdbDel(FdbEntry),
    Masquerade { family: Family, cluster: IpNet, pod: IpNet },
}

#[derive(Debug, Default)]
pub struct RecordingDevices {
    calls: Mutex<Vec<Call>>,
    links: Mutex<HashMap<String, Link>>,
    defaults: Mutex<HashMap<Family, String>>,
    containers: Mutex<HashMap<String, Vec<IpNet>>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl RecordingDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a physical link carrying the default route of `addr`'s family.
    pub fn with_default_link(self, name: &str, addr: IpNet) -> Self {
        let family = Family::of(&addr);
        {
            let mut links = lock(&self.links);
            let index = links.len() as u32 + 2;
            let link = links.entry(name.to_owned()).or_insert_with(|| Link {
                name: name.to_owned(),
                index,
                kind: LinkKind::Other(None),
                mac: Some(HardwareAddr::generate()),
                addrs: vec![],
                up: true,
            });
            link.addrs.push(addr);
        }
        lock(&self.defaults).insert(family, name.to_owned());
        self
    }

    pub fn with_link(self, link: Link) -> Self {
        lock(&self.links).insert(link.name.clone(), link);
        self
    }

    /// Makes every later call of `op` (e.g. `"route_add"`) fail.
    pub fn fail(&self, op: &'static str) {
        lock(&self.failing).insert(op);
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *lock(&self.calls))
    }

    fn record(&self, op: &'static str, call: Call) -> Result<(), DeviceError> {
        if lock(&self.failing).contains(op) {
            return Err(DeviceError::Command {
                cmd: op.to_owned(),
                stderr: "injected failure".to_owned(),
            });
        }
        lock(&self.calls).push(call);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Devices for RecordingDevices {
    fn ensure_bridge(&self, name: &str, gateways: &[IpNet]) -> Result<Link, DeviceError> {
        self.record(
            "ensure_bridge",
            Call::EnsureBridge {
                name: name.to_owned(),
                gateways: gateways.to_vec(),
            },
        )?;

        let mut links = lock(&self.links);
        let index = links.len() as u32 + 2;
        let link = links.entry(name.to_owned()).or_insert_with(|| Link {
            name: name.to_owned(),
            index,
            kind: LinkKind::Bridge,
            mac: Some(HardwareAddr::generate()),
            addrs: vec![],
            up: true,
        });
        if link.kind != LinkKind::Bridge {
            return Err(DeviceError::Conflicting {
                name: name.to_owned(),
                kind: link.kind.to_string(),
            });
        }
        for gateway in gateways {
            if !link.has_addr(gateway) {
                link.addrs.push(*gateway);
            }
        }
        Ok(link.clone())
    }

    fn setup_veth(
        &self,
        netns: &Path,
        container_id: &str,
        _bridge: &str,
        if_name: &str,
        networks: &[NetworkInfo],
    ) -> Result<ContainerLink, DeviceError> {
        let addrs = networks.iter().map(|network| network.addr).collect::<Vec<_>>();
        self.record(
            "setup_veth",
            Call::SetupVeth {
                container_id: container_id.to_owned(),
                if_name: if_name.to_owned(),
                addrs: addrs.clone(),
            },
        )?;
        lock(&self.containers).insert(container_id.to_owned(), addrs);

        Ok(ContainerLink {
            host_if: format!("veth{}", &container_id[..container_id.len().min(8)]),
            host_mac: Some(HardwareAddr::generate()),
            container_if: if_name.to_owned(),
            container_mac: Some(HardwareAddr::generate()),
            sandbox: netns.to_path_buf(),
        })
    }

    fn del_veth(&self, _netns: &Path, container_id: &str, if_name: &str) -> Result<(), DeviceError> {
        self.record(
            "del_veth",
            Call::DelVeth {
                container_id: container_id.to_owned(),
                if_name: if_name.to_owned(),
            },
        )?;
        lock(&self.containers).remove(container_id);
        Ok(())
    }

    fn container_addrs(
        &self,
        _netns: &Path,
        container_id: &str,
        if_name: &str,
    ) -> Result<Vec<IpNet>, DeviceError> {
        lock(&self.containers)
            .get(container_id)
            .cloned()
            .ok_or_else(|| DeviceError::LinkNotFound(if_name.to_owned()))
    }

    fn ensure_vxlan(&self, spec: &VxlanSpec) -> Result<Link, DeviceError> {
        self.record("ensure_vxlan", Call::EnsureVxlan(spec.clone()))?;

        let mut links = lock(&self.links);
        let index = links.len() as u32 + 2;
        let link = links.entry(spec.name.clone()).or_insert_with(|| Link {
            name: spec.name.clone(),
            index,
            kind: LinkKind::Vxlan(VxlanInfo {
                vni: spec.vni,
                local: Some(spec.local),
                port: spec.port,
                learning: spec.learning,
            }),
            mac: Some(spec.mac),
            addrs: vec![spec.addr],
            up: true,
        });
        if !matches!(link.kind, LinkKind::Vxlan(_)) {
            return Err(DeviceError::Conflicting {
                name: spec.name.clone(),
                kind: link.kind.to_string(),
            });
        }
        Ok(link.clone())
    }

    fn link_by_name(&self, name: &str) -> Result<Option<Link>, DeviceError> {
        Ok(lock(&self.links).get(name).cloned())
    }

    fn default_link(&self, family: Family) -> Result<Link, DeviceError> {
        let name = lock(&self.defaults)
            .get(&family)
            .cloned()
            .ok_or(DeviceError::NoDefaultRoute(family))?;
        self.link_by_name(&name)?
            .ok_or(DeviceError::LinkNotFound(name))
    }

    fn host_addr(&self, family: Family) -> Result<IpNet, DeviceError> {
        let link = self.default_link(family)?;
        link.addr_of(family).ok_or(DeviceError::NoAddress {
            link: link.name,
            family,
        })
    }

    fn route_add(&self, route: &Route) -> Result<(), DeviceError> {
        self.record("route_add", Call::RouteAdd(route.clone()))
    }

    fn route_del(&self, route: &Route) -> Result<(), DeviceError> {
        self.record("route_del", Call::RouteDel(route.clone()))
    }

    fn neigh_add(&self, neigh: &Neighbor) -> Result<(), DeviceError> {
        self.record("neigh_add", Call::NeighAdd(neigh.clone()))
    }

    fn neigh_del(&self, neigh: &Neighbor) -> Result<(), DeviceError> {
        self.record("neigh_del", Call::NeighDel(neigh.clone()))
    }

    fn fdb_add(&self, entry: &FdbEntry) -> Result<(), DeviceError> {
        self.record("fdb_add", Call::FdbAdd(entry.clone()))
    }

    fn fdb_del(&self, entry: &FdbEntry) -> Result<(), DeviceError> {
        self.record("fdb_del", Call::FdbDel(entry.clone()))
    }

    fn ensure_masquerade(&self, family: Family, cluster: IpNet, pod: IpNet) -> Result<(), DeviceError> {
        self.record(
            "ensure_masquerade",
            Call::Masquerade {
                family,
                cluster,
                pod,
            },
        )
    }
}
