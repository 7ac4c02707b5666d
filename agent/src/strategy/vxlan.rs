use std::sync::Arc;

use ipnet::IpNet;
use tracing::{debug, info, instrument};
use weft_config::{first_host, Family, HardwareAddr};
use weft_devices::{Devices, FdbEntry, Neighbor, Route, VxlanSpec};

use super::{all_steps, is_local, Local, PerFamily, RoutingStrategy};
use crate::{annotation::Annotations, event::Event, event::NodeSnapshot, Result};

pub const VXLAN_VNI: u32 = 1;
pub const VXLAN_PORT: u16 = 8472;

pub fn device_name(family: Family) -> &'static str {
    match family {
        Family::V4 => "weft.1",
        Family::V6 => "weft.1v6",
    }
}

/// Overlay routing: every peer pod CIDR is reached through the local VXLAN
/// device, with static neighbor and FDB entries instead of learning.
pub struct Vxlan {
    node_name: String,
    devices: Arc<dyn Devices>,
    links: PerFamily<String>,
}

/// Forwarding state for one peer in one family.
struct Peer {
    route: Route,
    neigh: Neighbor,
    fdb: FdbEntry,
}

impl Vxlan {
    pub fn register(local: &Local<'_>) -> Result<(Self, Annotations)> {
        let mut annotations = Annotations::default();
        let mut links = PerFamily::new();

        for (family, config) in local.configs.iter() {
            let parent = local.devices.default_link(family)?;
            let host = local.devices.host_addr(family)?;

            let spec = VxlanSpec {
                name: device_name(family).to_owned(),
                vni: VXLAN_VNI,
                port: VXLAN_PORT,
                learning: false,
                local: host.addr(),
                parent: parent.name,
                mac: HardwareAddr::generate(),
                addr: IpNet::new(config.pod_cidr.network(), family.bits())
                    .unwrap_or(config.pod_cidr),
            };
            let link = local.devices.ensure_vxlan(&spec)?;
            info!(%family, name = %link.name, "vxlan device ready");

            annotations.set_vxlan_mac(family, link.mac.unwrap_or(spec.mac));
            annotations.set_public_ip(family, host.addr());
            links.insert(family, link.name);
        }

        let strategy = Self {
            node_name: local.node_name.to_owned(),
            devices: local.devices.clone(),
            links,
        };
        Ok((strategy, annotations))
    }

    pub(super) fn families(&self) -> impl Iterator<Item = Family> + '_ {
        self.links.keys().copied()
    }

    fn peer(&self, node: &NodeSnapshot, family: Family) -> Option<Peer> {
        let dev = self.links.get(&family)?;

        let (Some(pod_cidr), Some(mac), Some(public)) = (
            node.pod_cidr(family),
            node.annotations.vxlan_mac(family),
            node.annotations.public_ip(family),
        ) else {
            debug!(node = %node.name, %family, "peer is missing vxlan details");
            return None;
        };
        let gateway = first_host(&pod_cidr);

        Some(Peer {
            route: Route {
                dst: pod_cidr,
                via: gateway,
                dev: dev.clone(),
                onlink: true,
            },
            neigh: Neighbor {
                addr: gateway,
                mac,
                dev: dev.clone(),
            },
            fdb: FdbEntry {
                mac,
                dst: public,
                dev: dev.clone(),
            },
        })
    }

    pub(super) fn add_family(&self, node: &NodeSnapshot, family: Family) -> Result<()> {
        let Some(peer) = self.peer(node, family) else {
            return Ok(());
        };
        all_steps([
            self.devices.route_add(&peer.route),
            self.devices.neigh_add(&peer.neigh),
            self.devices.fdb_add(&peer.fdb),
        ])
    }

    pub(super) fn del_family(&self, node: &NodeSnapshot, family: Family) -> Result<()> {
        let Some(peer) = self.peer(node, family) else {
            return Ok(());
        };
        all_steps([
            self.devices.route_del(&peer.route),
            self.devices.neigh_del(&peer.neigh),
            self.devices.fdb_del(&peer.fdb),
        ])
    }
}

impl RoutingStrategy for Vxlan {
    #[instrument(skip_all, fields(node = %event.node.name))]
    fn add_handle(&mut self, event: &Event) -> Result<()> {
        if is_local(event, &self.node_name) {
            return Ok(());
        }
        let results = self
            .families()
            .map(|family| self.add_family(&event.node, family))
            .collect::<Vec<_>>();
        results.into_iter().collect()
    }

    #[instrument(skip_all, fields(node = %event.node.name))]
    fn del_handle(&mut self, event: &Event) -> Result<()> {
        if is_local(event, &self.node_name) {
            return Ok(());
        }
        let results = self
            .families()
            .map(|family| self.del_family(&event.node, family))
            .collect::<Vec<_>>();
        results.into_iter().collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use weft_config::parse_cidrs;
    use weft_devices::testing::{Call, RecordingDevices};

    use super::*;
    use crate::event::EventKind;

    pub(crate) fn configs(cluster: &str, pods: &str) -> weft_config::NetworkConfigs {
        weft_config::NetworkConfigs::from_cidrs(
            &parse_cidrs(cluster).unwrap(),
            &parse_cidrs(pods).unwrap(),
        )
        .unwrap()
    }

    pub(crate) fn peer(name: &str, pod_cidr: &str, annotations: &str) -> NodeSnapshot {
        NodeSnapshot {
            name: name.to_owned(),
            ipv4_pod_cidr: Some(pod_cidr.parse().unwrap()),
            ipv6_pod_cidr: None,
            annotations: serde_json::from_str(annotations).unwrap(),
        }
    }

    fn setup() -> (Arc<RecordingDevices>, Vxlan, Annotations) {
        let devices =
            Arc::new(RecordingDevices::new().with_default_link("eth0", "192.168.1.10/24".parse().unwrap()));
        let configs = configs("10.244.0.0/16", "10.244.1.0/24");
        let (vxlan, annotations) = Vxlan::register(&Local {
            node_name: "local",
            devices: devices.clone(),
            configs: &configs,
            local_subnets: &[],
        })
        .unwrap();
        (devices, vxlan, annotations)
    }

    #[test]
    fn register_creates_device_and_annotations() {
        let (devices, _vxlan, annotations) = setup();

        let calls = devices.take_calls();
        let Call::EnsureVxlan(spec) = &calls[0] else {
            panic!("unexpected calls {calls:?}");
        };
        assert_eq!(spec.name, "weft.1");
        assert_eq!(spec.vni, 1);
        assert_eq!(spec.port, 8472);
        assert!(!spec.learning);
        assert_eq!(spec.parent, "eth0");
        assert_eq!(spec.addr.to_string(), "10.244.1.0/32");

        assert_eq!(annotations.public_ipv4, Some("192.168.1.10".parse().unwrap()));
        assert_eq!(annotations.ipv4_vxlan_mac, Some(spec.mac));
        assert_eq!(annotations.ipv6_vxlan_mac, None);
    }

    #[test]
    fn existing_device_keeps_its_mac() {
        let (devices, _, first) = setup();
        let configs = configs("10.244.0.0/16", "10.244.1.0/24");

        let (_, second) = Vxlan::register(&Local {
            node_name: "local",
            devices: devices.clone(),
            configs: &configs,
            local_subnets: &[],
        })
        .unwrap();

        assert_eq!(first.ipv4_vxlan_mac, second.ipv4_vxlan_mac);
    }

    #[test]
    fn add_and_del_program_route_neigh_fdb() {
        let (devices, mut vxlan, _) = setup();
        devices.take_calls();

        let node = peer(
            "peer",
            "10.244.2.0/24",
            r#"{"ipv4VxlanMac":"02:00:00:00:00:02","publicIPv4":"192.168.1.11"}"#,
        );
        let route = Route {
            dst: "10.244.2.0/24".parse().unwrap(),
            via: "10.244.2.1".parse().unwrap(),
            dev: "weft.1".into(),
            onlink: true,
        };
        let neigh = Neighbor {
            addr: "10.244.2.1".parse().unwrap(),
            mac: "02:00:00:00:00:02".parse().unwrap(),
            dev: "weft.1".into(),
        };
        let fdb = FdbEntry {
            mac: "02:00:00:00:00:02".parse().unwrap(),
            dst: "192.168.1.11".parse().unwrap(),
            dev: "weft.1".into(),
        };

        vxlan.handle(&Event::add(node.clone())).unwrap();
        assert_eq!(
            devices.take_calls(),
            vec![
                Call::RouteAdd(route.clone()),
                Call::NeighAdd(neigh.clone()),
                Call::FdbAdd(fdb.clone()),
            ]
        );

        vxlan.handle(&Event::del(node)).unwrap();
        assert_eq!(
            devices.take_calls(),
            vec![Call::RouteDel(route), Call::NeighDel(neigh), Call::FdbDel(fdb)]
        );
    }

    #[test]
    fn local_node_is_ignored() {
        let (devices, mut vxlan, _) = setup();
        devices.take_calls();

        let node = peer(
            "local",
            "10.244.1.0/24",
            r#"{"ipv4VxlanMac":"02:00:00:00:00:02","publicIPv4":"192.168.1.10"}"#,
        );
        vxlan.handle(&Event::add(node.clone())).unwrap();
        vxlan.handle(&Event::del(node)).unwrap();

        assert!(devices.calls().is_empty());
    }

    #[test]
    fn incomplete_peer_is_skipped() {
        let (devices, mut vxlan, _) = setup();
        devices.take_calls();

        let node = peer("peer", "10.244.2.0/24", r#"{"publicIPv4":"192.168.1.11"}"#);
        vxlan.handle(&Event { kind: EventKind::Add, node }).unwrap();

        assert!(devices.calls().is_empty());
    }

    #[test]
    fn delete_continues_after_failure() {
        let (devices, mut vxlan, _) = setup();
        devices.take_calls();
        devices.fail("route_del");

        let node = peer(
            "peer",
            "10.244.2.0/24",
            r#"{"ipv4VxlanMac":"02:00:00:00:00:02","publicIPv4":"192.168.1.11"}"#,
        );
        assert!(vxlan.handle(&Event::del(node)).is_err());

        let calls = devices.calls();
        assert!(matches!(calls[..], [Call::NeighDel(_), Call::FdbDel(_)]));
    }
}
