use ipnet::IpNet;
use tracing::{debug, info, instrument};
use weft_config::Family;

use super::{is_local, HostGw, Local, PerFamily, RoutingStrategy, Vxlan};
use crate::{annotation::Annotations, event::Event, event::NodeSnapshot, Result};

/// Host-gw for peers inside the local subnet, VXLAN for everyone else.
pub struct CrossSubnet {
    node_name: String,
    vxlan: Vxlan,
    host_gw: HostGw,
    local_subnets: PerFamily<IpNet>,
}

impl CrossSubnet {
    pub fn register(local: &Local<'_>) -> Result<(Self, Annotations)> {
        let mut local_subnets = PerFamily::new();
        for (family, _) in local.configs.iter() {
            let subnet = match local
                .local_subnets
                .iter()
                .find(|subnet| Family::of(subnet) == family)
            {
                Some(subnet) => subnet.trunc(),
                None => local.devices.host_addr(family)?.trunc(),
            };
            info!(%family, %subnet, "local subnet");
            local_subnets.insert(family, subnet);
        }

        let (vxlan, vxlan_annotations) = Vxlan::register(local)?;
        let (host_gw, host_gw_annotations) = HostGw::register(local)?;

        let strategy = Self {
            node_name: local.node_name.to_owned(),
            vxlan,
            host_gw,
            local_subnets,
        };
        Ok((strategy, vxlan_annotations.merge(host_gw_annotations)))
    }

    fn is_neighbor(&self, node: &NodeSnapshot, family: Family) -> bool {
        let neighbor = match (
            self.local_subnets.get(&family),
            node.annotations.public_ip(family),
        ) {
            (Some(subnet), Some(public)) => subnet.contains(&public),
            _ => false,
        };
        debug!(node = %node.name, %family, neighbor, "picked route kind");
        neighbor
    }

    fn families(&self) -> Vec<Family> {
        self.local_subnets.keys().copied().collect()
    }
}

impl RoutingStrategy for CrossSubnet {
    #[instrument(skip_all, fields(node = %event.node.name))]
    fn add_handle(&mut self, event: &Event) -> Result<()> {
        if is_local(event, &self.node_name) {
            return Ok(());
        }
        let results = self
            .families()
            .into_iter()
            .map(|family| {
                if self.is_neighbor(&event.node, family) {
                    self.host_gw.add_family(&event.node, family)
                } else {
                    self.vxlan.add_family(&event.node, family)
                }
            })
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
            .into_iter()
            .map(|family| {
                if self.is_neighbor(&event.node, family) {
                    self.host_gw.del_family(&event.node, family)
                } else {
                    self.vxlan.del_family(&event.node, family)
                }
            })
            .collect::<Vec<_>>();
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use weft_devices::{
        testing::{Call, RecordingDevices},
        FdbEntry, Neighbor, Route,
    };

    use super::*;
    use crate::strategy::vxlan::tests::{configs, peer};

    fn setup(local_subnets: &[IpNet]) -> (Arc<RecordingDevices>, CrossSubnet, Annotations) {
        let devices = Arc::new(
            RecordingDevices::new().with_default_link("eth0", "192.168.1.10/24".parse().unwrap()),
        );
        let configs = configs("10.244.0.0/16", "10.244.1.0/24");
        let (strategy, annotations) = CrossSubnet::register(&Local {
            node_name: "local",
            devices: devices.clone(),
            configs: &configs,
            local_subnets,
        })
        .unwrap();
        devices.take_calls();
        (devices, strategy, annotations)
    }

    #[test]
    fn publishes_vxlan_identity() {
        let (_, _, annotations) = setup(&[]);
        assert!(annotations.ipv4_vxlan_mac.is_some());
        assert_eq!(annotations.public_ipv4, Some("192.168.1.10".parse().unwrap()));
    }

    #[test]
    fn dispatches_by_subnet() {
        let (devices, mut strategy, _) = setup(&[]);

        let near = peer(
            "near",
            "10.244.2.0/24",
            r#"{"ipv4VxlanMac":"02:00:00:00:00:02","publicIPv4":"192.168.1.11"}"#,
        );
        let far = peer(
            "far",
            "10.244.3.0/24",
            r#"{"ipv4VxlanMac":"02:00:00:00:00:03","publicIPv4":"10.0.0.5"}"#,
        );
        let me = peer(
            "local",
            "10.244.1.0/24",
            r#"{"ipv4VxlanMac":"02:00:00:00:00:01","publicIPv4":"192.168.1.10"}"#,
        );

        strategy.handle(&Event::add(near)).unwrap();
        strategy.handle(&Event::add(far)).unwrap();
        strategy.handle(&Event::add(me)).unwrap();

        assert_eq!(
            devices.calls(),
            vec![
                Call::RouteAdd(Route {
                    dst: "10.244.2.0/24".parse().unwrap(),
                    via: "192.168.1.11".parse().unwrap(),
                    dev: "eth0".into(),
                    onlink: true,
                }),
                Call::RouteAdd(Route {
                    dst: "10.244.3.0/24".parse().unwrap(),
                    via: "10.244.3.1".parse().unwrap(),
                    dev: "weft.1".into(),
                    onlink: true,
                }),
                Call::NeighAdd(Neighbor {
                    addr: "10.244.3.1".parse().unwrap(),
                    mac: "02:00:00:00:00:03".parse().unwrap(),
                    dev: "weft.1".into(),
                }),
                Call::FdbAdd(FdbEntry {
                    mac: "02:00:00:00:00:03".parse().unwrap(),
                    dst: "10.0.0.5".parse().unwrap(),
                    dev: "weft.1".into(),
                }),
            ]
        );
    }

    #[test]
    fn local_subnet_override() {
        let (devices, mut strategy, _) = setup(&["10.0.0.0/8".parse().unwrap()]);

        let far = peer(
            "far",
            "10.244.3.0/24",
            r#"{"ipv4VxlanMac":"02:00:00:00:00:03","publicIPv4":"10.0.0.5"}"#,
        );
        strategy.handle(&Event::del(far)).unwrap();

        assert_eq!(
            devices.calls(),
            vec![Call::RouteDel(Route {
                dst: "10.244.3.0/24".parse().unwrap(),
                via: "10.0.0.5".parse().unwrap(),
                dev: "eth0".into(),
                onlink: true,
            })]
        );
    }
}
