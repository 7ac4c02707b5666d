use std::sync::Arc;

use tracing::{debug, info, instrument};
use weft_config::Family;
use weft_devices::{Devices, Route};

use super::{is_local, Local, PerFamily, RoutingStrategy};
use crate::{annotation::Annotations, event::Event, event::NodeSnapshot, Result};

/// Plain routing: peers share the L2 segment, so each pod CIDR is routed
/// straight to the peer's public address.
pub struct HostGw {
    node_name: String,
    devices: Arc<dyn Devices>,
    links: PerFamily<String>,
}

impl HostGw {
    pub fn register(local: &Local<'_>) -> Result<(Self, Annotations)> {
        let mut annotations = Annotations::default();
        let mut links = PerFamily::new();

        for (family, _) in local.configs.iter() {
            let link = local.devices.default_link(family)?;
            let host = local.devices.host_addr(family)?;
            info!(%family, link = %link.name, addr = %host.addr(), "routing via default link");

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

    fn route(&self, node: &NodeSnapshot, family: Family) -> Option<Route> {
        let dev = self.links.get(&family)?;

        let (Some(pod_cidr), Some(public)) =
            (node.pod_cidr(family), node.annotations.public_ip(family))
        else {
            debug!(node = %node.name, %family, "peer is missing routing details");
            return None;
        };

        Some(Route {
            dst: pod_cidr,
            via: public,
            dev: dev.clone(),
            onlink: true,
        })
    }

    pub(super) fn add_family(&self, node: &NodeSnapshot, family: Family) -> Result<()> {
        match self.route(node, family) {
            Some(route) => Ok(self.devices.route_add(&route)?),
            None => Ok(()),
        }
    }

    pub(super) fn del_family(&self, node: &NodeSnapshot, family: Family) -> Result<()> {
        match self.route(node, family) {
            Some(route) => Ok(self.devices.route_del(&route)?),
            None => Ok(()),
        }
    }
}

impl RoutingStrategy for HostGw {
    #[instrument(skip_all, fields(node = %event.node.name))]
    fn add_handle(&mut self, event: &Event) -> Result<()> {
        if is_local(event, &self.node_name) {
            return Ok(());
        }
        let results = self
            .links
            .keys()
            .map(|family| self.add_family(&event.node, *family))
            .collect::<Vec<_>>();
        results.into_iter().collect()
    }

    #[instrument(skip_all, fields(node = %event.node.name))]
    fn del_handle(&mut self, event: &Event) -> Result<()> {
        if is_local(event, &self.node_name) {
            return Ok(());
        }
        let results = self
            .links
            .keys()
            .map(|family| self.del_family(&event.node, *family))
            .collect::<Vec<_>>();
        results.into_iter().collect()
    }
}
