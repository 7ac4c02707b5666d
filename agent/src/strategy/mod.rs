use std::{collections::BTreeMap, sync::Arc};

use clap::ValueEnum;
use ipnet::IpNet;
use tracing::debug;
use weft_config::{Family, NetworkConfigs};
use weft_devices::{DeviceError, Devices};

use crate::{
    annotation::Annotations,
    event::{Event, EventKind},
    Result,
};

pub use self::{cross_subnet::CrossSubnet, host_gw::HostGw, vxlan::Vxlan};

mod cross_subnet;
mod host_gw;
mod vxlan;

/// How traffic reaches pods on other nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    #[default]
    Vxlan,
    HostGw,
    CrossSubnet,
}

/// Programs forwarding state for peer nodes. Both handlers may be called
/// repeatedly for the same node.
pub trait RoutingStrategy: Send {
    fn add_handle(&mut self, event: &Event) -> Result<()>;

    fn del_handle(&mut self, event: &Event) -> Result<()>;

    fn handle(&mut self, event: &Event) -> Result<()> {
        match event.kind {
            EventKind::Add => self.add_handle(event),
            EventKind::Del => self.del_handle(event),
        }
    }
}

/// Everything a strategy needs to set up on this node.
pub struct Local<'a> {
    pub node_name: &'a str,
    pub devices: Arc<dyn Devices>,
    pub configs: &'a NetworkConfigs,
    /// Overrides the subnet host-gw peers are expected in.
    pub local_subnets: &'a [IpNet],
}

/// Performs the one-time setup for `mode` and returns the strategy with the
/// annotations this node has to publish.
pub fn register(mode: Mode, local: &Local<'_>) -> Result<(Box<dyn RoutingStrategy>, Annotations)> {
    Ok(match mode {
        Mode::Vxlan => {
            let (strategy, annotations) = Vxlan::register(local)?;
            (Box::new(strategy), annotations)
        }
        Mode::HostGw => {
            let (strategy, annotations) = HostGw::register(local)?;
            (Box::new(strategy), annotations)
        }
        Mode::CrossSubnet => {
            let (strategy, annotations) = CrossSubnet::register(local)?;
            (Box::new(strategy), annotations)
        }
    })
}

fn is_local(event: &Event, node_name: &str) -> bool {
    let local = event.node.name == node_name;
    if local {
        debug!(node = node_name, "skipping local node");
    }
    local
}

/// Runs every step even when an earlier one fails and reports the first
/// failure.
fn all_steps(steps: impl IntoIterator<Item = std::result::Result<(), DeviceError>>) -> Result<()> {
    let mut first = None;
    for step in steps {
        if let Err(err) = step {
            tracing::warn!(%err, "forwarding state update failed");
            first.get_or_insert(err);
        }
    }
    match first {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

type PerFamily<T> = BTreeMap<Family, T>;
