//! Kernel networking objects as seen by the plugin and the daemon.

use std::path::Path;

use ipnet::IpNet;
use weft_config::Family;

mod error;
mod iproute2;
mod link;
mod masquerade;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::DeviceError;
pub use iproute2::IpRoute2;
pub use link::{
    ContainerLink, FdbEntry, Link, LinkKind, LinkState, Neighbor, NetworkInfo, Route, VxlanInfo,
    VxlanSpec,
};
pub use masquerade::{masquerade_rules, supports_random_fully, MASQUERADE_CHAIN};

pub const BRIDGE_NAME: &str = "weft0";

/// Everything weft needs from the kernel.
///
/// Adds replace what is already there and deletes of missing objects
/// succeed, so every call may be repeated.
pub trait Devices: Send + Sync {
    /// Creates or fixes up the pod bridge so it carries every gateway address.
    fn ensure_bridge(&self, name: &str, gateways: &[IpNet]) -> Result<Link, DeviceError>;

    /// Wires a veth pair between `bridge` and the container namespace and
    /// configures addresses plus the default and cluster routes inside it.
    fn setup_veth(
        &self,
        netns: &Path,
        container_id: &str,
        bridge: &str,
        if_name: &str,
        networks: &[NetworkInfo],
    ) -> Result<ContainerLink, DeviceError>;

    fn del_veth(&self, netns: &Path, container_id: &str, if_name: &str) -> Result<(), DeviceError>;

    fn container_addrs(
        &self,
        netns: &Path,
        container_id: &str,
        if_name: &str,
    ) -> Result<Vec<IpNet>, DeviceError>;

    /// Returns the device, created from `spec` when missing. An existing
    /// device keeps its hardware address.
    fn ensure_vxlan(&self, spec: &VxlanSpec) -> Result<Link, DeviceError>;

    fn link_by_name(&self, name: &str) -> Result<Option<Link>, DeviceError>;

    /// Link of the default route of `family`.
    fn default_link(&self, family: Family) -> Result<Link, DeviceError>;

    /// First global address of the default link.
    fn host_addr(&self, family: Family) -> Result<IpNet, DeviceError>;

    fn route_add(&self, route: &Route) -> Result<(), DeviceError>;
    fn route_del(&self, route: &Route) -> Result<(), DeviceError>;

    fn neigh_add(&self, neigh: &Neighbor) -> Result<(), DeviceError>;
    fn neigh_del(&self, neigh: &Neighbor) -> Result<(), DeviceError>;

    fn fdb_add(&self, entry: &FdbEntry) -> Result<(), DeviceError>;
    fn fdb_del(&self, entry: &FdbEntry) -> Result<(), DeviceError>;

    fn ensure_masquerade(&self, family: Family, cluster: IpNet, pod: IpNet) -> Result<(), DeviceError>;
}
