use std::net::IpAddr;

use k8s_openapi::api::core::v1::Node;
use serde::{Deserialize, Serialize};
use tracing::warn;
use weft_config::{Family, HardwareAddr};

pub const ANNOTATION_KEY: &str = "weft.dev/overlay";

/// Overlay identity a node publishes for its peers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(rename = "ipv4VxlanMac", default, skip_serializing_if = "Option::is_none")]
    pub ipv4_vxlan_mac: Option<HardwareAddr>,

    #[serde(rename = "ipv6VxlanMac", default, skip_serializing_if = "Option::is_none")]
    pub ipv6_vxlan_mac: Option<HardwareAddr>,

    #[serde(rename = "publicIPv4", default, skip_serializing_if = "Option::is_none")]
    pub public_ipv4: Option<IpAddr>,

    #[serde(rename = "publicIPv6", default, skip_serializing_if = "Option::is_none")]
    pub public_ipv6: Option<IpAddr>,
}

impl Annotations {
    /// `None` when the node has not published (valid) annotations yet.
    pub fn from_node(node: &Node) -> Option<Self> {
        let value = node.metadata.annotations.as_ref()?.get(ANNOTATION_KEY)?;

        match serde_json::from_str(value) {
            Ok(annotations) => Some(annotations),
            Err(err) => {
                warn!(
                    node = node.metadata.name.as_deref().unwrap_or_default(),
                    %err,
                    "ignoring undecodable overlay annotation"
                );
                None
            }
        }
    }

    pub fn vxlan_mac(&self, family: Family) -> Option<HardwareAddr> {
        match family {
            Family::V4 => self.ipv4_vxlan_mac,
            Family::V6 => self.ipv6_vxlan_mac,
        }
    }

    pub fn public_ip(&self, family: Family) -> Option<IpAddr> {
        match family {
            Family::V4 => self.public_ipv4,
            Family::V6 => self.public_ipv6,
        }
    }

    pub fn set_vxlan_mac(&mut self, family: Family, mac: HardwareAddr) {
        match family {
            Family::V4 => self.ipv4_vxlan_mac = Some(mac),
            Family::V6 => self.ipv6_vxlan_mac = Some(mac),
        }
    }

    pub fn set_public_ip(&mut self, family: Family, addr: IpAddr) {
        match family {
            Family::V4 => self.public_ipv4 = Some(addr),
            Family::V6 => self.public_ipv6 = Some(addr),
        }
    }

    /// Fills the fields `self` leaves empty from `other`.
    pub fn merge(mut self, other: Annotations) -> Self {
        self.ipv4_vxlan_mac = self.ipv4_vxlan_mac.or(other.ipv4_vxlan_mac);
        self.ipv6_vxlan_mac = self.ipv6_vxlan_mac.or(other.ipv6_vxlan_mac);
        self.public_ipv4 = self.public_ipv4.or(other.public_ipv4);
        self.public_ipv6 = self.public_ipv6.or(other.public_ipv6);
        self
    }
}
