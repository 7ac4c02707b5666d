use ipnet::IpNet;
use k8s_openapi::api::core::v1::Node;
use tracing::{debug, warn};
use weft_config::Family;

use crate::annotation::Annotations;

/// What weft needs to know about one node to route to its pods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub name: String,
    pub ipv4_pod_cidr: Option<IpNet>,
    pub ipv6_pod_cidr: Option<IpNet>,
    pub annotations: Annotations,
}

impl NodeSnapshot {
    /// `None` until the node has a pod CIDR and published its annotations.
    pub fn from_node(node: &Node) -> Option<Self> {
        let name = node.metadata.name.clone()?;

        let pod_cidrs = pod_cidrs(node);
        if pod_cidrs.is_empty() {
            debug!(node = %name, "no pod cidr yet");
            return None;
        }
        let annotations = Annotations::from_node(node)?;

        let of = |family| {
            pod_cidrs
                .iter()
                .find(|cidr| Family::of(cidr) == family)
                .copied()
        };

        Some(Self {
            ipv4_pod_cidr: of(Family::V4),
            ipv6_pod_cidr: of(Family::V6),
            name,
            annotations,
        })
    }

    pub fn pod_cidr(&self, family: Family) -> Option<IpNet> {
        match family {
            Family::V4 => self.ipv4_pod_cidr,
            Family::V6 => self.ipv6_pod_cidr,
        }
    }
}

/// Valid pod CIDRs of `node`: `spec.podCIDRs`, falling back to `spec.podCIDR`.
pub fn pod_cidrs(node: &Node) -> Vec<IpNet> {
    let Some(spec) = node.spec.as_ref() else {
        return vec![];
    };

    let raw = match &spec.pod_cidrs {
        Some(cidrs) if !cidrs.is_empty() => cidrs.clone(),
        _ => spec.pod_cidr.iter().cloned().collect(),
    };

    raw.iter()
        .filter_map(|cidr| match cidr.parse::<IpNet>() {
            Ok(net) => Some(net.trunc()),
            Err(err) => {
                warn!(
                    node = node.metadata.name.as_deref().unwrap_or_default(),
                    %cidr,
                    %err,
                    "skipping invalid pod cidr"
                );
                None
            }
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Add,
    Del,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub node: NodeSnapshot,
}

impl Event {
    pub fn add(node: NodeSnapshot) -> Self {
        Self {
            kind: EventKind::Add,
            node,
        }
    }

    pub fn del(node: NodeSnapshot) -> Self {
        Self {
            kind: EventKind::Del,
            node,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::NodeSpec;

    use super::*;
    use crate::annotation::ANNOTATION_KEY;

    /// A node object as the API server would return it.
    pub(crate) fn node(name: &str, pod_cidrs: &[&str], annotation: Option<&str>) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_owned());
        node.metadata.annotations = annotation.map(|value| {
            BTreeMap::from([(ANNOTATION_KEY.to_owned(), value.to_owned())])
        });
        node.spec = Some(NodeSpec {
            pod_cidr: pod_cidrs.first().map(|cidr| cidr.to_string()),
            pod_cidrs: Some(pod_cidrs.iter().map(|cidr| cidr.to_string()).collect()),
            ..Default::default()
        });
        node
    }

    #[test]
    fn snapshot_of_ready_node() {
        let node = node(
            "worker",
            &["10.244.1.0/24", "fd00:10:244:1::/64"],
            Some(r#"{"publicIPv4":"192.168.1.11"}"#),
        );

        let snapshot = NodeSnapshot::from_node(&node).unwrap();
        assert_eq!(snapshot.name, "worker");
        assert_eq!(snapshot.pod_cidr(Family::V4).unwrap().to_string(), "10.244.1.0/24");
        assert_eq!(
            snapshot.pod_cidr(Family::V6).unwrap().to_string(),
            "fd00:10:244:1::/64"
        );
    }

    #[test]
    fn not_ready_without_cidr_or_annotation() {
        assert!(NodeSnapshot::from_node(&node("a", &[], Some("{}"))).is_none());
        assert!(NodeSnapshot::from_node(&node("a", &["10.244.1.0/24"], None)).is_none());
    }

    #[test]
    fn invalid_cidrs_are_skipped() {
        let node = node("a", &["bogus", "10.244.1.7/24"], Some("{}"));
        assert_eq!(pod_cidrs(&node), vec!["10.244.1.0/24".parse::<IpNet>().unwrap()]);
    }

    #[test]
    fn falls_back_to_single_pod_cidr() {
        let mut node = node("a", &[], Some("{}"));
        node.spec.as_mut().unwrap().pod_cidr = Some("10.244.2.0/24".into());

        let snapshot = NodeSnapshot::from_node(&node).unwrap();
        assert_eq!(snapshot.pod_cidr(Family::V4).unwrap().to_string(), "10.244.2.0/24");
        assert_eq!(snapshot.pod_cidr(Family::V6), None);
    }
}
