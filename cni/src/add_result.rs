use serde::Serialize;
use weft_config::{CNI_VERSION, SUPPORTED_VERSIONS};
use weft_devices::{ContainerLink, NetworkInfo};

use crate::{
    interface::Interface,
    ip::{Ip, Route},
};

/// Result of a successful ADD.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddResult {
    pub cni_version: String,
    pub interfaces: Vec<Interface>,
    pub ips: Vec<Ip>,
    pub routes: Vec<Route>,
}

impl AddResult {
    /// Result in the shape `cni_version` asks for. Versions before 1.0.0
    /// tag every IP with its family.
    pub fn new(cni_version: &str, link: ContainerLink, networks: &[NetworkInfo]) -> Self {
        let legacy = cni_version != CNI_VERSION;
        let interfaces = vec![
            Interface::host(link.host_if, link.host_mac),
            Interface::container(link.container_if, link.container_mac, link.sandbox),
        ];
        let container = interfaces.len() - 1;

        Self {
            cni_version: cni_version.to_owned(),
            interfaces,
            ips: networks
                .iter()
                .map(|network| Ip::new(network, container, legacy))
                .collect(),
            routes: networks.iter().flat_map(Route::for_network).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    pub cni_version: &'static str,
    pub supported_versions: &'static [&'static str],
}

impl Default for VersionResult {
    fn default() -> Self {
        Self {
            cni_version: CNI_VERSION,
            supported_versions: &SUPPORTED_VERSIONS,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;

    #[test]
    fn add_result_json() {
        let link = ContainerLink {
            host_if: "veth0a1b2c3d".into(),
            host_mac: None,
            container_if: "eth0".into(),
            container_mac: Some("02:00:00:00:00:09".parse().unwrap()),
            sandbox: PathBuf::from("/var/run/netns/abc"),
        };
        let network = NetworkInfo {
            addr: "10.244.1.5/24".parse().unwrap(),
            gateway: "10.244.1.1".parse().unwrap(),
            cluster_cidr: "10.244.0.0/16".parse().unwrap(),
        };

        let json = serde_json::to_value(AddResult::new("1.0.0", link, &[network])).unwrap();

        assert_eq!(
            json,
            json!({
                "cniVersion": "1.0.0",
                "interfaces": [
                    {"name": "veth0a1b2c3d"},
                    {"name": "eth0", "mac": "02:00:00:00:00:09", "sandbox": "/var/run/netns/abc"}
                ],
                "ips": [{"address": "10.244.1.5/24", "gateway": "10.244.1.1", "interface": 1}],
                "routes": [
                    {"dst": "0.0.0.0/0", "gw": "10.244.1.1"},
                    {"dst": "10.244.0.0/16", "gw": "10.244.1.1"}
                ]
            })
        );
    }

    #[test]
    fn legacy_result_tags_ip_version() {
        let link = ContainerLink {
            host_if: "veth0a1b2c3d".into(),
            host_mac: None,
            container_if: "eth0".into(),
            container_mac: None,
            sandbox: PathBuf::from("/var/run/netns/abc"),
        };
        let networks = [
            NetworkInfo {
                addr: "10.244.1.5/24".parse().unwrap(),
                gateway: "10.244.1.1".parse().unwrap(),
                cluster_cidr: "10.244.0.0/16".parse().unwrap(),
            },
            NetworkInfo {
                addr: "fd00:10:244:1::5/64".parse().unwrap(),
                gateway: "fd00:10:244:1::1".parse().unwrap(),
                cluster_cidr: "fd00:10:244::/56".parse().unwrap(),
            },
        ];

        let json = serde_json::to_value(AddResult::new("0.3.1", link, &networks)).unwrap();

        assert_eq!(json["cniVersion"], "0.3.1");
        assert_eq!(
            json["ips"],
            json!([
                {"version": "4", "address": "10.244.1.5/24", "gateway": "10.244.1.1", "interface": 1},
                {"version": "6", "address": "fd00:10:244:1::5/64", "gateway": "fd00:10:244:1::1", "interface": 1}
            ])
        );
    }

    #[test]
    fn version_result_json() {
        let json = serde_json::to_value(VersionResult::default()).unwrap();
        assert_eq!(json["cniVersion"], "1.0.0");
        assert_eq!(json["supportedVersions"], json!(["0.3.0", "0.3.1", "0.4.0", "1.0.0"]));
    }
}
