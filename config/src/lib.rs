use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

mod error;
mod family;
mod mac;
mod network;

pub use error::ConfigError;
pub use family::Family;
pub use mac::HardwareAddr;
pub use network::{first_host, nth_addr, parse_cidrs, NetworkConfig, NetworkConfigs};

pub const CNI_VERSION: &str = "1.0.0";
pub const SUPPORTED_VERSIONS: [&str; 4] = ["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

pub const NETWORK_NAME: &str = "weft";
pub const PLUGIN_TYPE: &str = "weft";

/// Network configuration handed to the plugin on stdin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    pub cni_version: String,

    pub name: String,

    #[serde(rename = "type")]
    pub cni_type: String,

    /// Cluster CIDR(s), informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// Overrides the directory holding the allocation store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl NetConf {
    pub fn new(network: &str, data_dir: Option<&Path>) -> Self {
        Self {
            cni_version: CNI_VERSION.to_owned(),
            name: NETWORK_NAME.to_owned(),
            cni_type: PLUGIN_TYPE.to_owned(),
            network: Some(network.to_owned()),
            data_dir: data_dir.map(Path::to_path_buf),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Serialize)]
struct PluginEntry<'a> {
    #[serde(rename = "type")]
    cni_type: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<&'a str>,

    #[serde(rename = "dataDir", skip_serializing_if = "Option::is_none")]
    data_dir: Option<&'a Path>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfList<'a> {
    cni_version: &'a str,
    name: &'a str,
    plugins: Vec<PluginEntry<'a>>,
}

impl NetConf {
    /// Writes the `.conflist` the container runtime loads this plugin from.
    pub fn write_conflist(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let list = ConfList {
            cni_version: &self.cni_version,
            name: &self.name,
            plugins: vec![PluginEntry {
                cni_type: &self.cni_type,
                network: self.network.as_deref(),
                data_dir: self.data_dir.as_deref(),
            }],
        };
        let json = serde_json::to_string(&list)?;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }
}
