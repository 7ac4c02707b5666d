use std::path::PathBuf;

use serde::Serialize;
use weft_config::HardwareAddr;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Interface {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<HardwareAddr>,
    /// Set for interfaces living inside the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<PathBuf>,
}

impl Interface {
    pub fn host(name: String, mac: Option<HardwareAddr>) -> Self {
        Self {
            name,
            mac,
            sandbox: None,
        }
    }

    pub fn container(name: String, mac: Option<HardwareAddr>, sandbox: PathBuf) -> Self {
        Self {
            name,
            mac,
            sandbox: Some(sandbox),
        }
    }
}
