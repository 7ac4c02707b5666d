use std::path::PathBuf;

use thiserror::Error;
use weft_config::{ConfigError, Family};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to run `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{cmd}` failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("failed to parse output of `{cmd}`: {source}")]
    Parse {
        cmd: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("link {name} exists but is a {kind} device")]
    Conflicting { name: String, kind: String },

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("no {0} default route")]
    NoDefaultRoute(Family),

    #[error("link {link} has no global {family} address")]
    NoAddress { link: String, family: Family },

    #[error("network namespace {path}: {source}")]
    Netns {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}
