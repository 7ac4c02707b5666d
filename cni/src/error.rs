use serde::Serialize;
use thiserror::Error;
use weft_config::ConfigError;
use weft_devices::DeviceError;
use weft_ipam::{IpamError, StorageError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("incompatible CNI version {0}")]
    IncompatibleVersion(String),

    #[error("unknown container {0}")]
    UnknownContainer(String),

    #[error("invalid environment: {0}")]
    InvalidEnv(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode network configuration: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("invalid network configuration: {0}")]
    InvalidNetConf(String),

    #[error(transparent)]
    Ipam(#[from] IpamError),

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("interface check failed: {0}")]
    Check(String),
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Ipam(err) => Error::Ipam(err),
            err => Error::Storage(err),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Json(err) => Error::Decode(err),
            ConfigError::Io(err) => Error::Io(err),
            err => Error::InvalidNetConf(err.to_string()),
        }
    }
}

impl Error {
    /// Error code of the CNI protocol.
    pub fn code(&self) -> u32 {
        match self {
            Error::IncompatibleVersion(_) => 1,
            Error::UnknownContainer(_) => 3,
            Error::InvalidEnv(_) => 4,
            Error::Io(_) => 5,
            Error::Decode(_) => 6,
            Error::InvalidNetConf(_) => 7,
            Error::Ipam(IpamError::Exhausted { .. }) => 11,
            Error::Ipam(_) => 7,
            Error::Storage(err) => match err {
                StorageError::NotBootstrapped(_) => 11,
                StorageError::Lock { .. } | StorageError::Io { .. } => 5,
                StorageError::Config(_) | StorageError::NetworkChanged(_) => 7,
                _ => 100,
            },
            Error::Device(_) => 100,
            Error::Check(_) => 101,
        }
    }

    fn summary(&self) -> &'static str {
        match self.code() {
            1 => "incompatible CNI version",
            3 => "unknown container",
            4 => "invalid environment variables",
            5 => "I/O failure",
            6 => "failed to decode content",
            7 => "invalid network config",
            11 => "try again later",
            _ => "plugin failure",
        }
    }

    pub fn to_result(&self, cni_version: &str) -> ErrorResult {
        ErrorResult {
            cni_version: cni_version.to_owned(),
            code: self.code(),
            msg: self.summary().to_owned(),
            details: self.to_string(),
        }
    }
}

/// Error object printed on stdout when a command fails.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResult {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    pub details: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_retryable() {
        let err = Error::from(StorageError::Ipam(IpamError::Exhausted {
            subnet: "10.244.1.0/30".parse().unwrap(),
        }));
        assert_eq!(err.code(), 11);

        let json = serde_json::to_value(err.to_result("1.0.0")).unwrap();
        assert_eq!(json["code"], 11);
        assert_eq!(json["cniVersion"], "1.0.0");
        assert_eq!(json["msg"], "try again later");
        assert!(json["details"].as_str().unwrap().contains("10.244.1.0/30"));
    }

    #[test]
    fn config_errors() {
        let decode = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(Error::from(ConfigError::Json(decode)).code(), 6);
        assert_eq!(Error::from(ConfigError::NoPodCidr).code(), 7);
        assert_eq!(Error::InvalidEnv("CNI_NETNS".into()).code(), 4);
    }
}
