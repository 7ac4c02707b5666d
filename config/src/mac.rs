use std::{fmt, str::FromStr};

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HardwareAddr([u8; 6]);

impl HardwareAddr {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// A random unicast, locally administered address.
    pub fn generate() -> Self {
        let mut octets = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut octets);
        octets[0] &= 0xfe;
        octets[0] |= 0x02;
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for HardwareAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidHardwareAddr(s.to_owned());

        let parts = s
            .split(':')
            .map(|p| u8::from_str_radix(p, 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| invalid())?;

        let octets: [u8; 6] = parts.try_into().map_err(|_| invalid())?;
        Ok(Self(octets))
    }
}

impl Serialize for HardwareAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HardwareAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
