// Centralized version information

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// Version a freshly flashed device reports from /ota/about
pub const SENTINEL_VERSION: &str = "0.0.1";

// Only devices of this major generation accept OTA updates
pub const SUPPORTED_MAJOR: u32 = 0;

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Body of `GET /ota/about`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceVersionInfo {
    pub version: String,
}

/// Dotted integer triple reported by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid firmware version '{0}'")]
pub struct ParseVersionError(pub String);

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Whether a device running this version can be updated over the air.
    pub fn is_ota_compatible(&self) -> bool {
        self.major == SUPPORTED_MAJOR
    }
}

impl FromStr for FirmwareVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError(s.to_string());
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u32, ParseVersionError> {
            parts.next().ok_or_else(err)?.parse::<u32>().map_err(|_| err())
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(version)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!("0.1.4".parse::<FirmwareVersion>(), Ok(FirmwareVersion::new(0, 1, 4)));
        assert_eq!(" 1.0.0 ".parse::<FirmwareVersion>(), Ok(FirmwareVersion::new(1, 0, 0)));
        assert!("0.1".parse::<FirmwareVersion>().is_err());
        assert!("0.1.2.3".parse::<FirmwareVersion>().is_err());
        assert!("0.x.2".parse::<FirmwareVersion>().is_err());
        assert!("".parse::<FirmwareVersion>().is_err());
    }

    #[test]
    fn test_compatibility_gate() {
        assert!(FirmwareVersion::new(0, 9, 9).is_ota_compatible());
        assert!(!FirmwareVersion::new(1, 0, 0).is_ota_compatible());
    }

    #[test]
    fn test_sentinel_round_trips() {
        let sentinel: FirmwareVersion = SENTINEL_VERSION.parse().unwrap();
        assert_eq!(sentinel.to_string(), SENTINEL_VERSION);
    }
}
