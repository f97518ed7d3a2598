//! Firmware version metadata and comparison (spec §4.10, §6.2).

use anyhow::{Context, Result};

/// Current firmware version - automatically pulled from Cargo.toml
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build timestamp - automatically set at compile time
pub const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");

/// Semantic version for comparing the running firmware against an OTA
/// manifest's advertised version (spec §4.10 "only update to a strictly
/// newer version").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Parse a semantic version string, tolerating a leading `v`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim_start_matches('v');
        let parts: Vec<&str> = s.split('.').collect();

        if parts.len() != 3 {
            anyhow::bail!("invalid version format: {}", s);
        }

        Ok(Version {
            major: parts[0].parse().context("invalid major version")?,
            minor: parts[1].parse().context("invalid minor version")?,
            patch: parts[2].parse().context("invalid patch version")?,
        })
    }

    pub fn current() -> Result<Self> {
        Self::parse(FIRMWARE_VERSION)
    }

    pub fn is_newer_than(&self, other: &Version) -> bool {
        self > other
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Whether a manifest's version should trigger an update over the
/// currently running firmware (spec §4.10).
pub fn is_update_available(manifest_version: &str) -> Result<bool> {
    let current = Version::current()?;
    let candidate = Version::parse(manifest_version)?;
    Ok(candidate.is_newer_than(&current))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_leading_v() {
        let v1 = Version::parse("0.1.0").unwrap();
        assert_eq!(v1.major, 0);
        assert_eq!(v1.minor, 1);
        assert_eq!(v1.patch, 0);

        let v2 = Version::parse("v1.2.3").unwrap();
        assert_eq!(v2, Version { major: 1, minor: 2, patch: 3 });
    }

    #[test]
    fn orders_by_semver_precedence() {
        let v1 = Version::parse("0.1.0").unwrap();
        let v2 = Version::parse("0.2.0").unwrap();
        let v3 = Version::parse("1.0.0").unwrap();

        assert!(v2.is_newer_than(&v1));
        assert!(v3.is_newer_than(&v2));
        assert!(!v1.is_newer_than(&v2));
    }

    #[test]
    fn rejects_malformed_version_strings() {
        assert!(Version::parse("1.2").is_err());
        assert!(Version::parse("a.b.c").is_err());
    }
}
