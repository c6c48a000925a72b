//! Device OS version parsing.
//!
//! Devices report `ProductVersion` strings such as `"17"`, `"17.4"` or
//! `"17.4.1"`. They are not valid semver, so missing components are padded
//! with zeros before handing them to [`semver::Version`] for comparison.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A device OS version, ordered numerically component by component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsVersion(semver::Version);

impl OsVersion {
    /// Build a version from its numeric components.
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    /// Parse a dotted version, padding missing minor/patch components.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let parts: Vec<&str> = trimmed.split('.').collect();
        if trimmed.is_empty() || parts.len() > 3 {
            return Err(Error::Version(raw.to_string()));
        }

        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::Version(raw.to_string()));
            }
            *slot = part.parse().map_err(|_| Error::Version(raw.to_string()))?;
        }

        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl FromStr for OsVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.patch == 0 {
            write!(f, "{}.{}", self.0.major, self.0.minor)
        } else {
            write!(f, "{}", self.0)
        }
    }
}
