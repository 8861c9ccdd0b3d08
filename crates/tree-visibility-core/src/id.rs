//! Opaque 64-bit ids.
//!
//! Every node of the visibility engine is identified by [`Id64`] values
//! rather than object references, so tree nodes can be recreated lazily
//! without invalidating any cache.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::VisibilityError;

/// A stable, opaque 64-bit id.
///
/// The canonical string form is lowercase hex with a `0x` prefix
/// (`"0x20000000001"`). Parsing also accepts plain decimal.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id64(u64);

/// An ordered set of ids.
pub type IdSet = BTreeSet<Id64>;

impl Id64 {
    /// The invalid id (`0x0`).
    pub const INVALID: Id64 = Id64(0);

    /// Create an id from its raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw 64-bit value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns `true` unless this is [`Id64::INVALID`].
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for Id64 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for Id64 {
    type Err = VisibilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => trimmed.parse::<u64>(),
        };
        parsed.map(Id64).map_err(|_| VisibilityError::invalid_id(s))
    }
}

impl fmt::Display for Id64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Debug for Id64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id64(0x{:x})", self.0)
    }
}

impl Serialize for Id64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Id64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_and_decimal() {
        assert_eq!("0x1f".parse::<Id64>().unwrap(), Id64::new(31));
        assert_eq!("0X1F".parse::<Id64>().unwrap(), Id64::new(31));
        assert_eq!("42".parse::<Id64>().unwrap(), Id64::new(42));
        assert!("0xzz".parse::<Id64>().is_err());
        assert!("".parse::<Id64>().is_err());
    }

    #[test]
    fn test_display_is_lowercase_hex() {
        assert_eq!(Id64::new(0x20000000001).to_string(), "0x20000000001");
        assert_eq!(Id64::new(255).to_string(), "0xff");
    }

    #[test]
    fn test_validity() {
        assert!(!Id64::INVALID.is_valid());
        assert!(Id64::new(1).is_valid());
    }

    #[test]
    fn test_serde_string_form() {
        let json = serde_json::to_string(&Id64::new(16)).unwrap();
        assert_eq!(json, "\"0x10\"");
        let back: Id64 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Id64::new(16));
    }
}
