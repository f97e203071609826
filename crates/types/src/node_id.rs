//! 20-byte validator node identifier.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Size of a node identifier in bytes
pub const NODE_ID_SIZE: usize = 20;

/// Textual prefix used when displaying node identifiers
const NODE_ID_PREFIX: &str = "NodeID-";

/// Identifier of a validator node.
///
/// Displayed as `NodeID-<40 hex chars>`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// The zero node identifier
    pub const ZERO: Self = Self([0u8; NODE_ID_SIZE]);

    /// Creates a node identifier from a 20-byte array.
    #[inline]
    pub const fn new(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Builds a node identifier whose last eight bytes hold `n` (big endian).
    pub fn from_u64(n: u64) -> Self {
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[NODE_ID_SIZE - 8..].copy_from_slice(&n.to_be_bytes());
        Self(bytes)
    }

    /// Returns the identifier as a byte slice.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parses `NodeID-<hex>` (the prefix is optional).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.strip_prefix(NODE_ID_PREFIX).unwrap_or(s);
        let bytes = hex::decode(s)?;
        if bytes.len() != NODE_ID_SIZE {
            return Err(Error::InvalidNodeId(format!(
                "expected {} bytes, got {}",
                NODE_ID_SIZE,
                bytes.len()
            )));
        }
        let mut arr = [0u8; NODE_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", NODE_ID_PREFIX, hex::encode(self.0))
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<[u8; NODE_ID_SIZE]> for NodeId {
    fn from(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }
}

impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
