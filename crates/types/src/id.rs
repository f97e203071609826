//! 32-byte identifier for decidable items.
//!
//! Blocks and transactions are both identified by an [`Id`], normally the
//! Keccak256 digest of their serialized bytes.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// Size of an identifier in bytes
pub const ID_SIZE: usize = 32;

/// A 32-byte opaque identifier.
///
/// # Example
///
/// ```rust
/// use glacier_types::Id;
///
/// let id = Id::keccak256(b"tx");
/// let parsed: Id = id.to_hex().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// The empty identifier (all zeros), used as the genesis parent.
    pub const EMPTY: Self = Self([0u8; ID_SIZE]);

    /// Creates a new identifier from a 32-byte array.
    #[inline]
    pub const fn new(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates an identifier from a slice.
    ///
    /// Returns an error if the slice length is not exactly 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != ID_SIZE {
            return Err(Error::InvalidLength {
                expected: ID_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; ID_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Builds an identifier whose last eight bytes hold `n` (big endian).
    ///
    /// Handy for tests and simulations that need many distinct IDs.
    pub fn from_u64(n: u64) -> Self {
        let mut bytes = [0u8; ID_SIZE];
        bytes[ID_SIZE - 8..].copy_from_slice(&n.to_be_bytes());
        Self(bytes)
    }

    /// Computes the Keccak256 digest of `data` as an identifier.
    pub fn keccak256(data: &[u8]) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut bytes = [0u8; ID_SIZE];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Derives a new identifier by hashing this one with a numeric prefix.
    pub fn prefix(&self, n: u64) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(n.to_be_bytes());
        hasher.update(self.0);
        let result = hasher.finalize();
        let mut bytes = [0u8; ID_SIZE];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Returns the identifier as a byte slice.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Checks if this is the empty identifier.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self == &Self::EMPTY
    }

    /// Creates an identifier from its hex representation (optional `0x` prefix).
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }

    /// Returns the hex representation with 0x prefix.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// First eight bytes in hex, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.short())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }
}

impl From<Id> for [u8; ID_SIZE] {
    fn from(id: Id) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
