//! # Glacier Types
//!
//! Core type definitions shared by every Glacier crate.
//!
//! This crate provides:
//! - [`Id`] - 32-byte identifier of a block or transaction
//! - [`NodeId`] - 20-byte identifier of a validator node
//! - [`Status`] - lifecycle status of a decidable item
//! - [`Bag`] - a counted multiset used for validator samples and vote tallies
//! - [`Decidable`], [`Tx`] and [`Block`] - the capabilities consensus needs
//!   from items supplied by a virtual machine
//!
//! ## Example
//!
//! ```rust
//! use glacier_types::{Bag, Id, Status};
//!
//! let id = Id::keccak256(b"block");
//! let mut tally = Bag::new();
//! tally.add_count(id, 16);
//!
//! assert_eq!(tally.count(&id), 16);
//! assert!(!Status::Processing.decided());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod bag;
pub mod decidable;
pub mod id;
pub mod node_id;
pub mod status;
pub mod testing;

pub use bag::Bag;
pub use decidable::{Block, Decidable, DecidableError, StatusCell, Tx};
pub use id::{Id, ID_SIZE};
pub use node_id::{NodeId, NODE_ID_SIZE};
pub use status::Status;

/// Result type alias for parsing operations in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised when decoding identifiers
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid hex string
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Invalid length for a fixed-size type
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid node identifier format
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
}
