//! Lifecycle status of decidable items.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a block or transaction as seen by consensus.
///
/// ```text
/// Unknown ──┐
///           ├──> Accepted
/// Processing┤
///           └──> Rejected
/// ```
///
/// Accepted and Rejected are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Status {
    /// Not yet seen by consensus
    #[default]
    Unknown,
    /// Issued into consensus and awaiting a decision
    Processing,
    /// Irreversibly accepted
    Accepted,
    /// Irreversibly rejected
    Rejected,
}

impl Status {
    /// Returns true once the status is terminal
    #[must_use]
    pub fn decided(&self) -> bool {
        matches!(self, Status::Accepted | Status::Rejected)
    }

    /// Returns true if the item is known locally (anything but `Unknown`)
    #[must_use]
    pub fn fetched(&self) -> bool {
        !matches!(self, Status::Unknown)
    }

    /// Returns true if this status may move to `target`.
    ///
    /// Re-entering the same terminal status is allowed (idempotent decide).
    #[must_use]
    pub fn can_transition_to(&self, target: Status) -> bool {
        matches!(
            (self, target),
            (Status::Unknown, Status::Processing)
                | (Status::Unknown | Status::Processing, Status::Accepted)
                | (Status::Unknown | Status::Processing, Status::Rejected)
                | (Status::Processing, Status::Processing)
                | (Status::Accepted, Status::Accepted)
                | (Status::Rejected, Status::Rejected)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Unknown => write!(f, "Unknown"),
            Status::Processing => write!(f, "Processing"),
            Status::Accepted => write!(f, "Accepted"),
            Status::Rejected => write!(f, "Rejected"),
        }
    }
}
