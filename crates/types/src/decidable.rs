//! Capabilities consensus requires from blocks and transactions.
//!
//! The virtual machine owns the concrete item types. Consensus only sees them
//! through these traits and drives them to a terminal status with
//! [`Decidable::accept`] and [`Decidable::reject`].

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Id, Status};

/// Errors produced when deciding an item
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecidableError {
    /// Accept/Reject called against an incompatible terminal status
    #[error("invalid state transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// Item being decided
        id: Id,
        /// Status before the call
        from: Status,
        /// Requested status
        to: Status,
    },

    /// The VM failed while applying the decision
    #[error("vm failed to decide {id}: {reason}")]
    Vm {
        /// Item being decided
        id: Id,
        /// VM supplied reason
        reason: String,
    },
}

/// An item that consensus can accept or reject exactly once.
///
/// Implementations must make status changes visible to every holder of the
/// item as soon as `accept`/`reject` returns. Repeating the same verb on an
/// already decided item is a successful no-op; the opposite verb is an
/// [`DecidableError::InvalidTransition`].
pub trait Decidable: Send + Sync {
    /// Identifier of this item
    fn id(&self) -> Id;

    /// Mark this item accepted
    fn accept(&self) -> Result<(), DecidableError>;

    /// Mark this item rejected
    fn reject(&self) -> Result<(), DecidableError>;

    /// Current status
    fn status(&self) -> Status;
}

/// A transaction decided by the conflict-set resolver.
pub trait Tx: Decidable {
    /// Transactions that must be accepted before this one may be
    fn dependencies(&self) -> Vec<Arc<dyn Tx>>;

    /// Inputs (spent resources). Two transactions sharing any input conflict.
    fn input_ids(&self) -> Vec<Id>;
}

/// A block decided by the chain engine.
pub trait Block: Decidable {
    /// Identifier of the parent block
    fn parent(&self) -> Id;

    /// Height of this block (parent height + 1)
    fn height(&self) -> u64;
}

/// Shared status cell implementing the decide-once rules.
///
/// VM implementations can embed a `StatusCell` to get the transition checks
/// required by [`Decidable`] for free.
#[derive(Debug, Default)]
pub struct StatusCell {
    status: Mutex<Status>,
}

impl StatusCell {
    /// Create a cell starting at `status`
    pub fn new(status: Status) -> Self {
        Self {
            status: Mutex::new(status),
        }
    }

    /// Current status
    pub fn get(&self) -> Status {
        *self.status.lock()
    }

    /// Move to `target` if permitted.
    ///
    /// Returns `Ok(true)` when the status changed, `Ok(false)` when the item
    /// already held `target`.
    pub fn transition(&self, id: Id, target: Status) -> Result<bool, DecidableError> {
        let mut status = self.status.lock();
        if !status.can_transition_to(target) {
            return Err(DecidableError::InvalidTransition {
                id,
                from: *status,
                to: target,
            });
        }
        let changed = *status != target;
        *status = target;
        Ok(changed)
    }
}
