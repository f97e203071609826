//! Interface shared by the DAG and chain consensus instances.

use std::fmt;
use std::sync::Arc;

use glacier_types::{Decidable, Id, Status};
use tracing::warn;

use crate::error::{ConsensusError, ConsensusResult};
use crate::parameters::Parameters;
use crate::poll::PollResult;

/// A terminal status reached by an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Decided item
    pub id: Id,
    /// `Accepted` or `Rejected`
    pub status: Status,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id.short(), self.status)
    }
}

/// Effects of adding an item or applying a poll
#[derive(Debug, Default)]
pub struct Applied {
    /// Items decided, in the order they were decided
    pub decisions: Vec<Decision>,
    /// Per-item failures reported while deciding; consensus continued
    pub errors: Vec<ConsensusError>,
}

impl Applied {
    /// Nothing was decided and nothing failed
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty() && self.errors.is_empty()
    }

    /// Append another set of effects
    pub fn extend(&mut self, other: Applied) {
        self.decisions.extend(other.decisions);
        self.errors.extend(other.errors);
    }

    /// IDs accepted, in order
    pub fn accepted(&self) -> Vec<Id> {
        self.with_status(Status::Accepted)
    }

    /// IDs rejected, in order
    pub fn rejected(&self) -> Vec<Id> {
        self.with_status(Status::Rejected)
    }

    fn with_status(&self, status: Status) -> Vec<Id> {
        self.decisions
            .iter()
            .filter(|d| d.status == status)
            .map(|d| d.id)
            .collect()
    }
}

/// A consensus instance driven by poll results.
pub trait Consensus: Send {
    /// Item type decided by this instance
    type Item: ?Sized + Decidable;

    /// Parameters this instance runs with
    fn parameters(&self) -> &Parameters;

    /// Start deciding `item`.
    ///
    /// Items that can never be accepted are rejected immediately and reported
    /// in the returned [`Applied`].
    fn add(&mut self, item: Arc<Self::Item>) -> ConsensusResult<Applied>;

    /// Apply a finished poll that asked about `candidates`
    fn record_poll(&mut self, result: &PollResult, candidates: &[Id]) -> ConsensusResult<Applied>;

    /// IDs to query about in the next poll
    fn preferences(&self) -> Vec<Id>;

    /// Best current candidate
    fn preference(&self) -> Option<Id> {
        self.preferences().first().copied()
    }

    /// IDs this node answers with when queried about `candidates`
    fn votes_for(&self, candidates: &[Id]) -> Vec<Id>;

    /// Status as known by this instance; `Unknown` if never seen or forgotten
    fn status_of(&self, id: &Id) -> Status;

    /// Whether `id` is currently being decided
    fn is_processing(&self, id: &Id) -> bool {
        self.status_of(id) == Status::Processing
    }

    /// Number of items still being decided
    fn num_processing(&self) -> usize;

    /// Whether every issued item is decided
    fn finalized(&self) -> bool {
        self.num_processing() == 0
    }

    /// Check internal invariants, reporting the first violation found
    fn verify(&self) -> ConsensusResult<()> {
        Ok(())
    }
}

/// Drive `item` to `target`, recording any failure in `applied`.
///
/// Returns the status the item actually ended up in. A VM failure after the
/// transition still counts as the requested decision.
pub(crate) fn decide<T: Decidable + ?Sized>(
    item: &T,
    target: Status,
    applied: &mut Applied,
) -> Status {
    let result = match target {
        Status::Accepted => item.accept(),
        _ => item.reject(),
    };
    if let Err(err) = result {
        warn!(
            id = %item.id().short(),
            target = %target,
            error = %err,
            "Item failed to apply decision"
        );
        applied.errors.push(err.into());
    }
    match item.status() {
        status if status.decided() => status,
        _ => target,
    }
}
