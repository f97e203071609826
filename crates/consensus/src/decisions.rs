//! Bounded memory of decided items.
//!
//! Decided items are evicted from the consensus graphs immediately. The cache
//! keeps their final status for a while so late arrivals (a child of a
//! rejected block, a dependency that was already accepted, a vote for a decided
//! ID) can still be resolved.
//!
//! ## Eviction Policy
//!
//! First in, first out: once `capacity` entries are held, recording a new ID
//! evicts the oldest one.

use std::collections::{HashMap, VecDeque};

use glacier_types::{Id, Status};
use tracing::trace;

/// Result of recording a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordResult {
    /// First time this ID was recorded
    New,
    /// Already recorded with the same status
    Duplicate,
    /// Already recorded with the opposite status
    Conflicting(Status),
}

/// FIFO cache of final statuses keyed by item ID
#[derive(Debug, Clone)]
pub struct DecisionCache {
    /// Maximum number of remembered IDs
    capacity: usize,
    /// Insertion order for eviction
    order: VecDeque<Id>,
    /// Final status per ID
    statuses: HashMap<Id, Status>,
    /// Accepted rival of a rejected ID, where one is known
    winners: HashMap<Id, Id>,
    /// Entries dropped so far
    evicted: u64,
}

impl DecisionCache {
    /// Create a cache holding at most `capacity` decisions
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(4096)),
            statuses: HashMap::new(),
            winners: HashMap::new(),
            evicted: 0,
        }
    }

    /// Remember that `id` reached `status`
    pub fn record(&mut self, id: Id, status: Status) -> RecordResult {
        if let Some(existing) = self.statuses.get(&id) {
            if *existing == status {
                return RecordResult::Duplicate;
            }
            return RecordResult::Conflicting(*existing);
        }

        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.statuses.remove(&oldest);
                self.winners.remove(&oldest);
                self.evicted += 1;
                trace!(id = %oldest.short(), "Evicted decision");
            }
        }

        self.order.push_back(id);
        self.statuses.insert(id, status);
        RecordResult::New
    }

    /// Final status of `id`, if still remembered
    pub fn get(&self, id: &Id) -> Option<Status> {
        self.statuses.get(id).copied()
    }

    /// Remember that `winner` was accepted over the rejected `id`.
    ///
    /// Ignored unless `id` is currently remembered as rejected.
    pub fn record_winner(&mut self, id: Id, winner: Id) {
        if self.is_rejected(&id) {
            self.winners.insert(id, winner);
        }
    }

    /// Accepted rival of the rejected `id`, if known
    pub fn winner(&self, id: &Id) -> Option<Id> {
        self.winners.get(id).copied()
    }

    /// Whether `id` is remembered as accepted
    pub fn is_accepted(&self, id: &Id) -> bool {
        self.get(id) == Some(Status::Accepted)
    }

    /// Whether `id` is remembered as rejected
    pub fn is_rejected(&self, id: &Id) -> bool {
        self.get(id) == Some(Status::Rejected)
    }

    /// Number of remembered decisions
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Maximum number of remembered decisions
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of decisions evicted so far
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
