//! Snowball confidence accumulator.
//!
//! One instance tracks a single decision (the preferred member of a conflict
//! set, or the preferred child of a block). Each applied poll yields a
//! [`Transition`]:
//!
//! | Poll outcome                          | successes | preference |
//! |---------------------------------------|-----------|------------|
//! | no candidate reached `alpha`          | reset to 0| unchanged  |
//! | quorum for the current preference     | + 1       | unchanged  |
//! | quorum for a different candidate      | set to 1  | switched   |
//!
//! The instance is finalized once `successes >= beta`. Poll results carry a
//! sequence number; results older than one already applied are refused.

use std::collections::HashMap;
use std::fmt;

use glacier_types::{Bag, Id};

use crate::error::{ConsensusError, ConsensusResult};

/// Kind of state change a poll produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No candidate reached the quorum
    NoQuorum,
    /// The current preference reached the quorum
    QuorumSameChoice,
    /// A different candidate reached the quorum and became preferred
    QuorumNewChoice,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::NoQuorum => write!(f, "NoQuorum"),
            Transition::QuorumSameChoice => write!(f, "QuorumSameChoice"),
            Transition::QuorumNewChoice => write!(f, "QuorumNewChoice"),
        }
    }
}

/// Quorum and finalization thresholds applied to one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Weight a candidate needs for a successful poll
    pub alpha: u64,
    /// Consecutive successes needed to finalize
    pub beta: usize,
}

impl Thresholds {
    /// Create thresholds from raw values
    pub fn new(alpha: usize, beta: usize) -> Self {
        Self {
            alpha: alpha as u64,
            beta,
        }
    }
}

/// Result of recording one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// What the poll did to the counters
    pub transition: Transition,
    /// Preference after the poll
    pub preference: Id,
    /// Consecutive successes after the poll
    pub successes: usize,
    /// Whether `successes` has reached `beta`
    pub finalized: bool,
}

/// Snowball instance over a set of candidate IDs
#[derive(Debug, Clone)]
pub struct Snowball {
    /// Currently preferred candidate
    preference: Id,
    /// Consecutive successful polls for the preference
    successes: usize,
    /// Number of successful polls each candidate has ever won
    strengths: HashMap<Id, u64>,
    /// Set once `successes >= beta`
    finalized: bool,
    /// Sequence number of the last applied poll
    last_poll: Option<u64>,
}

impl Snowball {
    /// Create an instance preferring `initial`
    pub fn new(initial: Id) -> Self {
        Self {
            preference: initial,
            successes: 0,
            strengths: HashMap::new(),
            finalized: false,
            last_poll: None,
        }
    }

    /// Currently preferred candidate
    pub fn preference(&self) -> Id {
        self.preference
    }

    /// Consecutive successful polls for the preference
    pub fn successes(&self) -> usize {
        self.successes
    }

    /// Whether the decision is final
    pub fn finalized(&self) -> bool {
        self.finalized
    }

    /// Total successful polls `id` has won
    pub fn strength(&self, id: &Id) -> u64 {
        self.strengths.get(id).copied().unwrap_or(0)
    }

    /// Sequence number of the last applied poll, if any
    pub fn last_poll(&self) -> Option<u64> {
        self.last_poll
    }

    /// Apply a poll tally.
    ///
    /// Only candidates present in `tally` are considered. Once finalized the
    /// counters no longer change; the transition still reports whether the
    /// final preference held the quorum.
    pub fn record_poll(
        &mut self,
        seq: u64,
        tally: &Bag<Id>,
        thresholds: Thresholds,
    ) -> ConsensusResult<PollOutcome> {
        self.check_sequence(seq)?;
        if self.finalized {
            let transition = match quorum_choice(tally, thresholds.alpha) {
                Some(choice) if choice == self.preference => Transition::QuorumSameChoice,
                _ => Transition::NoQuorum,
            };
            return Ok(self.outcome(transition));
        }

        let transition = match quorum_choice(tally, thresholds.alpha) {
            None => {
                self.successes = 0;
                Transition::NoQuorum
            }
            Some(choice) => {
                *self.strengths.entry(choice).or_insert(0) += 1;
                if choice == self.preference {
                    self.successes += 1;
                    Transition::QuorumSameChoice
                } else {
                    self.preference = choice;
                    self.successes = 1;
                    Transition::QuorumNewChoice
                }
            }
        };

        if self.successes >= thresholds.beta {
            self.finalized = true;
        }
        Ok(self.outcome(transition))
    }

    /// Apply a poll in which this decision received no quorum
    pub fn record_unsuccessful_poll(&mut self, seq: u64) -> ConsensusResult<PollOutcome> {
        self.check_sequence(seq)?;
        if !self.finalized {
            self.successes = 0;
        }
        Ok(self.outcome(Transition::NoQuorum))
    }

    /// Switch the preference after the preferred candidate was removed.
    ///
    /// Confidence restarts from zero and a previous finalization is undone.
    pub fn reset_preference(&mut self, preference: Id) {
        self.preference = preference;
        self.successes = 0;
        self.finalized = false;
    }

    /// Fold another instance into this one when two decisions merge.
    ///
    /// The preference of `self` is kept, confidence drops to the lower of the
    /// two and per-candidate strengths are combined.
    pub fn merge(&mut self, other: &Snowball) {
        self.successes = self.successes.min(other.successes);
        self.finalized = self.finalized && other.finalized;
        for (id, strength) in &other.strengths {
            *self.strengths.entry(*id).or_insert(0) += strength;
        }
        self.last_poll = match (self.last_poll, other.last_poll) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    fn check_sequence(&mut self, seq: u64) -> ConsensusResult<()> {
        if let Some(last) = self.last_poll {
            if seq < last {
                return Err(ConsensusError::StalePoll { seq, last });
            }
        }
        self.last_poll = Some(seq);
        Ok(())
    }

    fn outcome(&self, transition: Transition) -> PollOutcome {
        PollOutcome {
            transition,
            preference: self.preference,
            successes: self.successes,
            finalized: self.finalized,
        }
    }
}

impl fmt::Display for Snowball {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SB(Preference = {}, Successes = {}, Finalized = {})",
            self.preference.short(),
            self.successes,
            self.finalized
        )
    }
}

/// Single candidate whose weight reached `alpha`, if exactly one did
pub(crate) fn quorum_choice(tally: &Bag<Id>, alpha: u64) -> Option<Id> {
    let mut winners = tally.iter().filter(|(_, weight)| *weight >= alpha);
    let (choice, _) = winners.next()?;
    if winners.next().is_some() {
        return None;
    }
    Some(*choice)
}
