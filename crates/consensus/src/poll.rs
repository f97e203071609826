//! Vote collection for outstanding polls.
//!
//! This module handles:
//! - Collecting one response per sampled validator for a single query
//! - Weighting each response by the validator's multiplicity in the sample
//! - Keeping each validator's ballot so a vote is never counted twice
//! - Counting non-responders as abstentions on failure or timeout
//! - Tracking every outstanding poll by request ID in a [`PollSet`]

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use glacier_types::{Bag, Id, NodeId};
use tracing::{debug, trace};

/// One validator's answer, weighted by its multiplicity in the sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ballot {
    /// Sample slots held by the validator
    pub weight: u64,
    /// Distinct IDs the validator voted for
    pub choices: Vec<Id>,
}

impl Ballot {
    /// Ballot of `weight` slots; repeated choices are dropped
    pub fn new(weight: u64, choices: &[Id]) -> Self {
        let mut distinct: Vec<Id> = Vec::with_capacity(choices.len());
        for choice in choices {
            if !distinct.contains(choice) {
                distinct.push(*choice);
            }
        }
        Self {
            weight,
            choices: distinct,
        }
    }
}

/// Tally of a finished poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    /// Request ID of the query
    pub request_id: u32,
    /// Monotonic sequence assigned when the poll was registered
    pub seq: u64,
    /// Responding weight per voted ID
    pub tally: Bag<Id>,
    /// Answers of the validators that responded, ordered by validator
    pub ballots: Vec<Ballot>,
    /// Total weight of the sample (`k` slots)
    pub sample_weight: u64,
    /// Weight of validators that answered
    pub responded_weight: u64,
}

impl PollResult {
    /// Build a result from the ballots of the validators that answered
    pub fn new(request_id: u32, seq: u64, sample_weight: u64, ballots: Vec<Ballot>) -> Self {
        let mut tally = Bag::new();
        let mut responded_weight = 0;
        for ballot in &ballots {
            for choice in &ballot.choices {
                tally.add_count(*choice, ballot.weight);
            }
            responded_weight += ballot.weight;
        }
        Self {
            request_id,
            seq,
            tally,
            ballots,
            sample_weight,
            responded_weight,
        }
    }

    /// Whether every sampled slot voted for `id`
    pub fn is_unanimous_for(&self, id: &Id) -> bool {
        self.sample_weight > 0 && self.tally.count(id) == self.sample_weight
    }
}

/// A single outstanding query to a validator sample
#[derive(Debug, Clone)]
pub struct Poll {
    /// Request ID of the query
    request_id: u32,
    /// Sequence stamp assigned by the owning poll set
    seq: u64,
    /// Total weight of the sample
    sample_weight: u64,
    /// Sampled validators that have not answered, with their weight
    outstanding: Bag<NodeId>,
    /// Answers of the validators that responded
    ballots: BTreeMap<NodeId, Ballot>,
    /// Weight per voted ID
    tally: Bag<Id>,
    /// Weight of validators that answered
    responded_weight: u64,
}

impl Poll {
    /// Create a poll awaiting responses from `sample`
    pub fn new(request_id: u32, sample: Bag<NodeId>) -> Self {
        Self {
            request_id,
            seq: 0,
            sample_weight: sample.len(),
            outstanding: sample,
            ballots: BTreeMap::new(),
            tally: Bag::new(),
            responded_weight: 0,
        }
    }

    fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Request ID of this poll
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Sequence stamp of this poll
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Total sample weight
    pub fn sample_weight(&self) -> u64 {
        self.sample_weight
    }

    /// Record `node`'s vote for `choices`.
    ///
    /// The first response from a sampled validator counts with its full
    /// multiplicity. Responses from validators outside the sample and repeat
    /// responses are ignored. Returns true if this vote finished the poll.
    pub fn vote(&mut self, node: NodeId, choices: &[Id]) -> bool {
        let weight = self.outstanding.remove(&node);
        if weight == 0 {
            trace!(
                request_id = self.request_id,
                node = %node,
                "Ignoring vote from unsampled or already answered validator"
            );
            return false;
        }

        let ballot = Ballot::new(weight, choices);
        for choice in &ballot.choices {
            self.tally.add_count(*choice, weight);
        }
        self.responded_weight += weight;
        self.ballots.insert(node, ballot);
        self.finished()
    }

    /// Record that `node` will not answer; its weight becomes an abstention.
    ///
    /// Returns true if this finished the poll.
    pub fn drop_vote(&mut self, node: NodeId) -> bool {
        if self.outstanding.remove(&node) == 0 {
            return false;
        }
        self.finished()
    }

    /// Treat every outstanding validator as having abstained
    pub fn timeout(&mut self) {
        self.outstanding = Bag::new();
    }

    /// Whether every sampled validator has answered or abstained
    pub fn finished(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Whether `node` is still expected to answer
    pub fn is_outstanding(&self, node: &NodeId) -> bool {
        self.outstanding.contains(node)
    }

    /// Current tally; empty until the poll has finished
    pub fn result(&self) -> Bag<Id> {
        if self.finished() {
            self.tally.clone()
        } else {
            Bag::new()
        }
    }

    /// Snapshot of this poll as a result; the tally is empty unless finished
    pub fn to_result(&self) -> PollResult {
        PollResult {
            request_id: self.request_id,
            seq: self.seq,
            tally: self.result(),
            ballots: if self.finished() {
                self.ballots.values().cloned().collect()
            } else {
                Vec::new()
            },
            sample_weight: self.sample_weight,
            responded_weight: self.responded_weight,
        }
    }

    fn into_result(self) -> PollResult {
        PollResult {
            request_id: self.request_id,
            seq: self.seq,
            tally: self.tally,
            ballots: self.ballots.into_values().collect(),
            sample_weight: self.sample_weight,
            responded_weight: self.responded_weight,
        }
    }
}

impl fmt::Display for Poll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Poll(RequestID = {}, Seq = {}, Waiting On = {}, Responded = {}/{}, Tally = {})",
            self.request_id,
            self.seq,
            self.outstanding.len(),
            self.responded_weight,
            self.sample_weight,
            self.tally
        )
    }
}

/// All outstanding polls, keyed by request ID
#[derive(Debug, Default)]
pub struct PollSet {
    /// Outstanding polls
    polls: HashMap<u32, Poll>,
    /// Sequence stamp for the next registered poll
    next_seq: u64,
}

impl PollSet {
    /// Create an empty poll set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a poll for `request_id` over `sample`.
    ///
    /// Returns false without changing anything if the request ID is already
    /// outstanding.
    pub fn add(&mut self, request_id: u32, sample: Bag<NodeId>) -> bool {
        if self.polls.contains_key(&request_id) {
            debug!(request_id, "Dropping poll with duplicate request id");
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        trace!(request_id, seq, sample = %sample, "Registered poll");
        self.polls
            .insert(request_id, Poll::new(request_id, sample).with_seq(seq));
        true
    }

    /// Record a vote on an outstanding poll.
    ///
    /// Returns the result once the poll finishes; the poll is removed at that
    /// point. Unknown request IDs are ignored.
    pub fn vote(&mut self, request_id: u32, node: NodeId, choices: &[Id]) -> Option<PollResult> {
        let poll = match self.polls.get_mut(&request_id) {
            Some(poll) => poll,
            None => {
                trace!(request_id, node = %node, "Ignoring vote for unknown poll");
                return None;
            }
        };
        if !poll.vote(node, choices) {
            return None;
        }
        self.finish(request_id)
    }

    /// Record that `node` failed to answer an outstanding poll
    pub fn drop_vote(&mut self, request_id: u32, node: NodeId) -> Option<PollResult> {
        let poll = self.polls.get_mut(&request_id)?;
        if !poll.drop_vote(node) {
            return None;
        }
        self.finish(request_id)
    }

    /// Finish a poll, counting every non-responder as an abstention
    pub fn timeout(&mut self, request_id: u32) -> Option<PollResult> {
        let mut poll = self.polls.remove(&request_id)?;
        poll.timeout();
        debug!(request_id, poll = %poll, "Poll timed out");
        Some(poll.into_result())
    }

    /// Remove a poll without producing a result
    pub fn abandon(&mut self, request_id: u32) -> bool {
        self.polls.remove(&request_id).is_some()
    }

    /// Number of outstanding polls
    pub fn len(&self) -> usize {
        self.polls.len()
    }

    /// Whether no poll is outstanding
    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }

    /// Whether `request_id` is outstanding
    pub fn contains(&self, request_id: u32) -> bool {
        self.polls.contains_key(&request_id)
    }

    /// Outstanding poll for `request_id`
    pub fn get(&self, request_id: u32) -> Option<&Poll> {
        self.polls.get(&request_id)
    }

    /// Outstanding request IDs in ascending order
    pub fn request_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.polls.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn finish(&mut self, request_id: u32) -> Option<PollResult> {
        let poll = self.polls.remove(&request_id)?;
        debug!(request_id, poll = %poll, "Poll finished");
        Some(poll.into_result())
    }
}

impl fmt::Display for PollSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "current polls: ({} total)", self.polls.len())?;
        for request_id in self.request_ids() {
            if let Some(poll) = self.polls.get(&request_id) {
                write!(f, "\n    {}", poll)?;
            }
        }
        Ok(())
    }
}
