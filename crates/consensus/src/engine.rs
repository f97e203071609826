//! Snowball polling engine.
//!
//! The engine drives one consensus instance. It owns the outstanding polls
//! and turns network responses into confidence updates.
//!
//! ## Poll Flow
//!
//! 1. **Issue**: sample `k` validator slots, register the poll, send the query
//!    and arm its deadline
//! 2. **Collect**: votes, failures and the deadline finish the poll
//! 3. **Apply**: the tally is recorded by the consensus instance, which may
//!    accept or reject items
//! 4. **Repoll**: while items are processing, keep `concurrent_repolls` polls
//!    in flight
//!
//! All mutation happens through `&mut self`, so one engine is one
//! serialization point. Run it behind a lock or inside
//! [`crate::service::EngineService`].
//!
//! ## Failure Handling
//!
//! Per-item failures are reported in [`Applied::errors`] and do not stop the
//! engine. A broken safety invariant halts the engine; every later call
//! returns [`ConsensusError::Halted`].

use std::collections::HashMap;
use std::sync::Arc;

use glacier_types::{Id, NodeId, Status};
use tracing::{debug, error, trace, warn};

use crate::consensus::{Applied, Consensus};
use crate::error::{ConsensusError, ConsensusResult};
use crate::network::Sender;
use crate::poll::{PollResult, PollSet};
use crate::timeout::Timer;
use crate::validators::Sampler;

/// Input to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A validator answered a query
    Vote {
        /// Request ID of the query
        request_id: u32,
        /// Responding validator
        node: NodeId,
        /// IDs the validator prefers
        choices: Vec<Id>,
    },
    /// A validator could not be reached or answered malformed data
    Failed {
        /// Request ID of the query
        request_id: u32,
        /// Validator that failed
        node: NodeId,
    },
    /// A poll's deadline expired
    Timeout {
        /// Request ID of the expired poll
        request_id: u32,
    },
}

/// Polling engine over a consensus instance
pub struct Engine<C: Consensus> {
    consensus: C,
    polls: PollSet,
    /// Candidates each outstanding poll asked about
    queries: HashMap<u32, Vec<Id>>,
    sampler: Arc<dyn Sampler>,
    sender: Arc<dyn Sender>,
    timer: Arc<dyn Timer>,
    next_request_id: u32,
    halted: Option<String>,
}

impl<C: Consensus> Engine<C> {
    /// Create an engine over `consensus`
    pub fn new(
        consensus: C,
        sampler: Arc<dyn Sampler>,
        sender: Arc<dyn Sender>,
        timer: Arc<dyn Timer>,
    ) -> Self {
        Self {
            consensus,
            polls: PollSet::new(),
            queries: HashMap::new(),
            sampler,
            sender,
            timer,
            next_request_id: 0,
            halted: None,
        }
    }

    /// The consensus instance
    pub fn consensus(&self) -> &C {
        &self.consensus
    }

    /// Outstanding polls
    pub fn polls(&self) -> &PollSet {
        &self.polls
    }

    /// Number of outstanding polls
    pub fn outstanding_polls(&self) -> usize {
        self.polls.len()
    }

    /// Whether the engine stopped after an invariant violation
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Why the engine stopped, if it did
    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Start deciding `item` and poll for it
    pub fn issue(&mut self, item: Arc<C::Item>) -> ConsensusResult<Applied> {
        self.ensure_running()?;
        let applied = match self.consensus.add(item) {
            Ok(applied) => applied,
            Err(err) if err.is_fatal() => return Err(self.halt(err)),
            Err(err) => return Err(err),
        };
        self.abandon_decided();
        self.repoll();
        Ok(applied)
    }

    /// Sample validators and query them about `candidates`
    pub fn issue_poll(&mut self, candidates: Vec<Id>) -> ConsensusResult<u32> {
        self.ensure_running()?;
        let params = *self.consensus.parameters();
        if self.polls.len() >= params.max_outstanding_polls {
            return Err(ConsensusError::TooManyOutstandingPolls {
                outstanding: self.polls.len(),
                max: params.max_outstanding_polls,
            });
        }

        let sample = self.sampler.sample(params.k)?;
        let request_id = self.fresh_request_id();
        if !self.polls.add(request_id, sample.clone()) {
            return Err(ConsensusError::DuplicateRequestId(request_id));
        }
        self.queries.insert(request_id, candidates.clone());
        self.timer.register(request_id);
        self.sender.send_query(&sample, request_id, &candidates);
        debug!(
            request_id,
            candidates = candidates.len(),
            validators = sample.distinct(),
            "Issued poll"
        );
        Ok(request_id)
    }

    /// Record a validator's response
    pub fn record_vote(
        &mut self,
        request_id: u32,
        node: NodeId,
        choices: &[Id],
    ) -> ConsensusResult<Applied> {
        self.ensure_running()?;
        match self.polls.vote(request_id, node, choices) {
            Some(result) => self.apply(result),
            None => Ok(Applied::default()),
        }
    }

    /// Record that a validator will not respond
    pub fn record_failure(&mut self, request_id: u32, node: NodeId) -> ConsensusResult<Applied> {
        self.ensure_running()?;
        match self.polls.drop_vote(request_id, node) {
            Some(result) => self.apply(result),
            None => Ok(Applied::default()),
        }
    }

    /// Finish a poll whose deadline expired
    pub fn record_timeout(&mut self, request_id: u32) -> ConsensusResult<Applied> {
        self.ensure_running()?;
        match self.polls.timeout(request_id) {
            Some(result) => self.apply(result),
            None => {
                trace!(request_id, "Timeout for a poll that already finished");
                Ok(Applied::default())
            }
        }
    }

    /// Dispatch an event to the matching entry point
    pub fn handle(&mut self, event: Event) -> ConsensusResult<Applied> {
        match event {
            Event::Vote {
                request_id,
                node,
                choices,
            } => self.record_vote(request_id, node, &choices),
            Event::Failed { request_id, node } => self.record_failure(request_id, node),
            Event::Timeout { request_id } => self.record_timeout(request_id),
        }
    }

    /// Best current candidate.
    ///
    /// A chain answers with its last accepted block when nothing is
    /// processing; a DAG answers `None`.
    pub fn preference(&self) -> Option<Id> {
        self.consensus.preference()
    }

    /// IDs this node answers with when queried about `candidates`
    pub fn votes_for(&self, candidates: &[Id]) -> Vec<Id> {
        self.consensus.votes_for(candidates)
    }

    /// Status of `id` as known to this engine
    pub fn status(&self, id: &Id) -> Status {
        self.consensus.status_of(id)
    }

    /// Whether `id` is known to be accepted
    pub fn is_accepted(&self, id: &Id) -> bool {
        self.status(id) == Status::Accepted
    }

    /// Whether `id` is known to be rejected
    pub fn is_rejected(&self, id: &Id) -> bool {
        self.status(id) == Status::Rejected
    }

    fn apply(&mut self, result: PollResult) -> ConsensusResult<Applied> {
        self.timer.cancel(result.request_id);
        let candidates = self.queries.remove(&result.request_id).unwrap_or_default();
        trace!(
            request_id = result.request_id,
            seq = result.seq,
            tally = %result.tally,
            responded = result.responded_weight,
            "Applying poll"
        );

        let applied = match self.consensus.record_poll(&result, &candidates) {
            Ok(applied) => applied,
            Err(err) if err.is_fatal() => return Err(self.halt(err)),
            Err(err) => return Err(err),
        };
        if let Err(err) = self.consensus.verify() {
            return Err(self.halt(err));
        }

        if !applied.decisions.is_empty() {
            debug!(
                request_id = result.request_id,
                accepted = applied.accepted().len(),
                rejected = applied.rejected().len(),
                processing = self.consensus.num_processing(),
                "Poll decided items"
            );
        }
        self.abandon_decided();
        self.repoll();
        Ok(applied)
    }

    /// Drop polls whose candidates are all decided
    fn abandon_decided(&mut self) {
        let consensus = &self.consensus;
        let finished: Vec<u32> = self
            .queries
            .iter()
            .filter(|(_, candidates)| candidates.iter().all(|id| !consensus.is_processing(id)))
            .map(|(request_id, _)| *request_id)
            .collect();
        for request_id in finished {
            self.queries.remove(&request_id);
            self.polls.abandon(request_id);
            self.timer.cancel(request_id);
            trace!(request_id, "Abandoned poll for decided candidates");
        }
    }

    /// Keep `concurrent_repolls` polls in flight while items are processing
    fn repoll(&mut self) {
        let target = self.consensus.parameters().concurrent_repolls;
        while self.consensus.num_processing() > 0 && self.polls.len() < target {
            let candidates = self.consensus.preferences();
            if candidates.is_empty() {
                break;
            }
            if let Err(err) = self.issue_poll(candidates) {
                warn!(error = %err, "Failed to issue repoll");
                break;
            }
        }
    }

    fn fresh_request_id(&mut self) -> u32 {
        loop {
            let request_id = self.next_request_id;
            self.next_request_id = self.next_request_id.wrapping_add(1);
            if !self.polls.contains(request_id) {
                return request_id;
            }
        }
    }

    fn ensure_running(&self) -> ConsensusResult<()> {
        match &self.halted {
            Some(reason) => Err(ConsensusError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    fn halt(&mut self, err: ConsensusError) -> ConsensusError {
        error!(error = %err, "Consensus invariant violated; halting engine");
        self.halted = Some(err.to_string());
        for request_id in self.polls.request_ids() {
            self.polls.abandon(request_id);
            self.timer.cancel(request_id);
        }
        self.queries.clear();
        err
    }
}
