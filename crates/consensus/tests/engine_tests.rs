//! Tests for the polling engine.
//!
//! These tests verify:
//! - Issuing items sends a query and arms its deadline
//! - Votes, failures and timeouts finish polls and drive decisions
//! - Backpressure, abandonment of decided polls and halting

use std::sync::Arc;

use glacier_consensus::{
    Applied, ChainConsensus, Consensus, ConsensusError, ConsensusResult, DagConsensus, Engine,
    Event, ManualTimer, Parameters, Query, Sampler, Sender, ValidatorSet, WeightedSampler,
};
use glacier_types::testing::{TestBlock, TestTx};
use glacier_types::{Bag, Decidable, Id, NodeId, Status};
use parking_lot::Mutex;

/// Always samples validators `1..=k` once each
struct FixedSampler;

impl Sampler for FixedSampler {
    fn sample(&self, k: usize) -> ConsensusResult<Bag<NodeId>> {
        Ok((1..=k as u64).map(NodeId::from_u64).collect())
    }
}

#[derive(Default)]
struct RecordingSender {
    queries: Mutex<Vec<Query>>,
}

impl RecordingSender {
    fn last(&self) -> Query {
        self.queries.lock().last().cloned().unwrap()
    }

    fn count(&self) -> usize {
        self.queries.lock().len()
    }
}

impl Sender for RecordingSender {
    fn send_query(&self, validators: &Bag<NodeId>, request_id: u32, candidates: &[Id]) {
        let mut validators = validators.list();
        validators.sort();
        self.queries.lock().push(Query {
            request_id,
            validators,
            candidates: candidates.to_vec(),
        });
    }
}

struct Harness<C: Consensus> {
    engine: Engine<C>,
    sender: Arc<RecordingSender>,
    timer: Arc<ManualTimer>,
}

impl<C: Consensus> Harness<C> {
    fn new(consensus: C) -> Self {
        let sender = Arc::new(RecordingSender::default());
        let timer = Arc::new(ManualTimer::new());
        let engine = Engine::new(
            consensus,
            Arc::new(FixedSampler),
            Arc::clone(&sender) as Arc<dyn Sender>,
            Arc::clone(&timer) as Arc<dyn glacier_consensus::Timer>,
        );
        Self {
            engine,
            sender,
            timer,
        }
    }

    /// Answer the latest query: `yes` validators vote `choice`, the rest fail
    fn answer(&mut self, yes: usize, choice: Id) -> ConsensusResult<Applied> {
        let query = self.sender.last();
        let mut applied = Applied::default();
        for (i, node) in query.validators.iter().enumerate() {
            let effects = if i < yes {
                self.engine.record_vote(query.request_id, *node, &[choice])?
            } else {
                self.engine.record_failure(query.request_id, *node)?
            };
            applied.extend(effects);
        }
        Ok(applied)
    }
}

fn params(beta: usize) -> Parameters {
    Parameters {
        k: 5,
        alpha: 4,
        beta,
        concurrent_repolls: 1,
        max_outstanding_polls: 4,
        decision_cache_size: 256,
    }
}

fn dag(beta: usize) -> Harness<DagConsensus> {
    Harness::new(DagConsensus::new(params(beta)).unwrap())
}

fn tx(n: u64, input: u64) -> Arc<TestTx> {
    TestTx::new(Id::from_u64(n), vec![Id::from_u64(1000 + input)]).shared()
}

#[test]
fn test_issue_sends_query() {
    let mut h = dag(3);
    assert_eq!(h.engine.preference(), None);
    let a = tx(1, 1);
    let applied = h.engine.issue(a.clone()).unwrap();
    assert!(applied.is_empty());
    assert_eq!(h.engine.preference(), Some(a.id()));

    assert_eq!(h.sender.count(), 1);
    let query = h.sender.last();
    assert_eq!(query.request_id, 0);
    assert_eq!(query.candidates, vec![a.id()]);
    assert_eq!(query.validators.len(), 5);
    assert_eq!(h.timer.pending(), vec![0]);
    assert_eq!(h.engine.outstanding_polls(), 1);
    assert_eq!(h.engine.status(&a.id()), Status::Processing);
    assert_eq!(h.engine.preference(), Some(a.id()));
}

#[test]
fn test_votes_decide_after_beta_polls() {
    let mut h = dag(3);
    let a = tx(1, 1);
    let b = tx(2, 1);
    h.engine.issue(a.clone()).unwrap();
    h.engine.issue(b.clone()).unwrap();
    assert_eq!(h.sender.count(), 1);

    for round in 0..2 {
        let applied = h.answer(4, b.id()).unwrap();
        assert!(applied.decisions.is_empty(), "round {}", round);
        assert_eq!(h.engine.outstanding_polls(), 1);
    }
    let applied = h.answer(4, b.id()).unwrap();
    assert_eq!(applied.accepted(), vec![b.id()]);
    assert_eq!(applied.rejected(), vec![a.id()]);
    assert!(h.engine.is_accepted(&b.id()));
    assert!(h.engine.is_rejected(&a.id()));
    assert_eq!(h.engine.outstanding_polls(), 0);
    assert!(h.timer.pending().is_empty());
    assert_eq!(h.engine.preference(), None);
}

#[test]
fn test_unanimous_virtuous_poll_accepts_at_once() {
    let mut h = dag(20);
    let a = tx(1, 1);
    h.engine.issue(a.clone()).unwrap();

    let applied = h.answer(5, a.id()).unwrap();
    assert_eq!(applied.accepted(), vec![a.id()]);
    assert_eq!(a.status(), Status::Accepted);
}

#[test]
fn test_votes_outside_sample_ignored() {
    let mut h = dag(1);
    let a = tx(1, 1);
    h.engine.issue(a.clone()).unwrap();

    let outsider = NodeId::from_u64(99);
    for _ in 0..5 {
        h.engine.record_vote(0, outsider, &[a.id()]).unwrap();
    }
    assert_eq!(h.engine.outstanding_polls(), 1);
    assert_eq!(a.status(), Status::Processing);

    // Unknown request IDs are ignored as well
    let applied = h.engine.record_vote(42, NodeId::from_u64(1), &[a.id()]).unwrap();
    assert!(applied.is_empty());
}

#[test]
fn test_timeout_counts_non_responders_as_abstaining() {
    let mut h = dag(1);
    let a = tx(1, 1);
    h.engine.issue(a.clone()).unwrap();

    let query = h.sender.last();
    for node in &query.validators[..3] {
        h.engine.record_vote(0, *node, &[a.id()]).unwrap();
    }
    let expired = h.timer.expire_all();
    assert_eq!(expired, vec![0]);
    let applied = h.engine.handle(Event::Timeout { request_id: 0 }).unwrap();
    assert!(applied.is_empty());
    assert_eq!(a.status(), Status::Processing);

    // A fresh poll replaces the expired one
    assert_eq!(h.sender.count(), 2);
    assert_eq!(h.sender.last().request_id, 1);
    assert_eq!(h.timer.pending(), vec![1]);

    // Late timeouts are harmless
    assert!(h.engine.record_timeout(0).unwrap().is_empty());
}

#[test]
fn test_handle_dispatches_events() {
    let mut h = dag(1);
    let a = tx(1, 1);
    h.engine.issue(a.clone()).unwrap();
    let query = h.sender.last();

    for node in &query.validators[..4] {
        h.engine
            .handle(Event::Vote {
                request_id: query.request_id,
                node: *node,
                choices: vec![a.id()],
            })
            .unwrap();
    }
    let applied = h
        .engine
        .handle(Event::Failed {
            request_id: query.request_id,
            node: query.validators[4],
        })
        .unwrap();
    assert_eq!(applied.accepted(), vec![a.id()]);
}

#[test]
fn test_backpressure() {
    let mut h = dag(3);
    let a = tx(1, 1);
    h.engine.issue(a.clone()).unwrap();
    for _ in 0..3 {
        h.engine.issue_poll(vec![a.id()]).unwrap();
    }
    let err = h.engine.issue_poll(vec![a.id()]).unwrap_err();
    assert_eq!(
        err,
        ConsensusError::TooManyOutstandingPolls {
            outstanding: 4,
            max: 4
        }
    );
    assert_eq!(h.engine.outstanding_polls(), 4);
}

#[test]
fn test_polls_for_decided_items_abandoned() {
    let mut h = dag(1);
    let a = tx(1, 1);
    h.engine.issue(a.clone()).unwrap();
    let extra = h.engine.issue_poll(vec![a.id()]).unwrap();
    assert_eq!(h.engine.outstanding_polls(), 2);

    // Answer the first poll; the second one is for a decided item
    let first = h.sender.queries.lock()[0].clone();
    for node in &first.validators {
        h.engine.record_vote(first.request_id, *node, &[a.id()]).unwrap();
    }
    assert_eq!(a.status(), Status::Accepted);
    assert_eq!(h.engine.outstanding_polls(), 0);
    assert!(!h.engine.polls().contains(extra));
    assert!(!h.timer.is_pending(extra));
}

#[test]
fn test_request_ids_are_unique() {
    let mut h = dag(20);
    let a = tx(1, 1);
    h.engine.issue(a.clone()).unwrap();
    let first = h.engine.issue_poll(vec![a.id()]).unwrap();
    let second = h.engine.issue_poll(vec![a.id()]).unwrap();
    assert_ne!(first, second);
    assert_eq!(h.engine.polls().request_ids(), vec![0, first, second]);
}

#[test]
fn test_insufficient_validators() {
    let sender = Arc::new(RecordingSender::default());
    let mut engine = Engine::new(
        DagConsensus::new(params(3)).unwrap(),
        Arc::new(WeightedSampler::new(&ValidatorSet::default(), None, 0)),
        Arc::clone(&sender) as Arc<dyn Sender>,
        Arc::new(ManualTimer::new()),
    );
    let a = tx(1, 1);

    // Issuing still succeeds; only the poll could not be sent
    engine.issue(a.clone()).unwrap();
    assert_eq!(sender.count(), 0);
    assert_eq!(
        engine.issue_poll(vec![a.id()]).unwrap_err(),
        ConsensusError::InsufficientValidators
    );
}

#[test]
fn test_invariant_violation_halts_engine() {
    let mut h = dag(1);
    let a = tx(1, 1);
    let b = tx(2, 1);
    h.engine.issue(a.clone()).unwrap();
    h.engine.issue(b.clone()).unwrap();

    // The VM accepts the rival outside consensus
    b.accept().unwrap();

    let err = h.answer(4, a.id()).unwrap_err();
    assert!(matches!(err, ConsensusError::InvariantViolation(_)));
    assert!(h.engine.is_halted());
    assert!(h.engine.halt_reason().is_some());
    assert_eq!(h.engine.outstanding_polls(), 0);

    let err = h.engine.issue(tx(3, 3)).unwrap_err();
    assert!(matches!(err, ConsensusError::Halted(_)));
    let err = h.engine.record_timeout(0).unwrap_err();
    assert!(matches!(err, ConsensusError::Halted(_)));
}

#[test]
fn test_issue_errors_leave_engine_running() {
    let mut h = dag(3);
    let a = tx(1, 1);
    h.engine.issue(a.clone()).unwrap();
    let err = h.engine.issue(a.clone()).unwrap_err();
    assert_eq!(err, ConsensusError::AlreadyIssued(a.id()));
    assert!(!h.engine.is_halted());
}

#[test]
fn test_votes_for_reflects_preference() {
    let mut h = dag(5);
    let a = tx(1, 1);
    let b = tx(2, 1);
    h.engine.issue(a.clone()).unwrap();
    h.engine.issue(b.clone()).unwrap();
    assert_eq!(h.engine.votes_for(&[b.id()]), vec![a.id()]);

    h.answer(4, b.id()).unwrap();
    assert_eq!(h.engine.votes_for(&[a.id()]), vec![b.id()]);
}

#[test]
fn test_chain_engine_accepts_blocks() {
    let genesis = TestBlock::genesis(Id::from_u64(1));
    let mut h = Harness::new(ChainConsensus::new(params(2), genesis.id(), 0).unwrap());
    assert_eq!(h.engine.preference(), Some(genesis.id()));

    let b1 = TestBlock::child_of(&genesis, 1).shared();
    let b2 = TestBlock::child_of(&b1, 2).shared();
    h.engine.issue(b1.clone()).unwrap();
    h.engine.issue(b2.clone()).unwrap();
    assert_eq!(h.engine.preference(), Some(b2.id()));
    assert_eq!(h.sender.last().candidates, vec![b1.id()]);

    h.answer(4, b2.id()).unwrap();
    assert_eq!(h.sender.last().candidates, vec![b2.id()]);
    let applied = h.answer(4, b2.id()).unwrap();
    assert_eq!(applied.accepted(), vec![b1.id(), b2.id()]);
    assert_eq!(h.engine.consensus().last_accepted(), b2.id());
    assert_eq!(h.engine.outstanding_polls(), 0);
    // Nothing processing: the chain still prefers its last accepted block
    assert_eq!(h.engine.preference(), Some(b2.id()));
}
