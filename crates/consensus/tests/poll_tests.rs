//! Tests for poll vote collection and the poll set.
//!
//! These tests verify:
//! - One counted response per sampled validator
//! - Weighting by sample multiplicity
//! - Abstentions on failure and timeout
//! - Silent handling of unknown request IDs

use glacier_consensus::{Ballot, Poll, PollResult, PollSet};
use glacier_types::{Bag, Id, NodeId};

fn node(n: u64) -> NodeId {
    NodeId::from_u64(n)
}

fn sample(nodes: &[(u64, u64)]) -> Bag<NodeId> {
    let mut bag = Bag::new();
    for (n, weight) in nodes {
        bag.add_count(node(*n), *weight);
    }
    bag
}

#[test]
fn test_poll_finishes_after_all_votes() {
    let a = Id::from_u64(1);
    let mut poll = Poll::new(1, sample(&[(1, 1), (2, 1)]));

    // Counted, but the poll is still waiting on node 2
    assert!(!poll.vote(node(1), &[a]));
    assert!(!poll.finished());
    assert!(poll.result().is_empty());

    assert!(poll.vote(node(2), &[a]));
    assert!(poll.finished());
    assert_eq!(poll.result().count(&a), 2);
}

#[test]
fn test_poll_ignores_unsampled_and_repeat_votes() {
    let a = Id::from_u64(1);
    let b = Id::from_u64(2);
    let mut poll = Poll::new(1, sample(&[(1, 1), (2, 1)]));

    assert!(!poll.vote(node(9), &[a]));
    assert!(!poll.vote(node(1), &[a]));
    assert!(!poll.vote(node(1), &[b]));
    assert!(poll.vote(node(2), &[a]));
    // A late repeat does not finish the poll a second time
    assert!(!poll.vote(node(2), &[b]));

    let result = poll.result();
    assert_eq!(result.count(&a), 2);
    assert_eq!(result.count(&b), 0);
}

#[test]
fn test_poll_weights_by_multiplicity() {
    let a = Id::from_u64(1);
    let mut poll = Poll::new(1, sample(&[(1, 3), (2, 1)]));
    assert_eq!(poll.sample_weight(), 4);

    poll.vote(node(1), &[a, a]);
    poll.vote(node(2), &[]);
    assert_eq!(poll.result().count(&a), 3);
}

#[test]
fn test_timeout_counts_non_responders_as_abstentions() {
    let a = Id::from_u64(0xA);
    let mut set = PollSet::new();
    assert!(set.add(7, sample(&[(1, 1), (2, 1), (3, 1)])));

    assert!(set.vote(7, node(1), &[a]).is_none());
    let result = set.timeout(7).expect("poll was outstanding");

    assert_eq!(result.request_id, 7);
    assert_eq!(result.tally.len(), 1);
    assert_eq!(result.tally.count(&a), 1);
    assert_eq!(result.responded_weight, 1);
    assert_eq!(result.sample_weight, 3);
    assert!(set.is_empty());
}

#[test]
fn test_poll_set_rejects_duplicate_request_id() {
    let mut set = PollSet::new();
    assert!(set.add(1, sample(&[(1, 1)])));
    assert!(!set.add(1, sample(&[(2, 1)])));
    assert_eq!(set.len(), 1);
    assert!(set.get(1).unwrap().is_outstanding(&node(1)));
}

#[test]
fn test_poll_set_vote_unknown_request_is_silent() {
    let mut set = PollSet::new();
    set.add(1, sample(&[(1, 1)]));
    assert!(set.vote(2, node(1), &[Id::from_u64(1)]).is_none());
    assert!(set.timeout(2).is_none());
    assert!(!set.abandon(2));
    assert_eq!(set.len(), 1);
}

#[test]
fn test_poll_set_removes_finished_poll() {
    let a = Id::from_u64(1);
    let mut set = PollSet::new();
    set.add(1, sample(&[(1, 1), (2, 1)]));

    assert!(set.vote(1, node(1), &[a]).is_none());
    let result = set.vote(1, node(2), &[a]).expect("finished");
    assert_eq!(result.tally.count(&a), 2);
    assert!(result.is_unanimous_for(&a));
    assert!(!set.contains(1));

    // Late duplicate after the poll finished
    assert!(set.vote(1, node(2), &[a]).is_none());
}

#[test]
fn test_drop_vote_finishes_poll() {
    let a = Id::from_u64(1);
    let mut set = PollSet::new();
    set.add(4, sample(&[(1, 1), (2, 1)]));

    set.vote(4, node(1), &[a]);
    let result = set.drop_vote(4, node(2)).expect("finished");
    assert_eq!(result.tally.count(&a), 1);
    assert!(!result.is_unanimous_for(&a));
}

#[test]
fn test_sequence_numbers_increase() {
    let a = Id::from_u64(1);
    let mut set = PollSet::new();
    set.add(10, sample(&[(1, 1)]));
    set.add(3, sample(&[(1, 1)]));

    let second = set.vote(3, node(1), &[a]).unwrap();
    let first = set.vote(10, node(1), &[a]).unwrap();
    assert!(first.seq < second.seq);
}

#[test]
fn test_poll_set_display() {
    let mut set = PollSet::new();
    set.add(2, sample(&[(1, 1)]));
    set.add(1, sample(&[(1, 2)]));

    let rendered = set.to_string();
    assert!(rendered.starts_with("current polls: (2 total)"));
    let first = rendered.find("RequestID = 1").unwrap();
    let second = rendered.find("RequestID = 2").unwrap();
    assert!(first < second);
}

#[test]
fn test_drop_vote_reports_finish() {
    let mut poll = Poll::new(1, sample(&[(1, 1), (2, 1)]));
    assert!(!poll.drop_vote(node(1)));
    assert!(!poll.drop_vote(node(1)));
    assert!(!poll.drop_vote(node(9)));
    assert!(poll.drop_vote(node(2)));
    assert!(poll.finished());
    assert!(poll.result().is_empty());
}

#[test]
fn test_result_keeps_one_ballot_per_validator() {
    let a = Id::from_u64(1);
    let b = Id::from_u64(2);
    let mut set = PollSet::new();
    set.add(1, sample(&[(1, 2), (2, 1), (3, 1)]));

    set.vote(1, node(2), &[b]);
    set.vote(1, node(1), &[a, b, a]);
    let result = set.timeout(1).unwrap();

    assert_eq!(
        result.ballots,
        vec![Ballot::new(2, &[a, b]), Ballot::new(1, &[b])]
    );
    assert_eq!(result.tally.count(&a), 2);
    assert_eq!(result.tally.count(&b), 3);
    assert_eq!(result.responded_weight, 3);
}

#[test]
fn test_result_from_ballots() {
    let a = Id::from_u64(1);
    let b = Id::from_u64(2);
    let result = PollResult::new(3, 9, 5, vec![Ballot::new(3, &[a, a]), Ballot::new(1, &[a, b])]);

    assert_eq!(result.request_id, 3);
    assert_eq!(result.seq, 9);
    assert_eq!(result.tally.count(&a), 4);
    assert_eq!(result.tally.count(&b), 1);
    assert_eq!(result.responded_weight, 4);
    assert_eq!(result.sample_weight, 5);
}
