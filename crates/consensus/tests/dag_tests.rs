//! Tests for the conflict-set resolver.
//!
//! These tests verify:
//! - Conflict set assignment and merging
//! - Finalization and rival rejection
//! - Dependency parking and cascade rejection
//! - The virtuous fast path

use std::sync::Arc;

use glacier_consensus::{
    Applied, Ballot, Consensus, ConsensusError, DagConsensus, Parameters, PollResult, Transition,
};
use glacier_types::testing::TestTx;
use glacier_types::{Bag, Decidable, Id, Status, Tx};

fn params(k: usize, alpha: usize, beta: usize) -> Parameters {
    Parameters {
        k,
        alpha,
        beta,
        concurrent_repolls: 1,
        max_outstanding_polls: 16,
        decision_cache_size: 256,
    }
}

fn id(n: u64) -> Id {
    Id::from_u64(n)
}

fn tx(n: u64, inputs: &[u64]) -> Arc<TestTx> {
    TestTx::new(id(n), inputs.iter().map(|i| id(1000 + i)).collect()).shared()
}

fn tx_with_deps(n: u64, inputs: &[u64], deps: &[&Arc<TestTx>]) -> Arc<TestTx> {
    TestTx::new(id(n), inputs.iter().map(|i| id(1000 + i)).collect())
        .with_dependencies(deps.iter().map(|d| Arc::clone(d)).collect())
        .shared()
}

fn add(dag: &mut DagConsensus, tx: &Arc<TestTx>) -> Applied {
    dag.add(Arc::clone(tx) as Arc<dyn Tx>).unwrap()
}

fn poll(seq: u64, sample_weight: u64, votes: &[(Id, u64)]) -> PollResult {
    let ballots = votes
        .iter()
        .map(|(id, weight)| Ballot::new(*weight, &[*id]))
        .collect();
    PollResult::new(seq as u32, seq, sample_weight, ballots)
}

#[test]
fn test_two_member_set_scenario() {
    let mut dag = DagConsensus::new(params(20, 15, 20)).unwrap();
    let x = tx(1, &[1]);
    let y = tx(2, &[1]);
    add(&mut dag, &x);
    add(&mut dag, &y);
    assert_eq!(dag.conflicts(&x.id()), vec![y.id()]);

    for seq in 0..19 {
        let applied = dag
            .record_poll(&poll(seq, 20, &[(x.id(), 16), (y.id(), 4)]), &[x.id(), y.id()])
            .unwrap();
        assert!(applied.decisions.is_empty());
    }
    assert_eq!(x.status(), Status::Processing);

    let applied = dag
        .record_poll(&poll(19, 20, &[(x.id(), 16), (y.id(), 4)]), &[x.id(), y.id()])
        .unwrap();
    assert_eq!(applied.accepted(), vec![x.id()]);
    assert_eq!(applied.rejected(), vec![y.id()]);
    assert_eq!(x.status(), Status::Accepted);
    assert_eq!(y.status(), Status::Rejected);
    assert_eq!(dag.num_processing(), 0);
    assert_eq!(dag.num_conflict_sets(), 0);
}

#[test]
fn test_virtuous_unanimous_fast_path() {
    let mut dag = DagConsensus::new(params(5, 4, 10)).unwrap();
    let a = tx(1, &[1]);
    add(&mut dag, &a);
    assert!(dag.is_virtuous(&a.id()));

    // Quorum but not unanimous: normal counting
    let applied = dag.record_poll(&poll(0, 5, &[(a.id(), 4)]), &[a.id()]).unwrap();
    assert!(applied.decisions.is_empty());

    let applied = dag.record_poll(&poll(1, 5, &[(a.id(), 5)]), &[a.id()]).unwrap();
    assert_eq!(applied.accepted(), vec![a.id()]);
}

#[test]
fn test_conflicting_item_not_fast_pathed() {
    let mut dag = DagConsensus::new(params(5, 4, 3)).unwrap();
    let a = tx(1, &[1]);
    let b = tx(2, &[1]);
    add(&mut dag, &a);
    add(&mut dag, &b);
    assert!(!dag.is_virtuous(&a.id()));

    let applied = dag.record_poll(&poll(0, 5, &[(a.id(), 5)]), &[a.id()]).unwrap();
    assert!(applied.decisions.is_empty());
    let set = dag.conflict_set_of(&a.id()).unwrap();
    assert_eq!(dag.snowball(set).unwrap().successes(), 1);
}

#[test]
fn test_merge_takes_minimum_confidence() {
    let mut dag = DagConsensus::new(params(20, 15, 20)).unwrap();
    let a = tx(1, &[1]);
    let b = tx(2, &[2]);
    add(&mut dag, &a);
    add(&mut dag, &b);

    for seq in 0..3 {
        dag.record_poll(&poll(seq, 20, &[(a.id(), 16)]), &[a.id()]).unwrap();
    }
    for seq in 3..8 {
        dag.record_poll(&poll(seq, 20, &[(b.id(), 16)]), &[b.id()]).unwrap();
    }
    let set_a = dag.conflict_set_of(&a.id()).unwrap();
    let set_b = dag.conflict_set_of(&b.id()).unwrap();
    assert_eq!(dag.snowball(set_a).unwrap().successes(), 3);
    assert_eq!(dag.snowball(set_b).unwrap().successes(), 5);

    let c = tx(3, &[1, 2]);
    add(&mut dag, &c);

    let merged = dag.conflict_set_of(&c.id()).unwrap();
    assert_eq!(dag.conflict_set_of(&a.id()), Some(merged));
    assert_eq!(dag.conflict_set_of(&b.id()), Some(merged));
    assert!(dag.snowball(merged).unwrap().successes() <= 3);
    assert_eq!(dag.preference(merged).unwrap(), a.id());
    assert_eq!(dag.num_conflict_sets(), 1);

    let mut conflicts = dag.conflicts(&c.id());
    conflicts.sort();
    assert_eq!(conflicts, vec![a.id(), b.id()]);
}

#[test]
fn test_merge_keeps_larger_set_preference() {
    let mut dag = DagConsensus::new(params(5, 4, 10)).unwrap();
    let a = tx(1, &[1]);
    let b1 = tx(2, &[2]);
    let b2 = tx(3, &[2]);
    add(&mut dag, &a);
    add(&mut dag, &b1);
    add(&mut dag, &b2);

    let c = tx(4, &[1, 2]);
    add(&mut dag, &c);
    let merged = dag.conflict_set_of(&c.id()).unwrap();
    assert_eq!(dag.preference(merged).unwrap(), b1.id());
    assert!(dag.snowball(dag.conflict_set_of(&a.id()).unwrap()).is_some());
}

#[test]
fn test_stale_handle_after_merge() {
    let mut dag = DagConsensus::new(params(5, 4, 10)).unwrap();
    let a = tx(1, &[1]);
    let b = tx(2, &[2]);
    add(&mut dag, &a);
    add(&mut dag, &b);
    let old_b = dag.conflict_set_of(&b.id()).unwrap();

    add(&mut dag, &tx(3, &[1, 2]));
    assert!(matches!(
        dag.preference(old_b),
        Err(ConsensusError::UnknownConflictSet(_))
    ));
    assert!(matches!(
        dag.record_set_poll(old_b, 0, &Bag::new(), 5),
        Err(ConsensusError::UnknownConflictSet(_))
    ));
}

#[test]
fn test_winner_parked_until_dependency_accepted() {
    let mut dag = DagConsensus::new(params(5, 4, 2)).unwrap();
    let parent = tx(1, &[1]);
    let rival = tx(2, &[1]);
    let child = tx_with_deps(3, &[3], &[&parent]);
    add(&mut dag, &parent);
    add(&mut dag, &rival);
    add(&mut dag, &child);

    // Child wins its singleton set through the fast path but must wait
    let applied = dag
        .record_poll(&poll(0, 5, &[(child.id(), 5)]), &[child.id()])
        .unwrap();
    assert!(applied.decisions.is_empty());
    assert_eq!(child.status(), Status::Processing);
    assert!(dag.preferences().contains(&parent.id()));
    assert!(!dag.preferences().contains(&child.id()));

    for seq in 1..3 {
        dag.record_poll(&poll(seq, 5, &[(parent.id(), 4)]), &[parent.id()])
            .unwrap();
    }
    assert_eq!(parent.status(), Status::Accepted);
    assert_eq!(rival.status(), Status::Rejected);
    assert_eq!(child.status(), Status::Accepted);
    assert_eq!(dag.num_processing(), 0);
}

#[test]
fn test_rejection_cascades_to_dependents() {
    let mut dag = DagConsensus::new(params(5, 4, 2)).unwrap();
    let a = tx(1, &[1]);
    let rival = tx(2, &[1]);
    let b = tx_with_deps(3, &[3], &[&a]);
    let c = tx_with_deps(4, &[4], &[&b]);
    add(&mut dag, &a);
    add(&mut dag, &rival);
    add(&mut dag, &b);
    add(&mut dag, &c);

    // b and c are favoured, but not decided
    dag.record_poll(&poll(0, 5, &[(b.id(), 4), (c.id(), 4)]), &[b.id(), c.id()])
        .unwrap();

    let mut applied = Applied::default();
    for seq in 1..4 {
        applied.extend(
            dag.record_poll(&poll(seq, 5, &[(rival.id(), 4)]), &[rival.id()])
                .unwrap(),
        );
    }
    assert_eq!(rival.status(), Status::Accepted);
    assert_eq!(a.status(), Status::Rejected);
    assert_eq!(b.status(), Status::Rejected);
    assert_eq!(c.status(), Status::Rejected);
    assert_eq!(applied.accepted(), vec![rival.id()]);
    assert_eq!(applied.rejected().len(), 3);
    dag.verify().unwrap();
}

#[test]
fn test_rejected_member_releases_its_inputs() {
    let mut dag = DagConsensus::new(params(5, 4, 2)).unwrap();
    let d = tx(1, &[1]);
    let d_rival = tx(2, &[1]);
    let x = tx(3, &[200]);
    let y = tx_with_deps(4, &[200, 300], &[&d]);
    for t in [&d, &d_rival, &x, &y] {
        add(&mut dag, t);
    }
    assert_eq!(dag.conflicts(&x.id()), vec![y.id()]);

    for seq in 0..2 {
        dag.record_poll(&poll(seq, 5, &[(d_rival.id(), 4)]), &[d_rival.id()])
            .unwrap();
    }
    assert_eq!(d.status(), Status::Rejected);
    assert_eq!(y.status(), Status::Rejected);

    // Only the departed y spent input 300, so z conflicts with nothing
    let z = tx(5, &[300]);
    add(&mut dag, &z);
    assert!(dag.conflicts(&z.id()).is_empty());
    assert!(dag.is_virtuous(&z.id()));
    assert_ne!(dag.conflict_set_of(&z.id()), dag.conflict_set_of(&x.id()));
    dag.verify().unwrap();

    for seq in 2..4 {
        dag.record_poll(&poll(seq, 5, &[(x.id(), 4), (z.id(), 4)]), &[x.id(), z.id()])
            .unwrap();
    }
    assert_eq!(x.status(), Status::Accepted);
    assert_eq!(z.status(), Status::Accepted);
    assert_eq!(dag.num_processing(), 0);
}

#[test]
fn test_add_with_rejected_dependency_rejects_immediately() {
    let mut dag = DagConsensus::new(params(5, 4, 1)).unwrap();
    let a = tx(1, &[1]);
    let rival = tx(2, &[1]);
    add(&mut dag, &a);
    add(&mut dag, &rival);
    dag.record_poll(&poll(0, 5, &[(rival.id(), 4)]), &[rival.id()])
        .unwrap();
    assert_eq!(a.status(), Status::Rejected);

    let late = tx_with_deps(3, &[3], &[&a]);
    let applied = add(&mut dag, &late);
    assert_eq!(applied.rejected(), vec![late.id()]);
    assert_eq!(late.status(), Status::Rejected);
    assert_eq!(dag.status_of(&late.id()), Status::Rejected);
}

#[test]
fn test_add_spending_accepted_input_rejects_immediately() {
    let mut dag = DagConsensus::new(params(5, 4, 1)).unwrap();
    let a = tx(1, &[1]);
    add(&mut dag, &a);
    dag.record_poll(&poll(0, 5, &[(a.id(), 4)]), &[a.id()]).unwrap();
    assert_eq!(a.status(), Status::Accepted);

    let double_spend = tx(2, &[1]);
    let applied = add(&mut dag, &double_spend);
    assert_eq!(applied.rejected(), vec![double_spend.id()]);
    assert_eq!(double_spend.status(), Status::Rejected);
}

#[test]
fn test_spent_inputs_outlive_decision_cache() {
    let mut dag = DagConsensus::new(Parameters {
        decision_cache_size: 1,
        ..params(5, 4, 1)
    })
    .unwrap();
    let a = tx(1, &[1, 2]);
    add(&mut dag, &a);
    dag.record_poll(&poll(0, 5, &[(a.id(), 4)]), &[a.id()]).unwrap();
    assert_eq!(dag.num_spent_inputs(), 2);

    // Deciding b evicts a from the one-entry cache
    let b = tx(2, &[3]);
    add(&mut dag, &b);
    dag.record_poll(&poll(1, 5, &[(b.id(), 4)]), &[b.id()]).unwrap();
    assert_eq!(dag.status_of(&a.id()), Status::Unknown);
    assert_eq!(dag.num_spent_inputs(), 3);

    let double_spend = tx(4, &[2]);
    let applied = add(&mut dag, &double_spend);
    assert_eq!(applied.rejected(), vec![double_spend.id()]);
    assert_eq!(double_spend.status(), Status::Rejected);
}

#[test]
fn test_unknown_dependency() {
    let mut dag = DagConsensus::new(params(5, 4, 1)).unwrap();
    let missing = tx(1, &[1]);
    let child = tx_with_deps(2, &[2], &[&missing]);
    let err = dag.add(child as Arc<dyn Tx>).unwrap_err();
    assert_eq!(err, ConsensusError::UnknownDependency(id(1)));
    assert_eq!(dag.num_processing(), 0);
}

#[test]
fn test_accepted_dependency_is_satisfied() {
    let mut dag = DagConsensus::new(params(5, 4, 1)).unwrap();
    let parent = tx(1, &[1]);
    parent.accept().unwrap();
    let child = tx_with_deps(2, &[2], &[&parent]);
    add(&mut dag, &child);

    let applied = dag.record_poll(&poll(0, 5, &[(child.id(), 4)]), &[child.id()]).unwrap();
    assert_eq!(applied.accepted(), vec![child.id()]);
}

#[test]
fn test_already_issued() {
    let mut dag = DagConsensus::new(params(5, 4, 1)).unwrap();
    let a = tx(1, &[1]);
    add(&mut dag, &a);
    let err = dag.add(Arc::clone(&a) as Arc<dyn Tx>).unwrap_err();
    assert_eq!(err, ConsensusError::AlreadyIssued(a.id()));
}

#[test]
fn test_externally_rejected_winner_does_not_block_rival() {
    let mut dag = DagConsensus::new(params(5, 4, 1)).unwrap();
    let a = tx(1, &[1]);
    let b = tx(2, &[1]);
    add(&mut dag, &a);
    add(&mut dag, &b);

    // The VM rejected `a` behind consensus' back
    a.reject().unwrap();

    let applied = dag.record_poll(&poll(0, 5, &[(a.id(), 4)]), &[a.id()]).unwrap();
    assert_eq!(applied.errors.len(), 1);
    assert!(matches!(applied.errors[0], ConsensusError::InvalidTransition(_)));
    assert_eq!(applied.rejected(), vec![a.id()]);
    assert_eq!(b.status(), Status::Processing);

    let set = dag.conflict_set_of(&b.id()).unwrap();
    assert_eq!(dag.preference(set).unwrap(), b.id());
    dag.verify().unwrap();
}

#[test]
fn test_vm_failure_is_reported_but_decision_holds() {
    let mut dag = DagConsensus::new(params(5, 4, 1)).unwrap();
    let a = tx(1, &[1]);
    a.decidable.fail_accept("disk full");
    add(&mut dag, &a);

    let applied = dag.record_poll(&poll(0, 5, &[(a.id(), 4)]), &[a.id()]).unwrap();
    assert_eq!(applied.accepted(), vec![a.id()]);
    assert_eq!(applied.errors.len(), 1);
    assert_eq!(dag.status_of(&a.id()), Status::Accepted);
}

#[test]
fn test_accept_is_idempotent() {
    let mut dag = DagConsensus::new(params(5, 4, 1)).unwrap();
    let a = tx(1, &[1]);
    add(&mut dag, &a);
    dag.record_poll(&poll(0, 5, &[(a.id(), 4)]), &[a.id()]).unwrap();

    assert!(a.accept().is_ok());
    assert_eq!(a.decidable.accept_count(), 1);
    assert_eq!(a.status(), Status::Accepted);
}

#[test]
fn test_stale_poll_is_dropped() {
    let mut dag = DagConsensus::new(params(5, 4, 10)).unwrap();
    let a = tx(1, &[1]);
    let b = tx(2, &[1]);
    add(&mut dag, &a);
    add(&mut dag, &b);

    dag.record_poll(&poll(5, 5, &[(a.id(), 4)]), &[a.id()]).unwrap();
    dag.record_poll(&poll(3, 5, &[(b.id(), 4)]), &[b.id()]).unwrap();

    let set = dag.conflict_set_of(&a.id()).unwrap();
    let snowball = dag.snowball(set).unwrap();
    assert_eq!(snowball.preference(), a.id());
    assert_eq!(snowball.successes(), 1);
}

#[test]
fn test_record_set_poll_reports_transition() {
    let mut dag = DagConsensus::new(params(5, 4, 10)).unwrap();
    let a = tx(1, &[1]);
    let b = tx(2, &[1]);
    add(&mut dag, &a);
    add(&mut dag, &b);
    let set = dag.conflict_set_of(&a.id()).unwrap();

    let mut tally = Bag::new();
    tally.add_count(b.id(), 4);
    // Votes for unrelated IDs are ignored
    tally.add_count(id(77), 5);
    let (outcome, applied) = dag.record_set_poll(set, 0, &tally, 5).unwrap();
    assert_eq!(outcome.transition, Transition::QuorumNewChoice);
    assert_eq!(outcome.preference, b.id());
    assert!(!outcome.finalized);
    assert!(applied.is_empty());
}

#[test]
fn test_votes_for_prefers_set_preference() {
    let mut dag = DagConsensus::new(params(5, 4, 10)).unwrap();
    let a = tx(1, &[1]);
    let b = tx(2, &[1]);
    add(&mut dag, &a);
    add(&mut dag, &b);

    assert_eq!(dag.votes_for(&[a.id(), b.id()]), vec![a.id()]);
    assert!(dag.votes_for(&[id(99)]).is_empty());
}

#[test]
fn test_safety_at_most_one_accepted_per_set() {
    let mut dag = DagConsensus::new(params(5, 3, 2)).unwrap();
    let members: Vec<Arc<TestTx>> = (1..=4).map(|n| tx(n, &[1])).collect();
    for member in &members {
        add(&mut dag, member);
    }

    // Alternate quorums between members until something is decided
    let mut seq = 0;
    while dag.num_processing() > 0 && seq < 100 {
        let leader = &members[(seq as usize / 3) % members.len()];
        dag.record_poll(&poll(seq, 5, &[(leader.id(), 3)]), &[leader.id()])
            .unwrap();
        dag.verify().unwrap();
        seq += 1;
    }

    let accepted = members
        .iter()
        .filter(|m| m.status() == Status::Accepted)
        .count();
    assert_eq!(accepted, 1);
    assert!(members.iter().all(|m| m.status().decided()));
}

#[test]
fn test_votes_for_decided_candidates() {
    let mut dag = DagConsensus::new(params(5, 4, 1)).unwrap();
    let a = tx(1, &[1]);
    let b = tx(2, &[1]);
    add(&mut dag, &a);
    add(&mut dag, &b);
    dag.record_poll(&poll(0, 5, &[(b.id(), 4)]), &[a.id()]).unwrap();
    assert_eq!(b.status(), Status::Accepted);

    // A rejected candidate is answered with the rival that beat it
    assert_eq!(dag.votes_for(&[a.id()]), vec![b.id()]);
    assert_eq!(dag.votes_for(&[a.id(), b.id()]), vec![b.id()]);

    let late = tx(3, &[1]);
    add(&mut dag, &late);
    assert_eq!(dag.votes_for(&[late.id()]), vec![b.id()]);
}
