//! Tests for stake-weighted validator sampling.

use glacier_consensus::{Sampler, Validator, ValidatorSet, WeightedSampler};
use glacier_types::NodeId;

fn node(n: u64) -> NodeId {
    NodeId::from_u64(n)
}

#[test]
fn test_sample_follows_weights() {
    let set = ValidatorSet::new(vec![
        Validator::new(node(1), 90),
        Validator::new(node(2), 10),
    ]);
    let sampler = WeightedSampler::new(&set, None, 42);
    let sample = sampler.sample(10_000).unwrap();

    assert_eq!(sample.len(), 10_000);
    let heavy = sample.count(&node(1));
    assert!(heavy > 8_500 && heavy < 9_500, "heavy drawn {} times", heavy);
}

#[test]
fn test_zero_weight_never_sampled() {
    let set = ValidatorSet::new(vec![
        Validator::new(node(1), 0),
        Validator::new(node(2), 3),
    ]);
    let sampler = WeightedSampler::new(&set, None, 1);
    assert_eq!(sampler.len(), 1);
    let sample = sampler.sample(50).unwrap();
    assert_eq!(sample.count(&node(2)), 50);
}

#[test]
fn test_local_node_excluded() {
    let set = ValidatorSet::uniform(4, 1);
    let sampler = WeightedSampler::new(&set, Some(node(3)), 9);
    assert_eq!(sampler.total_weight(), 3);

    let sample = sampler.sample(200).unwrap();
    assert!(!sample.contains(&node(3)));
    assert_eq!(sample.distinct(), 3);
}

#[test]
fn test_same_seed_same_samples() {
    let set = ValidatorSet::uniform(20, 1);
    let a = WeightedSampler::new(&set, Some(node(1)), 7);
    let b = WeightedSampler::new(&set, Some(node(1)), 7);
    for _ in 0..5 {
        assert_eq!(a.sample(20).unwrap(), b.sample(20).unwrap());
    }
}

#[test]
fn test_local_node_changes_stream() {
    let set = ValidatorSet::uniform(50, 1);
    let a = WeightedSampler::new(&set, Some(node(1)), 7);
    let b = WeightedSampler::new(&set, Some(node(2)), 7);
    let draws_a: Vec<_> = (0..5).map(|_| a.sample(20).unwrap()).collect();
    let draws_b: Vec<_> = (0..5).map(|_| b.sample(20).unwrap()).collect();
    assert_ne!(draws_a, draws_b);
}

#[test]
fn test_only_local_validator() {
    let set = ValidatorSet::uniform(1, 10);
    let sampler = WeightedSampler::new(&set, Some(node(1)), 0);
    assert!(sampler.is_empty());
    assert!(sampler.sample(1).is_err());
}

#[test]
fn test_validator_set_lookup() {
    let set = ValidatorSet::uniform(3, 5);
    assert_eq!(set.total_weight(), 15);
    assert_eq!(set.weight(&node(2)), 5);
    assert_eq!(set.weight(&node(9)), 0);
    assert!(set.contains(&node(3)));
    assert_eq!(set.node_ids(), vec![node(1), node(2), node(3)]);
}

#[test]
fn test_total_weight_saturates() {
    let set = ValidatorSet::new(vec![
        Validator::new(node(1), u64::MAX),
        Validator::new(node(2), u64::MAX),
    ]);
    assert_eq!(set.total_weight(), u64::MAX);
    assert_eq!(set.len(), 2);
}
