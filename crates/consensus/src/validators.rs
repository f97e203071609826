//! Validator set and stake-weighted sampling.
//!
//! A poll queries `k` validator slots drawn with replacement, each draw
//! proportional to stake weight. The same validator can fill several slots;
//! its response then counts with that multiplicity.

use std::collections::HashSet;

use glacier_types::{Bag, Id, NodeId};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ConsensusError, ConsensusResult};

/// Domain separator for sampler seed derivation
const SAMPLER_DOMAIN: &[u8] = b"GLACIER_SAMPLER_V1";

/// A validator and its sampling weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Node identifier
    pub node_id: NodeId,
    /// Stake weight; zero-weight validators are never sampled
    pub weight: u64,
}

impl Validator {
    /// Create a new validator
    pub fn new(node_id: NodeId, weight: u64) -> Self {
        Self { node_id, weight }
    }
}

/// Set of validators eligible for sampling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorSet {
    /// Validators in insertion order, one entry per node
    validators: Vec<Validator>,
    /// Total weight across all validators
    total_weight: u64,
}

impl ValidatorSet {
    /// Create a validator set; later duplicates of a node ID are dropped
    pub fn new(validators: Vec<Validator>) -> Self {
        let mut seen = HashSet::new();
        let validators: Vec<Validator> = validators
            .into_iter()
            .filter(|v| seen.insert(v.node_id))
            .collect();
        let total_weight = validators
            .iter()
            .fold(0u64, |total, v| total.saturating_add(v.weight));
        Self {
            validators,
            total_weight,
        }
    }

    /// `n` validators with IDs `1..=n` and equal weight
    pub fn uniform(n: u64, weight: u64) -> Self {
        Self::new(
            (1..=n)
                .map(|i| Validator::new(NodeId::from_u64(i), weight))
                .collect(),
        )
    }

    /// Total weight across all validators
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Weight of `node_id`, zero if absent
    pub fn weight(&self, node_id: &NodeId) -> u64 {
        self.get(node_id).map(|v| v.weight).unwrap_or(0)
    }

    /// Look up a validator
    pub fn get(&self, node_id: &NodeId) -> Option<&Validator> {
        self.validators.iter().find(|v| &v.node_id == node_id)
    }

    /// Whether `node_id` is a validator
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.get(node_id).is_some()
    }

    /// Number of validators
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Iterate over validators
    pub fn iter(&self) -> impl Iterator<Item = &Validator> + '_ {
        self.validators.iter()
    }

    /// Node IDs of all validators
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.validators.iter().map(|v| v.node_id).collect()
    }
}

/// Source of validator samples for polls
pub trait Sampler: Send + Sync {
    /// Draw `k` validator slots; the bag's total size is `k`
    fn sample(&self, k: usize) -> ConsensusResult<Bag<NodeId>>;
}

/// Stake-weighted sampler with replacement.
///
/// Draws use a cumulative weight table and binary search. The local node is
/// excluded so a node never queries itself.
pub struct WeightedSampler {
    /// Cumulative weight upper bounds paired with the owning node
    cumulative: Vec<(u64, NodeId)>,
    /// Sum of sampleable weight
    total_weight: u64,
    /// Deterministic RNG
    rng: Mutex<ChaCha20Rng>,
}

impl WeightedSampler {
    /// Create a sampler over `validators`, skipping `local` if given
    pub fn new(validators: &ValidatorSet, local: Option<NodeId>, seed: u64) -> Self {
        let mut cumulative = Vec::with_capacity(validators.len());
        let mut total_weight = 0u64;
        for validator in validators.iter() {
            if validator.weight == 0 || Some(validator.node_id) == local {
                continue;
            }
            total_weight = total_weight.saturating_add(validator.weight);
            cumulative.push((total_weight, validator.node_id));
        }
        Self {
            cumulative,
            total_weight,
            rng: Mutex::new(Self::create_rng(seed, local)),
        }
    }

    /// Weight available for sampling
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Number of distinct validators that can be drawn
    pub fn len(&self) -> usize {
        self.cumulative.len()
    }

    /// Whether no validator can be drawn
    pub fn is_empty(&self) -> bool {
        self.cumulative.is_empty()
    }

    fn create_rng(seed: u64, local: Option<NodeId>) -> ChaCha20Rng {
        let mut material = Vec::with_capacity(SAMPLER_DOMAIN.len() + 8 + 20);
        material.extend_from_slice(SAMPLER_DOMAIN);
        material.extend_from_slice(&seed.to_be_bytes());
        if let Some(node) = local {
            material.extend_from_slice(node.as_bytes());
        }
        let mut seed_bytes = [0u8; 32];
        seed_bytes.copy_from_slice(Id::keccak256(&material).as_bytes());
        ChaCha20Rng::from_seed(seed_bytes)
    }

    fn draw(&self, rng: &mut ChaCha20Rng) -> Option<NodeId> {
        let target = rng.gen_range(0..self.total_weight);
        let idx = self
            .cumulative
            .partition_point(|(upper, _)| *upper <= target);
        self.cumulative.get(idx).map(|(_, node)| *node)
    }
}

impl Sampler for WeightedSampler {
    fn sample(&self, k: usize) -> ConsensusResult<Bag<NodeId>> {
        if self.total_weight == 0 {
            return Err(ConsensusError::InsufficientValidators);
        }
        let mut rng = self.rng.lock();
        let mut sample = Bag::new();
        for _ in 0..k {
            let node = self
                .draw(&mut rng)
                .ok_or(ConsensusError::InsufficientValidators)?;
            sample.add(node);
        }
        trace!(k, distinct = sample.distinct(), "Sampled validators");
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_validators_dropped() {
        let node = NodeId::from_u64(1);
        let set = ValidatorSet::new(vec![Validator::new(node, 5), Validator::new(node, 7)]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.total_weight(), 5);
    }

    #[test]
    fn test_sample_size_is_k() {
        let set = ValidatorSet::uniform(10, 1);
        let sampler = WeightedSampler::new(&set, None, 7);
        assert_eq!(sampler.sample(20).unwrap().len(), 20);
    }

    #[test]
    fn test_empty_set_cannot_sample() {
        let sampler = WeightedSampler::new(&ValidatorSet::default(), None, 0);
        assert_eq!(
            sampler.sample(1).unwrap_err(),
            ConsensusError::InsufficientValidators
        );
    }
}
