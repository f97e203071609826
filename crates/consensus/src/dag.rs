//! Conflict-set resolver for DAG-ordered transactions.
//!
//! Transactions that spend a common input form a conflict set; at most one
//! member of a set can ever be accepted. Each set carries a [`Snowball`]
//! instance choosing among its members. Sets only grow: a transaction
//! touching several existing sets merges them into the largest one.
//!
//! ## Decisions
//!
//! - A set whose snowball finalizes picks its preferred member as the winner.
//! - A winner is accepted once every dependency is accepted; until then it is
//!   parked and accepted as soon as its last pending dependency is.
//! - Accepting a transaction rejects every other member of its set.
//! - Rejecting a transaction rejects every transaction depending on it.
//!
//! A singleton set that receives a unanimous poll is finalized at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use glacier_types::{Bag, Id, Status, Tx};
use tracing::{debug, trace, warn};

use crate::consensus::{decide, Applied, Consensus, Decision};
use crate::decisions::DecisionCache;
use crate::error::{ConsensusError, ConsensusResult};
use crate::parameters::Parameters;
use crate::poll::PollResult;
use crate::snowball::{PollOutcome, Snowball, Thresholds};

/// Handle to a live conflict set.
///
/// Handles are never reused: once a set is decided or merged away its handle
/// stays invalid even if the slot is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConflictSetId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ConflictSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cs{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TxHandle(usize);

struct TxNode {
    id: Id,
    tx: Arc<dyn Tx>,
    inputs: Vec<Id>,
    set: ConflictSetId,
    /// Processing dependencies not yet accepted
    pending_deps: HashSet<TxHandle>,
    /// Processing transactions that depend on this one
    dependents: Vec<TxHandle>,
    /// Won its conflict set; waiting for dependencies
    parked: bool,
}

struct ConflictSet {
    members: Vec<TxHandle>,
    inputs: HashSet<Id>,
    snowball: Snowball,
}

struct SetSlot {
    generation: u32,
    set: Option<ConflictSet>,
}

/// Snowball consensus over conflicting transactions
pub struct DagConsensus {
    params: Parameters,
    txs: Vec<Option<TxNode>>,
    free_txs: Vec<usize>,
    sets: Vec<SetSlot>,
    free_sets: Vec<u32>,
    by_id: HashMap<Id, TxHandle>,
    by_input: HashMap<Id, ConflictSetId>,
    /// Inputs consumed by accepted transactions, with the spender.
    ///
    /// Never pruned: one entry per accepted input for the life of the
    /// instance. Forgetting an entry would let a later double spend through.
    spent: HashMap<Id, Id>,
    decisions: DecisionCache,
}

impl DagConsensus {
    /// Create an empty resolver
    pub fn new(params: Parameters) -> ConsensusResult<Self> {
        params.verify()?;
        Ok(Self {
            params,
            txs: Vec::new(),
            free_txs: Vec::new(),
            sets: Vec::new(),
            free_sets: Vec::new(),
            by_id: HashMap::new(),
            by_input: HashMap::new(),
            spent: HashMap::new(),
            decisions: DecisionCache::new(params.decision_cache_size),
        })
    }

    /// Issue a transaction into its conflict set.
    ///
    /// Fails with [`ConsensusError::UnknownDependency`] if a dependency is
    /// neither decided nor processing. A transaction with a rejected
    /// dependency, or spending an input an accepted transaction spent, is
    /// rejected immediately.
    pub fn add_tx(&mut self, tx: Arc<dyn Tx>) -> ConsensusResult<Applied> {
        let id = tx.id();
        if self.by_id.contains_key(&id) || self.decisions.get(&id).is_some() {
            return Err(ConsensusError::AlreadyIssued(id));
        }
        let mut applied = Applied::default();
        let status = tx.status();
        if status.decided() {
            self.decisions.record(id, status);
            return Ok(applied);
        }

        let mut pending_deps = HashSet::new();
        let mut doomed_by = None;
        for dep in tx.dependencies() {
            let dep_id = dep.id();
            match self.decisions.get(&dep_id).unwrap_or_else(|| dep.status()) {
                Status::Accepted => {}
                Status::Rejected => {
                    doomed_by = Some(dep_id);
                    break;
                }
                _ => match self.by_id.get(&dep_id) {
                    Some(handle) => {
                        pending_deps.insert(*handle);
                    }
                    None => return Err(ConsensusError::UnknownDependency(dep_id)),
                },
            }
        }

        let mut inputs = tx.input_ids();
        inputs.sort_unstable();
        inputs.dedup();
        let spender = inputs.iter().find_map(|input| self.spent.get(input)).copied();
        if let Some(cause) = doomed_by.or(spender) {
            debug!(tx = %id.short(), cause = %cause.short(), "Rejecting transaction on issue");
            let status = decide(&*tx, Status::Rejected, &mut applied);
            self.decisions.record(id, status);
            if let Some(winner) = spender {
                self.decisions.record_winner(id, winner);
            }
            applied.decisions.push(Decision { id, status });
            return Ok(applied);
        }

        let mut touched: Vec<ConflictSetId> = Vec::new();
        for input in &inputs {
            if let Some(set) = self.by_input.get(input) {
                if !touched.contains(set) {
                    touched.push(*set);
                }
            }
        }

        let handle = self.alloc_tx(TxNode {
            id,
            tx,
            inputs: inputs.clone(),
            set: ConflictSetId {
                index: u32::MAX,
                generation: 0,
            },
            pending_deps: pending_deps.clone(),
            dependents: Vec::new(),
            parked: false,
        });

        let set_id = if touched.is_empty() {
            self.alloc_set(ConflictSet {
                members: vec![handle],
                inputs: inputs.iter().copied().collect(),
                snowball: Snowball::new(id),
            })
        } else {
            let target = self.merge_sets(&touched)?;
            let set = self.set_mut(target).ok_or_else(|| missing_set(target))?;
            set.members.push(handle);
            set.inputs.extend(inputs.iter().copied());
            target
        };
        for input in &inputs {
            self.by_input.insert(*input, set_id);
        }
        if let Some(node) = self.node_mut(handle) {
            node.set = set_id;
        }
        for dep in pending_deps {
            if let Some(node) = self.node_mut(dep) {
                node.dependents.push(handle);
            }
        }
        self.by_id.insert(id, handle);

        debug!(
            tx = %id.short(),
            set = %set_id,
            virtuous = touched.is_empty(),
            "Issued transaction"
        );
        Ok(applied)
    }

    /// Conflict set containing `id`, if it is processing
    pub fn conflict_set_of(&self, id: &Id) -> Option<ConflictSetId> {
        let handle = self.by_id.get(id)?;
        self.node(*handle).map(|node| node.set)
    }

    /// Preferred member of a conflict set
    pub fn preference(&self, set: ConflictSetId) -> ConsensusResult<Id> {
        self.set(set)
            .map(|s| s.snowball.preference())
            .ok_or_else(|| missing_set(set))
    }

    /// Snowball state of a conflict set
    pub fn snowball(&self, set: ConflictSetId) -> Option<&Snowball> {
        self.set(set).map(|s| &s.snowball)
    }

    /// Processing transactions sharing a conflict set with `id`
    pub fn conflicts(&self, id: &Id) -> Vec<Id> {
        let Some(set) = self.conflict_set_of(id).and_then(|s| self.set(s)) else {
            return Vec::new();
        };
        set.members
            .iter()
            .filter_map(|h| self.node(*h))
            .map(|node| node.id)
            .filter(|member| member != id)
            .collect()
    }

    /// Number of inputs spent by accepted transactions
    pub fn num_spent_inputs(&self) -> usize {
        self.spent.len()
    }

    /// Whether `id` is processing and alone in its conflict set
    pub fn is_virtuous(&self, id: &Id) -> bool {
        self.conflict_set_of(id)
            .and_then(|s| self.set(s))
            .map(|set| set.members.len() == 1)
            .unwrap_or(false)
    }

    /// Number of live conflict sets
    pub fn num_conflict_sets(&self) -> usize {
        self.sets.iter().filter(|slot| slot.set.is_some()).count()
    }

    /// Apply a poll tally to one conflict set.
    ///
    /// Only weight cast for members of the set counts. If the set finalizes,
    /// its winner is accepted (or parked on its dependencies) and the effects
    /// are returned alongside the snowball outcome.
    pub fn record_set_poll(
        &mut self,
        set_id: ConflictSetId,
        seq: u64,
        tally: &Bag<Id>,
        sample_weight: u64,
    ) -> ConsensusResult<(PollOutcome, Applied)> {
        let set = self.set(set_id).ok_or_else(|| missing_set(set_id))?;
        let members: Vec<Id> = set
            .members
            .iter()
            .filter_map(|h| self.node(*h))
            .map(|node| node.id)
            .collect();
        let votes = tally.filter(|id| members.contains(id));

        let mut thresholds = Thresholds::new(self.params.alpha, self.params.beta);
        if let [only] = members.as_slice() {
            if sample_weight > 0 && votes.count(only) == sample_weight {
                thresholds.beta = 1;
            }
        }

        let set = self.set_mut(set_id).ok_or_else(|| missing_set(set_id))?;
        let outcome = set.snowball.record_poll(seq, &votes, thresholds)?;
        trace!(
            set = %set_id,
            seq,
            transition = %outcome.transition,
            preference = %outcome.preference.short(),
            successes = outcome.successes,
            "Recorded conflict set poll"
        );

        let mut applied = Applied::default();
        if outcome.finalized {
            self.finalize_set(set_id, &mut applied)?;
        }
        Ok((outcome, applied))
    }

    fn finalize_set(&mut self, set_id: ConflictSetId, applied: &mut Applied) -> ConsensusResult<()> {
        let winner = self.preference(set_id)?;
        let handle = *self.by_id.get(&winner).ok_or_else(|| {
            ConsensusError::InvariantViolation(format!(
                "preference {} of {} is not processing",
                winner, set_id
            ))
        })?;
        let ready = match self.node_mut(handle) {
            Some(node) => {
                node.parked = true;
                node.pending_deps.is_empty()
            }
            None => false,
        };
        if ready {
            self.accept_cascade(handle, applied)
        } else {
            debug!(tx = %winner.short(), set = %set_id, "Winner parked on dependencies");
            Ok(())
        }
    }

    fn accept_cascade(&mut self, start: TxHandle, applied: &mut Applied) -> ConsensusResult<()> {
        let mut queue = VecDeque::from([start]);
        while let Some(handle) = queue.pop_front() {
            let Some(tx) = self.node(handle).map(|node| Arc::clone(&node.tx)) else {
                continue;
            };
            if decide(&*tx, Status::Accepted, applied) != Status::Accepted {
                self.reject_cascade(handle, applied)?;
                continue;
            }
            let Some(node) = self.free_tx(handle) else {
                continue;
            };
            self.decisions.record(node.id, Status::Accepted);
            applied.decisions.push(Decision {
                id: node.id,
                status: Status::Accepted,
            });
            debug!(tx = %node.id.short(), "Accepted transaction");

            self.spent
                .extend(node.inputs.iter().map(|input| (*input, node.id)));
            if let Some(set) = self.free_set(node.set) {
                for rival in set.members.into_iter().filter(|h| *h != handle) {
                    let rival_id = self.node(rival).map(|n| n.id);
                    self.reject_cascade(rival, applied)?;
                    if let Some(rival_id) = rival_id {
                        self.decisions.record_winner(rival_id, node.id);
                    }
                }
            }
            for dependent in node.dependents {
                if let Some(waiting) = self.node_mut(dependent) {
                    waiting.pending_deps.remove(&handle);
                    if waiting.parked && waiting.pending_deps.is_empty() {
                        queue.push_back(dependent);
                    }
                }
            }
        }
        Ok(())
    }

    fn reject_cascade(&mut self, start: TxHandle, applied: &mut Applied) -> ConsensusResult<()> {
        let mut stack = vec![start];
        while let Some(handle) = stack.pop() {
            let Some(node) = self.free_tx(handle) else {
                continue;
            };
            if decide(&*node.tx, Status::Rejected, applied) == Status::Accepted {
                return Err(ConsensusError::InvariantViolation(format!(
                    "{} was accepted while consensus rejected it",
                    node.id
                )));
            }
            self.decisions.record(node.id, Status::Rejected);
            applied.decisions.push(Decision {
                id: node.id,
                status: Status::Rejected,
            });
            debug!(tx = %node.id.short(), "Rejected transaction");

            self.leave_set(node.set, handle, node.id);
            for dep in &node.pending_deps {
                if let Some(dep_node) = self.node_mut(*dep) {
                    dep_node.dependents.retain(|h| *h != handle);
                }
            }
            for dependent in node.dependents {
                if self.node(dependent).is_some() {
                    stack.push(dependent);
                }
            }
        }
        Ok(())
    }

    /// Drop a departed member; inputs no remaining member spends are released
    fn leave_set(&mut self, set_id: ConflictSetId, handle: TxHandle, id: Id) {
        let remaining = match self.set_mut(set_id) {
            Some(set) => {
                set.members.retain(|h| *h != handle);
                set.members.clone()
            }
            None => return,
        };
        if remaining.is_empty() {
            self.free_set(set_id);
            return;
        }

        let still_spent: HashSet<Id> = remaining
            .iter()
            .filter_map(|h| self.node(*h))
            .flat_map(|node| node.inputs.iter().copied())
            .collect();
        let Some(set) = self.set_mut(set_id) else {
            return;
        };
        let released: Vec<Id> = set.inputs.difference(&still_spent).copied().collect();
        set.inputs.retain(|input| still_spent.contains(input));
        let lost_preference = set.snowball.preference() == id;
        for input in &released {
            if self.by_input.get(input) == Some(&set_id) {
                self.by_input.remove(input);
            }
        }
        if !released.is_empty() {
            trace!(set = %set_id, released = released.len(), "Released inputs of departed member");
        }
        if !lost_preference {
            return;
        }

        let next = remaining[0];
        let Some(next_id) = self.node(next).map(|node| node.id) else {
            return;
        };
        if let Some(set) = self.set_mut(set_id) {
            set.snowball.reset_preference(next_id);
        }
        trace!(set = %set_id, preference = %next_id.short(), "Preferred member removed");
    }

    /// Merge `touched` into the set with the most members (ties to the lowest
    /// slot). The merged set keeps that set's preference and the lowest
    /// confidence of all merged sets.
    fn merge_sets(&mut self, touched: &[ConflictSetId]) -> ConsensusResult<ConflictSetId> {
        let mut target = touched[0];
        for candidate in &touched[1..] {
            let (a, b) = (self.set_len(*candidate), self.set_len(target));
            if a > b || (a == b && candidate.index < target.index) {
                target = *candidate;
            }
        }

        for absorbed_id in touched.iter().copied().filter(|id| *id != target) {
            let Some(absorbed) = self.free_set(absorbed_id) else {
                continue;
            };
            for member in &absorbed.members {
                if let Some(node) = self.node_mut(*member) {
                    node.set = target;
                }
            }
            for input in &absorbed.inputs {
                self.by_input.insert(*input, target);
            }
            let set = self.set_mut(target).ok_or_else(|| missing_set(target))?;
            set.members.extend(absorbed.members);
            set.inputs.extend(absorbed.inputs);
            set.snowball.merge(&absorbed.snowball);
            debug!(from = %absorbed_id, into = %target, "Merged conflict sets");
        }

        let set = self.set(target).ok_or_else(|| missing_set(target))?;
        let finalized = set.snowball.finalized();
        let preference = set.snowball.preference();
        let members = set.members.clone();
        for member in members {
            if let Some(node) = self.node_mut(member) {
                node.parked = finalized && node.id == preference;
            }
        }
        Ok(target)
    }

    fn set_len(&self, id: ConflictSetId) -> usize {
        self.set(id).map(|set| set.members.len()).unwrap_or(0)
    }

    fn node(&self, handle: TxHandle) -> Option<&TxNode> {
        self.txs.get(handle.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, handle: TxHandle) -> Option<&mut TxNode> {
        self.txs.get_mut(handle.0).and_then(Option::as_mut)
    }

    fn alloc_tx(&mut self, node: TxNode) -> TxHandle {
        match self.free_txs.pop() {
            Some(index) => {
                self.txs[index] = Some(node);
                TxHandle(index)
            }
            None => {
                self.txs.push(Some(node));
                TxHandle(self.txs.len() - 1)
            }
        }
    }

    fn free_tx(&mut self, handle: TxHandle) -> Option<TxNode> {
        let node = self.txs.get_mut(handle.0)?.take()?;
        self.by_id.remove(&node.id);
        self.free_txs.push(handle.0);
        Some(node)
    }

    fn set(&self, id: ConflictSetId) -> Option<&ConflictSet> {
        self.sets
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.set.as_ref())
    }

    fn set_mut(&mut self, id: ConflictSetId) -> Option<&mut ConflictSet> {
        self.sets
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.set.as_mut())
    }

    fn alloc_set(&mut self, set: ConflictSet) -> ConflictSetId {
        if let Some(index) = self.free_sets.pop() {
            let slot = &mut self.sets[index as usize];
            slot.set = Some(set);
            return ConflictSetId {
                index,
                generation: slot.generation,
            };
        }
        self.sets.push(SetSlot {
            generation: 0,
            set: Some(set),
        });
        ConflictSetId {
            index: (self.sets.len() - 1) as u32,
            generation: 0,
        }
    }

    fn free_set(&mut self, id: ConflictSetId) -> Option<ConflictSet> {
        let slot = self
            .sets
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let set = slot.set.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_sets.push(id.index);
        for input in &set.inputs {
            if self.by_input.get(input) == Some(&id) {
                self.by_input.remove(input);
            }
        }
        Some(set)
    }
}

impl Consensus for DagConsensus {
    type Item = dyn Tx;

    fn parameters(&self) -> &Parameters {
        &self.params
    }

    fn add(&mut self, item: Arc<dyn Tx>) -> ConsensusResult<Applied> {
        self.add_tx(item)
    }

    fn record_poll(&mut self, result: &PollResult, candidates: &[Id]) -> ConsensusResult<Applied> {
        let mut touched: Vec<ConflictSetId> = Vec::new();
        for candidate in candidates {
            if let Some(set) = self.conflict_set_of(candidate) {
                if !touched.contains(&set) {
                    touched.push(set);
                }
            }
        }

        let mut applied = Applied::default();
        for set in touched {
            if self.set(set).is_none() {
                continue;
            }
            match self.record_set_poll(set, result.seq, &result.tally, result.sample_weight) {
                Ok((_, effects)) => applied.extend(effects),
                Err(ConsensusError::StalePoll { seq, last }) => {
                    warn!(set = %set, seq, last, "Dropping stale poll result");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(applied)
    }

    fn preferences(&self) -> Vec<Id> {
        self.sets
            .iter()
            .filter_map(|slot| slot.set.as_ref())
            .filter(|set| !set.snowball.finalized())
            .map(|set| set.snowball.preference())
            .collect()
    }

    fn votes_for(&self, candidates: &[Id]) -> Vec<Id> {
        let mut votes = Vec::new();
        for candidate in candidates {
            let vote = match self.conflict_set_of(candidate) {
                Some(set) => self.preference(set).ok(),
                None => match self.decisions.get(candidate) {
                    Some(Status::Accepted) => Some(*candidate),
                    Some(Status::Rejected) => self.decisions.winner(candidate),
                    _ => None,
                },
            };
            if let Some(vote) = vote {
                if !votes.contains(&vote) {
                    votes.push(vote);
                }
            }
        }
        votes
    }

    fn status_of(&self, id: &Id) -> Status {
        if self.by_id.contains_key(id) {
            return Status::Processing;
        }
        self.decisions.get(id).unwrap_or(Status::Unknown)
    }

    fn num_processing(&self) -> usize {
        self.by_id.len()
    }

    fn verify(&self) -> ConsensusResult<()> {
        for (id, handle) in &self.by_id {
            let node = self.node(*handle).ok_or_else(|| {
                ConsensusError::InvariantViolation(format!("{} indexed without a node", id))
            })?;
            let set = self.set(node.set).ok_or_else(|| {
                ConsensusError::InvariantViolation(format!("{} belongs to dead set {}", id, node.set))
            })?;
            if !set.members.contains(handle) {
                return Err(ConsensusError::InvariantViolation(format!(
                    "{} missing from its set {}",
                    id, node.set
                )));
            }
            if node.pending_deps.iter().any(|dep| self.node(*dep).is_none()) {
                return Err(ConsensusError::InvariantViolation(format!(
                    "{} waits on a dependency that is no longer processing",
                    id
                )));
            }
        }
        for slot in &self.sets {
            let Some(set) = slot.set.as_ref() else {
                continue;
            };
            let preference = set.snowball.preference();
            let preferred_member = set
                .members
                .iter()
                .filter_map(|h| self.node(*h))
                .any(|node| node.id == preference);
            if !preferred_member {
                return Err(ConsensusError::InvariantViolation(format!(
                    "preference {} is not a member of its conflict set",
                    preference
                )));
            }
        }
        Ok(())
    }
}

fn missing_set(id: ConflictSetId) -> ConsensusError {
    ConsensusError::UnknownConflictSet(id.to_string())
}
