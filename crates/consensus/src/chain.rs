//! Linear chain consensus.
//!
//! Processing blocks form a tree rooted at the last accepted block. Every
//! node with children owns a [`Snowball`] choosing among those children, so
//! siblings are the implicit conflict set. A vote for a block counts for its
//! whole ancestor path back to the root.
//!
//! Applying a poll walks down from the root: at each node the children are
//! tallied, the child holding the quorum is followed, and every other subtree
//! has its confidence reset. When the root's snowball finalizes, its preferred
//! child is accepted, the sibling subtrees are rejected and the child becomes
//! the new root. This repeats, so one poll can accept a long stretch of chain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use glacier_types::{Bag, Block, Id, Status};
use tracing::{debug, info, trace, warn};

use crate::consensus::{decide, Applied, Consensus, Decision};
use crate::decisions::DecisionCache;
use crate::error::{ConsensusError, ConsensusResult};
use crate::parameters::Parameters;
use crate::poll::{Ballot, PollResult};
use crate::snowball::{Snowball, Thresholds, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlockHandle(usize);

struct BlockNode {
    id: Id,
    height: u64,
    /// `None` only for the initial root, which is accepted before tracking
    block: Option<Arc<dyn Block>>,
    parent: Option<BlockHandle>,
    children: Vec<BlockHandle>,
    /// Present exactly when `children` is non-empty
    snowball: Option<Snowball>,
}

/// Snowball consensus over a tree of blocks
pub struct ChainConsensus {
    params: Parameters,
    nodes: Vec<Option<BlockNode>>,
    free: Vec<usize>,
    by_id: HashMap<Id, BlockHandle>,
    root: BlockHandle,
    decisions: DecisionCache,
}

impl ChainConsensus {
    /// Start from the last accepted block
    pub fn new(params: Parameters, last_accepted: Id, height: u64) -> ConsensusResult<Self> {
        params.verify()?;
        let mut decisions = DecisionCache::new(params.decision_cache_size);
        decisions.record(last_accepted, Status::Accepted);
        let mut by_id = HashMap::new();
        by_id.insert(last_accepted, BlockHandle(0));
        Ok(Self {
            params,
            nodes: vec![Some(BlockNode {
                id: last_accepted,
                height,
                block: None,
                parent: None,
                children: Vec::new(),
                snowball: None,
            })],
            free: Vec::new(),
            by_id,
            root: BlockHandle(0),
            decisions,
        })
    }

    /// ID of the last accepted block
    pub fn last_accepted(&self) -> Id {
        self.node(self.root).map(|n| n.id).unwrap_or(Id::EMPTY)
    }

    /// Height of the last accepted block
    pub fn last_accepted_height(&self) -> u64 {
        self.node(self.root).map(|n| n.height).unwrap_or(0)
    }

    /// Issue a block on top of a processing block or the last accepted one.
    ///
    /// A block whose parent was rejected, or whose height is not above the
    /// last accepted block, is rejected immediately. Any other unknown parent
    /// fails with [`ConsensusError::UnknownDependency`].
    pub fn add_block(&mut self, block: Arc<dyn Block>) -> ConsensusResult<Applied> {
        let id = block.id();
        if self.by_id.contains_key(&id) || self.decisions.get(&id).is_some() {
            return Err(ConsensusError::AlreadyIssued(id));
        }
        let mut applied = Applied::default();
        let status = block.status();
        if status.decided() {
            self.decisions.record(id, status);
            return Ok(applied);
        }

        let parent_id = block.parent();
        let Some(parent) = self.by_id.get(&parent_id).copied() else {
            if self.decisions.is_rejected(&parent_id)
                || block.height() <= self.last_accepted_height()
            {
                debug!(
                    block = %id.short(),
                    parent = %parent_id.short(),
                    height = block.height(),
                    "Rejecting block that cannot extend the accepted chain"
                );
                let status = decide(&*block, Status::Rejected, &mut applied);
                self.decisions.record(id, status);
                applied.decisions.push(Decision { id, status });
                return Ok(applied);
            }
            return Err(ConsensusError::UnknownDependency(parent_id));
        };

        let parent_height = self.node(parent).map(|n| n.height).unwrap_or(0);
        if block.height() != parent_height + 1 {
            warn!(
                block = %id.short(),
                height = block.height(),
                parent_height,
                "Block height does not follow its parent"
            );
        }

        let handle = self.alloc(BlockNode {
            id,
            height: block.height(),
            block: Some(block),
            parent: Some(parent),
            children: Vec::new(),
            snowball: None,
        });
        if let Some(parent_node) = self.node_mut(parent) {
            parent_node.children.push(handle);
            parent_node.snowball.get_or_insert_with(|| Snowball::new(id));
        }
        self.by_id.insert(id, handle);

        debug!(
            block = %id.short(),
            parent = %parent_id.short(),
            processing = self.num_processing(),
            "Issued block"
        );
        Ok(applied)
    }

    /// Tip of the preferred chain; the last accepted block if none is processing
    pub fn preference(&self) -> Id {
        let mut cursor = self.root;
        while let Some(next) = self.preferred_child(cursor) {
            cursor = next;
        }
        self.node(cursor).map(|n| n.id).unwrap_or(Id::EMPTY)
    }

    /// Whether `id` lies on the preferred chain (the last accepted block included)
    pub fn is_preferred(&self, id: &Id) -> bool {
        let mut cursor = Some(self.root);
        while let Some(handle) = cursor {
            if self.node(handle).map(|n| &n.id) == Some(id) {
                return true;
            }
            cursor = self.preferred_child(handle);
        }
        false
    }

    /// Snowball state choosing among the children of `id`
    pub fn snowball(&self, id: &Id) -> Option<&Snowball> {
        let handle = self.by_id.get(id)?;
        self.node(*handle)?.snowball.as_ref()
    }

    fn preferred_child(&self, handle: BlockHandle) -> Option<BlockHandle> {
        let preference = self.node(handle)?.snowball.as_ref()?.preference();
        self.by_id.get(&preference).copied()
    }

    /// Weight each tracked block receives once votes count for ancestors.
    ///
    /// A validator naming several blocks on one path still adds its weight
    /// to each block at most once.
    fn transitive_votes(&self, ballots: &[Ballot]) -> HashMap<BlockHandle, u64> {
        let mut votes: HashMap<BlockHandle, u64> = HashMap::new();
        let mut endorsed: HashSet<BlockHandle> = HashSet::new();
        for ballot in ballots {
            endorsed.clear();
            for id in &ballot.choices {
                let mut cursor = self.by_id.get(id).copied();
                while let Some(handle) = cursor {
                    if handle == self.root || !endorsed.insert(handle) {
                        break;
                    }
                    cursor = self.node(handle).and_then(|n| n.parent);
                }
            }
            for handle in &endorsed {
                *votes.entry(*handle).or_insert(0) += ballot.weight;
            }
        }
        votes
    }

    fn apply_votes(&mut self, seq: u64, votes: &HashMap<BlockHandle, u64>) -> ConsensusResult<()> {
        let thresholds = Thresholds::new(self.params.alpha, self.params.beta);
        let mut cursor = Some(self.root);
        while let Some(handle) = cursor {
            cursor = None;
            let Some(node) = self.node(handle) else {
                break;
            };
            let children = node.children.clone();
            if children.is_empty() {
                break;
            }
            let mut tally = Bag::new();
            for child in &children {
                if let Some(child_node) = self.node(*child) {
                    tally.add_count(child_node.id, votes.get(child).copied().unwrap_or(0));
                }
            }

            let Some(snowball) = self.node_mut(handle).and_then(|n| n.snowball.as_mut()) else {
                return Err(ConsensusError::InvariantViolation(
                    "block with children has no snowball".to_string(),
                ));
            };
            let outcome = snowball.record_poll(seq, &tally, thresholds)?;
            trace!(
                seq,
                transition = %outcome.transition,
                preference = %outcome.preference.short(),
                successes = outcome.successes,
                "Recorded block poll"
            );

            let chosen = match outcome.transition {
                Transition::NoQuorum => None,
                _ => self.by_id.get(&outcome.preference).copied(),
            };
            for child in children {
                if Some(child) != chosen {
                    self.reset_subtree(child, seq);
                }
            }
            cursor = chosen;
        }
        Ok(())
    }

    fn reset_subtree(&mut self, start: BlockHandle, seq: u64) {
        let mut stack = vec![start];
        while let Some(handle) = stack.pop() {
            let Some(node) = self.node_mut(handle) else {
                continue;
            };
            if let Some(snowball) = node.snowball.as_mut() {
                let _ = snowball.record_unsuccessful_poll(seq);
            }
            stack.extend(node.children.iter().copied());
        }
    }

    /// Accept finalized children of the root until the root is undecided
    fn finalize(&mut self, applied: &mut Applied) -> ConsensusResult<()> {
        loop {
            let Some(root) = self.node(self.root) else {
                return Err(ConsensusError::InvariantViolation(
                    "chain root is not tracked".to_string(),
                ));
            };
            let preference = match root.snowball.as_ref() {
                Some(snowball) if snowball.finalized() => snowball.preference(),
                _ => return Ok(()),
            };
            let child = self.by_id.get(&preference).copied().ok_or_else(|| {
                ConsensusError::InvariantViolation(format!(
                    "finalized preference {} is not tracked",
                    preference
                ))
            })?;
            let siblings: Vec<BlockHandle> = root
                .children
                .iter()
                .copied()
                .filter(|sibling| *sibling != child)
                .collect();

            let Some(block) = self.node(child).and_then(|n| n.block.clone()) else {
                return Err(ConsensusError::InvariantViolation(format!(
                    "processing block {} has no payload",
                    preference
                )));
            };
            if decide(&*block, Status::Accepted, applied) != Status::Accepted {
                self.reject_subtree(child, applied)?;
                continue;
            }
            for sibling in siblings {
                self.reject_subtree(sibling, applied)?;
            }

            let old_root = self.root;
            self.release(old_root);
            if let Some(node) = self.node_mut(child) {
                node.parent = None;
            }
            self.root = child;
            self.decisions.record(preference, Status::Accepted);
            applied.decisions.push(Decision {
                id: preference,
                status: Status::Accepted,
            });
            info!(
                block = %preference.short(),
                height = block.height(),
                "Accepted block"
            );
        }
    }

    /// Reject `start` and all its descendants and detach it from its parent
    fn reject_subtree(&mut self, start: BlockHandle, applied: &mut Applied) -> ConsensusResult<()> {
        if let Some(parent) = self.node(start).and_then(|n| n.parent) {
            self.detach(parent, start);
        }
        let mut stack = vec![start];
        while let Some(handle) = stack.pop() {
            let Some(node) = self.release(handle) else {
                continue;
            };
            stack.extend(node.children.iter().copied());
            if let Some(block) = node.block.as_ref() {
                if decide(&**block, Status::Rejected, applied) == Status::Accepted {
                    return Err(ConsensusError::InvariantViolation(format!(
                        "{} was accepted while consensus rejected it",
                        node.id
                    )));
                }
            }
            self.decisions.record(node.id, Status::Rejected);
            applied.decisions.push(Decision {
                id: node.id,
                status: Status::Rejected,
            });
            debug!(block = %node.id.short(), "Rejected block");
        }
        Ok(())
    }

    fn detach(&mut self, parent: BlockHandle, child: BlockHandle) {
        let child_id = self.node(child).map(|n| n.id);
        let Some(parent_node) = self.node_mut(parent) else {
            return;
        };
        parent_node.children.retain(|c| *c != child);
        let next = parent_node.children.first().copied();
        let preferred = parent_node.snowball.as_ref().map(|s| s.preference());
        if next.is_none() {
            parent_node.snowball = None;
            return;
        }
        if preferred != child_id {
            return;
        }
        let next_id = next.and_then(|h| self.node(h)).map(|n| n.id);
        if let (Some(next_id), Some(snowball)) = (
            next_id,
            self.node_mut(parent).and_then(|n| n.snowball.as_mut()),
        ) {
            snowball.reset_preference(next_id);
        }
    }

    fn node(&self, handle: BlockHandle) -> Option<&BlockNode> {
        self.nodes.get(handle.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, handle: BlockHandle) -> Option<&mut BlockNode> {
        self.nodes.get_mut(handle.0).and_then(Option::as_mut)
    }

    fn alloc(&mut self, node: BlockNode) -> BlockHandle {
        match self.free.pop() {
            Some(index) => {
                self.nodes[index] = Some(node);
                BlockHandle(index)
            }
            None => {
                self.nodes.push(Some(node));
                BlockHandle(self.nodes.len() - 1)
            }
        }
    }

    fn release(&mut self, handle: BlockHandle) -> Option<BlockNode> {
        let node = self.nodes.get_mut(handle.0)?.take()?;
        self.by_id.remove(&node.id);
        self.free.push(handle.0);
        Some(node)
    }
}

impl Consensus for ChainConsensus {
    type Item = dyn Block;

    fn parameters(&self) -> &Parameters {
        &self.params
    }

    fn add(&mut self, item: Arc<dyn Block>) -> ConsensusResult<Applied> {
        self.add_block(item)
    }

    fn record_poll(&mut self, result: &PollResult, _candidates: &[Id]) -> ConsensusResult<Applied> {
        let mut applied = Applied::default();
        if self.num_processing() == 0 {
            return Ok(applied);
        }
        let votes = self.transitive_votes(&result.ballots);
        match self.apply_votes(result.seq, &votes) {
            Ok(()) => {}
            Err(ConsensusError::StalePoll { seq, last }) => {
                warn!(seq, last, "Dropping stale poll result");
                return Ok(applied);
            }
            Err(err) => return Err(err),
        }
        self.finalize(&mut applied)?;
        Ok(applied)
    }

    fn preferences(&self) -> Vec<Id> {
        if self.num_processing() == 0 {
            return Vec::new();
        }
        vec![self.preference()]
    }

    fn preference(&self) -> Option<Id> {
        Some(ChainConsensus::preference(self))
    }

    fn votes_for(&self, _candidates: &[Id]) -> Vec<Id> {
        vec![self.preference()]
    }

    fn status_of(&self, id: &Id) -> Status {
        match self.by_id.get(id) {
            Some(handle) if *handle == self.root => Status::Accepted,
            Some(_) => Status::Processing,
            None => self.decisions.get(id).unwrap_or(Status::Unknown),
        }
    }

    fn num_processing(&self) -> usize {
        self.by_id.len().saturating_sub(1)
    }

    fn verify(&self) -> ConsensusResult<()> {
        for (id, handle) in &self.by_id {
            let node = self.node(*handle).ok_or_else(|| {
                ConsensusError::InvariantViolation(format!("{} indexed without a node", id))
            })?;
            if *handle != self.root {
                let attached = node
                    .parent
                    .and_then(|p| self.node(p))
                    .map(|p| p.children.contains(handle))
                    .unwrap_or(false);
                if !attached {
                    return Err(ConsensusError::InvariantViolation(format!(
                        "{} is not attached to a tracked parent",
                        id
                    )));
                }
            }
            match (&node.snowball, node.children.is_empty()) {
                (None, true) => {}
                (Some(snowball), false) => {
                    let preferred = node
                        .children
                        .iter()
                        .filter_map(|c| self.node(*c))
                        .any(|c| c.id == snowball.preference());
                    if !preferred {
                        return Err(ConsensusError::InvariantViolation(format!(
                            "preference of {} is not one of its children",
                            id
                        )));
                    }
                }
                _ => {
                    return Err(ConsensusError::InvariantViolation(format!(
                        "{} has inconsistent children and snowball",
                        id
                    )))
                }
            }
        }
        Ok(())
    }
}
