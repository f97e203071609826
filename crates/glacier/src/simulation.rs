//! In-process network simulation.
//!
//! Every simulated validator runs its own [`Engine`] over its own copies of
//! the issued items. Queries travel through a shared outbox; the addressed
//! validators answer with [`Engine::votes_for`]. Delivery is synchronous and
//! seeded, so a run is reproducible from its configuration.
//!
//! ## Rounds
//!
//! 1. Deliver every queued query and its responses; repolls triggered by the
//!    responses are queued for the next round
//! 2. Expire the deadlines of polls still waiting on lost responses
//! 3. Stop once no validator has processing items, or after `max_rounds`

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use glacier_config::{SimulationConfig, SimulationMode};
use glacier_consensus::{
    Applied, ChainConsensus, Consensus, ConsensusError, DagConsensus, Engine, ManualTimer,
    Parameters, Query, Sender, ValidatorSet, WeightedSampler,
};
use glacier_types::testing::{TestBlock, TestTx};
use glacier_types::{Bag, Block, Decidable, Id, NodeId, Status, Tx};
use parking_lot::Mutex;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that end a simulation
#[derive(Debug, Error)]
pub enum SimulationError {
    /// A consensus operation failed
    #[error("consensus error on node {node}: {source}")]
    Consensus {
        /// Index of the failing validator
        node: usize,
        /// Underlying error
        #[source]
        source: ConsensusError,
    },

    /// Two validators decided the same item differently
    #[error("validators disagree on {id}: node {accepted_on} accepted, node {rejected_on} rejected")]
    Disagreement {
        /// Item in question
        id: Id,
        /// A validator that accepted it
        accepted_on: usize,
        /// A validator that rejected it
        rejected_on: usize,
    },

    /// One validator accepted two conflicting items
    #[error("node {node} accepted both {first} and {second}")]
    ConflictAccepted {
        /// Offending validator
        node: usize,
        /// First accepted item
        first: Id,
        /// Conflicting accepted item
        second: Id,
    },
}

/// Result type for simulations
pub type SimulationResult<T> = Result<T, SimulationError>;

/// Outcome of a simulation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    /// Consensus flavour that ran
    pub mode: String,
    /// Number of validators
    pub nodes: usize,
    /// Distinct items issued to every validator
    pub items: usize,
    /// Items every validator accepted
    pub accepted: usize,
    /// Items every validator rejected
    pub rejected: usize,
    /// Items still processing on at least one validator
    pub undecided: usize,
    /// Delivery rounds used
    pub rounds: u64,
    /// Queries sent across all validators
    pub queries: u64,
    /// Responses lost in transit
    pub dropped: u64,
}

impl SimulationReport {
    /// Whether every item was decided everywhere
    pub fn is_complete(&self) -> bool {
        self.undecided == 0
    }
}

/// A query on its way from `from` to the validators it names
struct Envelope {
    from: usize,
    query: Query,
}

/// [`Sender`] that queues queries in the shared outbox
struct RoutingSender {
    from: usize,
    outbox: Arc<Mutex<VecDeque<Envelope>>>,
}

impl Sender for RoutingSender {
    fn send_query(&self, validators: &Bag<NodeId>, request_id: u32, candidates: &[Id]) {
        let mut targets = validators.list();
        targets.sort();
        self.outbox.lock().push_back(Envelope {
            from: self.from,
            query: Query {
                request_id,
                validators: targets,
                candidates: candidates.to_vec(),
            },
        });
    }
}

struct SimNode<C: Consensus> {
    engine: Engine<C>,
    timer: Arc<ManualTimer>,
}

/// A set of validators exchanging queries in memory
pub struct Network<C: Consensus> {
    nodes: Vec<SimNode<C>>,
    index: HashMap<NodeId, usize>,
    outbox: Arc<Mutex<VecDeque<Envelope>>>,
    rng: ChaCha20Rng,
    drop_rate: f64,
    queries: u64,
    dropped: u64,
}

impl<C: Consensus> Network<C> {
    /// Build `count` validators of equal weight, creating each consensus
    /// instance with `make`
    pub fn new(
        count: usize,
        seed: u64,
        drop_rate: f64,
        mut make: impl FnMut(usize) -> Result<C, ConsensusError>,
    ) -> SimulationResult<Self> {
        let validators = ValidatorSet::uniform(count as u64, 1);
        let outbox = Arc::new(Mutex::new(VecDeque::new()));
        let mut nodes = Vec::with_capacity(count);
        let mut index = HashMap::with_capacity(count);

        for (i, node_id) in validators.node_ids().into_iter().enumerate() {
            let consensus = make(i).map_err(|source| SimulationError::Consensus { node: i, source })?;
            let timer = Arc::new(ManualTimer::new());
            let engine = Engine::new(
                consensus,
                Arc::new(WeightedSampler::new(&validators, Some(node_id), seed)),
                Arc::new(RoutingSender {
                    from: i,
                    outbox: Arc::clone(&outbox),
                }),
                Arc::clone(&timer) as Arc<dyn glacier_consensus::Timer>,
            );
            nodes.push(SimNode { engine, timer });
            index.insert(node_id, i);
        }

        Ok(Self {
            nodes,
            index,
            outbox,
            rng: ChaCha20Rng::seed_from_u64(seed),
            drop_rate,
            queries: 0,
            dropped: 0,
        })
    }

    /// Number of validators
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the network has no validators
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Engine of validator `node`
    pub fn engine(&self, node: usize) -> Option<&Engine<C>> {
        self.nodes.get(node).map(|n| &n.engine)
    }

    /// Issue `item` on validator `node`
    pub fn issue(&mut self, node: usize, item: Arc<C::Item>) -> SimulationResult<Applied> {
        let Some(sim) = self.nodes.get_mut(node) else {
            return Ok(Applied::default());
        };
        sim.engine
            .issue(item)
            .map_err(|source| SimulationError::Consensus { node, source })
    }

    /// Whether every validator has decided everything it was given
    pub fn settled(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| n.engine.consensus().num_processing() == 0)
    }

    /// Run until settled or `max_rounds` have passed; returns rounds used
    pub fn run(&mut self, max_rounds: u64) -> SimulationResult<u64> {
        let mut rounds = 0;
        while !self.settled() && rounds < max_rounds {
            rounds += 1;
            self.deliver_all()?;
            self.expire_deadlines()?;
            self.kick_idle()?;
            if rounds % 100 == 0 {
                debug!(
                    rounds,
                    queries = self.queries,
                    processing = self.processing(),
                    "Simulation progress"
                );
            }
        }
        Ok(rounds)
    }

    /// Status of `id` on every validator
    pub fn statuses(&self, id: &Id) -> Vec<Status> {
        self.nodes.iter().map(|n| n.engine.status(id)).collect()
    }

    fn processing(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.engine.consensus().num_processing())
            .sum()
    }

    /// Deliver the queries queued before this round; repolls wait for the next
    fn deliver_all(&mut self) -> SimulationResult<()> {
        let queued = self.outbox.lock().len();
        for _ in 0..queued {
            let next = self.outbox.lock().pop_front();
            let Some(envelope) = next else {
                break;
            };
            self.queries += 1;
            self.deliver(envelope)?;
        }
        Ok(())
    }

    fn deliver(&mut self, envelope: Envelope) -> SimulationResult<()> {
        let Envelope { from, query } = envelope;
        for target in &query.validators {
            if self.drop_rate > 0.0 && self.rng.gen_bool(self.drop_rate) {
                self.dropped += 1;
                continue;
            }
            let Some(responder) = self.index.get(target).and_then(|i| self.nodes.get(*i)) else {
                continue;
            };
            let votes = responder.engine.votes_for(&query.candidates);
            let Some(asker) = self.nodes.get_mut(from) else {
                return Ok(());
            };
            asker
                .engine
                .record_vote(query.request_id, *target, &votes)
                .map_err(|source| SimulationError::Consensus { node: from, source })?;
        }
        Ok(())
    }

    fn expire_deadlines(&mut self) -> SimulationResult<()> {
        for (i, node) in self.nodes.iter_mut().enumerate() {
            for request_id in node.timer.expire_all() {
                node.engine
                    .record_timeout(request_id)
                    .map_err(|source| SimulationError::Consensus { node: i, source })?;
            }
        }
        Ok(())
    }

    /// Restart polling on validators left with processing items and no polls
    fn kick_idle(&mut self) -> SimulationResult<()> {
        for (i, node) in self.nodes.iter_mut().enumerate() {
            let engine = &mut node.engine;
            if engine.outstanding_polls() > 0 || engine.consensus().num_processing() == 0 {
                continue;
            }
            let candidates = engine.consensus().preferences();
            if candidates.is_empty() {
                continue;
            }
            if let Err(source) = engine.issue_poll(candidates) {
                warn!(node = i, error = %source, "Failed to restart polling");
                if source.is_fatal() {
                    return Err(SimulationError::Consensus { node: i, source });
                }
            }
        }
        Ok(())
    }

    /// Check every validator agrees on `ids` and tally the outcome
    fn report(&self, mode: SimulationMode, ids: &[Id], rounds: u64) -> SimulationResult<SimulationReport> {
        let mut report = SimulationReport {
            mode: mode.to_string(),
            nodes: self.nodes.len(),
            items: ids.len(),
            accepted: 0,
            rejected: 0,
            undecided: 0,
            rounds,
            queries: self.queries,
            dropped: self.dropped,
        };
        for id in ids {
            let statuses = self.statuses(id);
            let accepted_on = statuses.iter().position(|s| *s == Status::Accepted);
            let rejected_on = statuses.iter().position(|s| *s == Status::Rejected);
            if let (Some(accepted_on), Some(rejected_on)) = (accepted_on, rejected_on) {
                return Err(SimulationError::Disagreement {
                    id: *id,
                    accepted_on,
                    rejected_on,
                });
            }
            if statuses.iter().all(|s| *s == Status::Accepted) {
                report.accepted += 1;
            } else if statuses.iter().all(|s| *s == Status::Rejected) {
                report.rejected += 1;
            } else {
                report.undecided += 1;
            }
        }
        Ok(report)
    }
}

/// Run the simulation described by `config`
pub fn run(config: &SimulationConfig, params: Parameters) -> SimulationResult<SimulationReport> {
    info!(
        mode = %config.mode,
        nodes = config.nodes,
        txs = config.txs,
        conflicts = config.conflicts,
        seed = config.seed,
        "Starting simulation"
    );
    let report = match config.mode {
        SimulationMode::Dag => run_dag(config, params)?,
        SimulationMode::Chain => run_chain(config, params)?,
    };
    info!(
        accepted = report.accepted,
        rejected = report.rejected,
        undecided = report.undecided,
        rounds = report.rounds,
        queries = report.queries,
        "Simulation finished"
    );
    Ok(report)
}

/// Conflicting transactions: the first `conflicts` transactions get a twin
/// spending the same input. Odd validators see the twin first, so initial
/// preferences split. Every transaction not starting a group of four depends
/// on its predecessor.
fn run_dag(config: &SimulationConfig, params: Parameters) -> SimulationResult<SimulationReport> {
    let mut network = Network::new(config.nodes, config.seed, config.drop_rate, |_| {
        DagConsensus::new(params)
    })?;

    let mut ids = Vec::new();
    for n in 0..config.txs as u64 {
        ids.push(Id::from_u64(n + 1));
        if (n as usize) < config.conflicts {
            ids.push(twin_id(n));
        }
    }

    for node in 0..network.len() {
        let mut issued: Vec<Arc<TestTx>> = Vec::with_capacity(config.txs);
        for n in 0..config.txs as u64 {
            let input = Id::from_u64(1_000_000 + n);
            let mut tx = TestTx::new(Id::from_u64(n + 1), vec![input]);
            if n % 4 != 0 {
                if let Some(previous) = issued.last() {
                    tx = tx.with_dependencies(vec![Arc::clone(previous)]);
                }
            }
            let tx = tx.shared();
            let twin = ((n as usize) < config.conflicts)
                .then(|| TestTx::new(twin_id(n), vec![input]).shared());

            let mut order = vec![Arc::clone(&tx)];
            if let Some(twin) = twin {
                if node % 2 == 1 {
                    order.insert(0, twin);
                } else {
                    order.push(twin);
                }
            }
            for item in order {
                network.issue(node, item as Arc<dyn Tx>)?;
            }
            issued.push(tx);
        }
    }

    let rounds = network.run(config.max_rounds)?;
    for n in 0..config.conflicts as u64 {
        check_exclusive(&network, Id::from_u64(n + 1), twin_id(n))?;
    }
    network.report(config.mode, &ids, rounds)
}

/// Competing blocks: a main chain of `txs` blocks where the first `conflicts`
/// heights also get a sibling. Odd validators issue the sibling first.
fn run_chain(config: &SimulationConfig, params: Parameters) -> SimulationResult<SimulationReport> {
    let genesis = TestBlock::genesis(Id::keccak256(b"glacier/genesis"));
    let genesis_id = genesis.id();
    let mut network = Network::new(config.nodes, config.seed, config.drop_rate, |_| {
        ChainConsensus::new(params, genesis_id, 0)
    })?;

    let mut ids = Vec::new();
    let mut parent = genesis_id;
    let mut layout = Vec::with_capacity(config.txs);
    for height in 1..=config.txs as u64 {
        let main = genesis_id.prefix(height);
        let sibling = ((height as usize) <= config.conflicts).then(|| main.prefix(0));
        ids.push(main);
        ids.extend(sibling);
        layout.push((height, parent, main, sibling));
        parent = main;
    }

    for node in 0..network.len() {
        for (height, parent, main, sibling) in &layout {
            let mut order = vec![TestBlock::new(*main, *parent, *height).shared()];
            if let Some(sibling) = sibling {
                let block = TestBlock::new(*sibling, *parent, *height).shared();
                if node % 2 == 1 {
                    order.insert(0, block);
                } else {
                    order.push(block);
                }
            }
            for block in order {
                network.issue(node, block as Arc<dyn Block>)?;
            }
        }
    }

    let rounds = network.run(config.max_rounds)?;
    network.report(config.mode, &ids, rounds)
}

fn twin_id(n: u64) -> Id {
    Id::from_u64(500_000 + n)
}

fn check_exclusive<C: Consensus>(network: &Network<C>, first: Id, second: Id) -> SimulationResult<()> {
    let a = network.statuses(&first);
    let b = network.statuses(&second);
    for (node, (x, y)) in a.iter().zip(&b).enumerate() {
        if *x == Status::Accepted && *y == Status::Accepted {
            return Err(SimulationError::ConflictAccepted { node, first, second });
        }
    }
    Ok(())
}
