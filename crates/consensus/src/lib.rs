//! # Glacier Consensus
//!
//! Metastable consensus core for Glacier: repeated random sampling of
//! stake-weighted validators with snowball confidence counters.
//!
//! This crate implements the two consensus flavours that share one confidence
//! rule:
//!
//! - **DAG consensus** ([`DagConsensus`]): transactions spending a common
//!   input form a conflict set, at most one member of which is accepted
//! - **Chain consensus** ([`ChainConsensus`]): sibling blocks conflict, and a
//!   vote for a block counts for its whole ancestor path
//!
//! ## Confidence Rule
//!
//! ```text
//! poll(k validators) ──> tally ──> candidate weight >= alpha ?
//!                                     │
//!              ┌──────────────────────┼───────────────────────┐
//!              ▼                      ▼                       ▼
//!         no quorum            same preference         new preference
//!       successes = 0          successes += 1          successes = 1
//!                                     │
//!                                     ▼
//!                          successes >= beta ──> decide
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use glacier_consensus::{
//!     ChannelSender, DagConsensus, Engine, ManualTimer, Parameters, Query, ValidatorSet,
//!     WeightedSampler,
//! };
//! use glacier_types::{testing::TestTx, Id};
//!
//! let params = Parameters::small();
//! let validators = ValidatorSet::uniform(10, 1);
//! let (network_tx, mut network_rx) = tokio::sync::mpsc::channel::<Query>(64);
//!
//! let mut engine = Engine::new(
//!     DagConsensus::new(params).unwrap(),
//!     Arc::new(WeightedSampler::new(&validators, None, 1)),
//!     Arc::new(ChannelSender::new(network_tx)),
//!     Arc::new(ManualTimer::new()),
//! );
//!
//! let tx = TestTx::new(Id::from_u64(1), vec![Id::from_u64(100)]).shared();
//! engine.issue(tx).unwrap();
//!
//! let query = network_rx.try_recv().unwrap();
//! assert_eq!(query.candidates, vec![Id::from_u64(1)]);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod chain;
pub mod consensus;
pub mod dag;
pub mod decisions;
pub mod engine;
pub mod error;
pub mod network;
pub mod parameters;
pub mod poll;
pub mod service;
pub mod snowball;
pub mod timeout;
pub mod validators;

pub use chain::ChainConsensus;
pub use consensus::{Applied, Consensus, Decision};
pub use dag::{ConflictSetId, DagConsensus};
pub use decisions::{DecisionCache, RecordResult};
pub use engine::{Engine, Event};
pub use error::{ConsensusError, ConsensusResult};
pub use network::{ChannelSender, Query, Sender};
pub use parameters::{Parameters, ParametersError};
pub use poll::{Ballot, Poll, PollResult, PollSet};
pub use service::{Command, EngineService, ServiceHandle, ServiceStatus};
pub use snowball::{PollOutcome, Snowball, Thresholds, Transition};
pub use timeout::{
    BackoffMode, ManualTimer, PollTimeoutConfig, TimeoutMetrics, TimeoutScheduler, Timer,
};
pub use validators::{Sampler, Validator, ValidatorSet, WeightedSampler};
