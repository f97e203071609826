//! Outbound query delivery.
//!
//! The engine hands each poll's query to a [`Sender`] and never waits on it.
//! Responses come back later as [`crate::Event`]s.

use glacier_types::{Bag, Id, NodeId};
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Fire-and-forget delivery of poll queries
pub trait Sender: Send + Sync {
    /// Ask every validator in `validators` which of `candidates` it prefers
    fn send_query(&self, validators: &Bag<NodeId>, request_id: u32, candidates: &[Id]);
}

/// A query addressed to a set of validators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Request ID the responses must carry
    pub request_id: u32,
    /// Distinct validators to contact
    pub validators: Vec<NodeId>,
    /// IDs the validators are asked about
    pub candidates: Vec<Id>,
}

/// [`Sender`] that forwards queries to a network task over a channel
#[derive(Debug, Clone)]
pub struct ChannelSender {
    network_tx: mpsc::Sender<Query>,
}

impl ChannelSender {
    /// Create a sender feeding `network_tx`
    pub fn new(network_tx: mpsc::Sender<Query>) -> Self {
        Self { network_tx }
    }
}

impl Sender for ChannelSender {
    fn send_query(&self, validators: &Bag<NodeId>, request_id: u32, candidates: &[Id]) {
        let mut targets = validators.list();
        targets.sort();
        let query = Query {
            request_id,
            validators: targets,
            candidates: candidates.to_vec(),
        };
        match self.network_tx.try_send(query) {
            Ok(()) => trace!(request_id, "Queued query"),
            // The poll times out and counts the sample as abstaining.
            Err(e) => warn!(request_id, error = %e, "Failed to queue query"),
        }
    }
}
