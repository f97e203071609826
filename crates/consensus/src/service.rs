//! Async actor around an [`Engine`].
//!
//! The service owns the engine on a single tokio task. Network responses and
//! timer expirations arrive as [`Event`]s, local submissions as [`Command`]s.
//! Decisions are forwarded on a channel in the order they happen. An issue
//! is answered with its outcome; per-item failures are also logged and
//! counted in [`ServiceStatus`].

use std::sync::Arc;

use glacier_types::{Id, Status};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::consensus::{Applied, Consensus, Decision};
use crate::engine::{Engine, Event};
use crate::error::{ConsensusError, ConsensusResult};

/// Local requests to the service
pub enum Command<I: ?Sized> {
    /// Start deciding an item
    Issue {
        /// Item to decide
        item: Arc<I>,
        /// Receives the engine's answer to the issue
        reply: oneshot::Sender<ConsensusResult<Applied>>,
    },
    /// Stop the service and hand back the engine
    Shutdown,
}

/// Snapshot of the engine, refreshed after every message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Items still being decided
    pub processing: usize,
    /// Polls in flight
    pub outstanding_polls: usize,
    /// Best current candidate
    pub preference: Option<Id>,
    /// Items accepted since start
    pub accepted: u64,
    /// Items rejected since start
    pub rejected: u64,
    /// Per-item failures reported by the engine
    pub failures: u64,
    /// Most recent per-item failure
    pub last_failure: Option<String>,
    /// Set once the engine halted
    pub halted: Option<String>,
}

/// Cloneable handle for talking to a running service
pub struct ServiceHandle<I: ?Sized> {
    commands: mpsc::Sender<Command<I>>,
    events: mpsc::Sender<Event>,
    status: Arc<RwLock<ServiceStatus>>,
}

impl<I: ?Sized> Clone for ServiceHandle<I> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            events: self.events.clone(),
            status: Arc::clone(&self.status),
        }
    }
}

impl<I: ?Sized> ServiceHandle<I> {
    /// Submit an item for consensus and wait for the engine to take it.
    ///
    /// Returns what issuing decided, including per-item failures, or the
    /// error the engine refused the item with.
    pub async fn issue(&self, item: Arc<I>) -> ConsensusResult<Applied> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::Issue { item, reply })
            .await
            .map_err(|_| ConsensusError::ServiceStopped)?;
        answer.await.map_err(|_| ConsensusError::ServiceStopped)?
    }

    /// Deliver a network response or timer expiration
    pub async fn send_event(&self, event: Event) -> ConsensusResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| ConsensusError::ServiceStopped)
    }

    /// Sender feeding the event queue, for network tasks
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.events.clone()
    }

    /// Latest engine snapshot
    pub fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    /// Ask the service to stop
    pub async fn shutdown(&self) -> ConsensusResult<()> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| ConsensusError::ServiceStopped)
    }
}

/// Task owning an engine and its input queues
pub struct EngineService<C: Consensus> {
    engine: Engine<C>,
    commands: mpsc::Receiver<Command<C::Item>>,
    events: mpsc::Receiver<Event>,
    decision_tx: mpsc::Sender<Decision>,
    status: Arc<RwLock<ServiceStatus>>,
}

impl<C> EngineService<C>
where
    C: Consensus + 'static,
{
    /// Wrap `engine`.
    ///
    /// `event_tx`/`event_rx` form the event queue; timers built before the
    /// engine should already hold a clone of `event_tx`.
    pub fn new(
        engine: Engine<C>,
        event_tx: mpsc::Sender<Event>,
        event_rx: mpsc::Receiver<Event>,
        decision_tx: mpsc::Sender<Decision>,
        command_capacity: usize,
    ) -> (Self, ServiceHandle<C::Item>) {
        let (command_tx, command_rx) = mpsc::channel(command_capacity.max(1));
        let status = Arc::new(RwLock::new(ServiceStatus::default()));
        let service = Self {
            engine,
            commands: command_rx,
            events: event_rx,
            decision_tx,
            status: Arc::clone(&status),
        };
        let handle = ServiceHandle {
            commands: command_tx,
            events: event_tx,
            status,
        };
        service.publish_status();
        (service, handle)
    }

    /// Process messages until shutdown or until every handle is dropped.
    ///
    /// Returns the engine for inspection.
    pub async fn run(mut self) -> Engine<C> {
        info!("Engine service started");
        loop {
            let (applied, reply) = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Issue { item, reply }) => (self.engine.issue(item), Some(reply)),
                    Some(Command::Shutdown) | None => break,
                },
                event = self.events.recv() => match event {
                    Some(event) => (self.engine.handle(event), None),
                    None => break,
                },
            };

            let decisions = match &applied {
                Ok(applied) => {
                    for err in &applied.errors {
                        self.record_failure(err);
                    }
                    applied.decisions.clone()
                }
                Err(err) if err.is_fatal() => {
                    warn!(error = %err, "Engine halted");
                    Vec::new()
                }
                Err(err) if reply.is_some() => {
                    debug!(error = %err, "Engine refused issued item");
                    Vec::new()
                }
                Err(err) => {
                    self.record_failure(err);
                    Vec::new()
                }
            };
            self.count(&decisions);
            self.publish_status();
            if let Some(reply) = reply {
                if reply.send(applied).is_err() {
                    debug!("Issuer stopped waiting for the result");
                }
            }
            self.forward(decisions).await;
        }
        info!(
            processing = self.engine.consensus().num_processing(),
            "Engine service stopped"
        );
        self.engine
    }

    /// Run on a new tokio task
    pub fn spawn(self) -> JoinHandle<Engine<C>>
    where
        C: Send,
        C::Item: Send + Sync,
    {
        tokio::spawn(self.run())
    }

    fn count(&self, decisions: &[Decision]) {
        if decisions.is_empty() {
            return;
        }
        let mut status = self.status.write();
        for decision in decisions {
            match decision.status {
                Status::Accepted => status.accepted += 1,
                _ => status.rejected += 1,
            }
        }
    }

    fn record_failure(&self, err: &ConsensusError) {
        warn!(error = %err, "Item failed in consensus");
        let mut status = self.status.write();
        status.failures += 1;
        status.last_failure = Some(err.to_string());
    }

    async fn forward(&mut self, decisions: Vec<Decision>) {
        for decision in decisions {
            if self.decision_tx.send(decision).await.is_err() {
                debug!(id = %decision.id.short(), "Decision receiver dropped");
            }
        }
    }

    fn publish_status(&self) {
        let mut status = self.status.write();
        status.processing = self.engine.consensus().num_processing();
        status.outstanding_polls = self.engine.outstanding_polls();
        status.preference = self.engine.preference();
        status.halted = self.engine.halt_reason().map(str::to_string);
    }
}
