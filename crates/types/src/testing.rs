//! In-memory decidable items for tests and simulations.
//!
//! These stand in for VM-produced blocks and transactions wherever the real
//! ledger model is irrelevant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Block, Decidable, DecidableError, Id, Status, StatusCell, Tx};

/// Minimal decidable item with a configurable failure on accept/reject.
#[derive(Debug)]
pub struct TestDecidable {
    id: Id,
    status: StatusCell,
    accept_error: Mutex<Option<String>>,
    reject_error: Mutex<Option<String>>,
    accepts: AtomicUsize,
    rejects: AtomicUsize,
}

impl TestDecidable {
    /// A new item in `Processing` status
    pub fn new(id: Id) -> Self {
        Self::with_status(id, Status::Processing)
    }

    /// A new item in the given status
    pub fn with_status(id: Id, status: Status) -> Self {
        Self {
            id,
            status: StatusCell::new(status),
            accept_error: Mutex::new(None),
            reject_error: Mutex::new(None),
            accepts: AtomicUsize::new(0),
            rejects: AtomicUsize::new(0),
        }
    }

    /// Make the next successful-looking accept report a VM failure
    pub fn fail_accept(&self, reason: impl Into<String>) {
        *self.accept_error.lock() = Some(reason.into());
    }

    /// Make the next successful-looking reject report a VM failure
    pub fn fail_reject(&self, reason: impl Into<String>) {
        *self.reject_error.lock() = Some(reason.into());
    }

    /// Number of accept calls that changed the status
    pub fn accept_count(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    /// Number of reject calls that changed the status
    pub fn reject_count(&self) -> usize {
        self.rejects.load(Ordering::SeqCst)
    }
}

impl Decidable for TestDecidable {
    fn id(&self) -> Id {
        self.id
    }

    fn accept(&self) -> Result<(), DecidableError> {
        if self.status.transition(self.id, Status::Accepted)? {
            self.accepts.fetch_add(1, Ordering::SeqCst);
            if let Some(reason) = self.accept_error.lock().take() {
                return Err(DecidableError::Vm { id: self.id, reason });
            }
        }
        Ok(())
    }

    fn reject(&self) -> Result<(), DecidableError> {
        if self.status.transition(self.id, Status::Rejected)? {
            self.rejects.fetch_add(1, Ordering::SeqCst);
            if let Some(reason) = self.reject_error.lock().take() {
                return Err(DecidableError::Vm { id: self.id, reason });
            }
        }
        Ok(())
    }

    fn status(&self) -> Status {
        self.status.get()
    }
}

/// Transaction with explicit inputs and dependencies.
#[derive(Debug)]
pub struct TestTx {
    /// Decision state
    pub decidable: TestDecidable,
    inputs: Vec<Id>,
    dependencies: Vec<Arc<TestTx>>,
}

impl TestTx {
    /// A processing transaction spending `inputs`
    pub fn new(id: Id, inputs: Vec<Id>) -> Self {
        Self {
            decidable: TestDecidable::new(id),
            inputs,
            dependencies: Vec::new(),
        }
    }

    /// Set the transactions this one depends on
    pub fn with_dependencies(mut self, dependencies: Vec<Arc<TestTx>>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Wrap in an `Arc`
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Decidable for TestTx {
    fn id(&self) -> Id {
        self.decidable.id()
    }

    fn accept(&self) -> Result<(), DecidableError> {
        self.decidable.accept()
    }

    fn reject(&self) -> Result<(), DecidableError> {
        self.decidable.reject()
    }

    fn status(&self) -> Status {
        self.decidable.status()
    }
}

impl Tx for TestTx {
    fn dependencies(&self) -> Vec<Arc<dyn Tx>> {
        self.dependencies
            .iter()
            .map(|d| Arc::clone(d) as Arc<dyn Tx>)
            .collect()
    }

    fn input_ids(&self) -> Vec<Id> {
        self.inputs.clone()
    }
}

/// Block with a parent pointer and height.
#[derive(Debug)]
pub struct TestBlock {
    /// Decision state
    pub decidable: TestDecidable,
    parent: Id,
    height: u64,
}

impl TestBlock {
    /// A processing block on top of `parent`
    pub fn new(id: Id, parent: Id, height: u64) -> Self {
        Self {
            decidable: TestDecidable::new(id),
            parent,
            height,
        }
    }

    /// An already accepted genesis block
    pub fn genesis(id: Id) -> Self {
        Self {
            decidable: TestDecidable::with_status(id, Status::Accepted),
            parent: Id::EMPTY,
            height: 0,
        }
    }

    /// A processing child of `parent`, with the ID derived from `seed`
    pub fn child_of(parent: &TestBlock, seed: u64) -> Self {
        Self::new(
            parent.id().prefix(seed),
            parent.id(),
            parent.height + 1,
        )
    }

    /// Wrap in an `Arc`
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Decidable for TestBlock {
    fn id(&self) -> Id {
        self.decidable.id()
    }

    fn accept(&self) -> Result<(), DecidableError> {
        self.decidable.accept()
    }

    fn reject(&self) -> Result<(), DecidableError> {
        self.decidable.reject()
    }

    fn status(&self) -> Status {
        self.decidable.status()
    }
}

impl Block for TestBlock {
    fn parent(&self) -> Id {
        self.parent
    }

    fn height(&self) -> u64 {
        self.height
    }
}
