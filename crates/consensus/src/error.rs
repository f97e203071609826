//! Error taxonomy for the consensus core.

use glacier_types::{DecidableError, Id};

use crate::parameters::ParametersError;

/// Errors that can occur during consensus operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    /// An item refused an accept/reject transition
    #[error(transparent)]
    InvalidTransition(#[from] DecidableError),

    /// Referenced conflict set does not exist (never created or already decided)
    #[error("unknown conflict set {0}")]
    UnknownConflictSet(String),

    /// Referenced dependency was never issued
    #[error("unknown dependency {0}")]
    UnknownDependency(Id),

    /// Request ID is already registered for an outstanding poll
    #[error("duplicate request id {0}")]
    DuplicateRequestId(u32),

    /// Item was already issued into this consensus instance
    #[error("item {0} already issued")]
    AlreadyIssued(Id),

    /// Backpressure: the poll set is full
    #[error("too many outstanding polls: {outstanding} >= {max}")]
    TooManyOutstandingPolls {
        /// Polls currently outstanding
        outstanding: usize,
        /// Configured maximum
        max: usize,
    },

    /// No validator with non-zero weight is available for sampling
    #[error("no validators with weight available for sampling")]
    InsufficientValidators,

    /// A poll result older than one already applied
    #[error("stale poll {seq}: already applied poll {last}")]
    StalePoll {
        /// Sequence number of the rejected result
        seq: u64,
        /// Sequence number already applied
        last: u64,
    },

    /// Internal state no longer satisfies a safety invariant
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Engine stopped after an invariant violation
    #[error("engine halted: {0}")]
    Halted(String),

    /// The engine service task is no longer running
    #[error("engine service stopped")]
    ServiceStopped,

    /// Parameters failed validation
    #[error("invalid parameters: {0}")]
    InvalidParameters(#[from] ParametersError),
}

impl ConsensusError {
    /// Returns true if this error must stop the consensus instance
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsensusError::InvariantViolation(_) | ConsensusError::Halted(_)
        )
    }
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;
