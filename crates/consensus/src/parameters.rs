//! Network-wide snowball parameters.
//!
//! `k`, `alpha` and `beta` are fixed per network; every poll is sized and
//! judged with the same values.

use serde::{Deserialize, Serialize};

/// Errors raised by [`Parameters::verify`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParametersError {
    /// Sample size must be positive
    #[error("k = {0}: sample size must be at least 1")]
    InvalidK(usize),

    /// Quorum must be a strict majority of the sample
    #[error("alpha = {alpha}: must be greater than k / 2 = {half}")]
    AlphaTooLow {
        /// Configured alpha
        alpha: usize,
        /// Half of k (rounded down)
        half: usize,
    },

    /// Quorum cannot exceed the sample size
    #[error("alpha = {alpha}: must be at most k = {k}")]
    AlphaTooHigh {
        /// Configured alpha
        alpha: usize,
        /// Configured k
        k: usize,
    },

    /// Finalization depth must be positive
    #[error("beta = {0}: must be at least 1")]
    InvalidBeta(usize),

    /// Repolls must be in `[1, beta]`
    #[error("concurrent_repolls = {repolls}: must be in [1, beta = {beta}]")]
    InvalidConcurrentRepolls {
        /// Configured repolls
        repolls: usize,
        /// Configured beta
        beta: usize,
    },

    /// At least one poll must be allowed in flight
    #[error("max_outstanding_polls = {0}: must be at least concurrent_repolls")]
    InvalidMaxOutstandingPolls(usize),

    /// The decision cache must hold at least one entry
    #[error("decision_cache_size must be at least 1")]
    InvalidDecisionCacheSize,
}

/// Snowball parameters shared by the DAG and chain engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    /// Sample size: validator slots queried per poll
    pub k: usize,
    /// Quorum: sampled weight a single candidate needs for a successful poll
    pub alpha: usize,
    /// Finalization depth: consecutive successful polls needed to decide
    pub beta: usize,
    /// Polls kept in flight while items are processing
    pub concurrent_repolls: usize,
    /// Hard cap on outstanding polls (backpressure)
    pub max_outstanding_polls: usize,
    /// Number of decided IDs remembered after eviction
    pub decision_cache_size: usize,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 15,
            beta: 20,
            concurrent_repolls: 4,
            max_outstanding_polls: 1024,
            decision_cache_size: 8192,
        }
    }
}

impl Parameters {
    /// Small parameters for unit tests and local simulations
    pub fn small() -> Self {
        Self {
            k: 5,
            alpha: 4,
            beta: 3,
            concurrent_repolls: 1,
            max_outstanding_polls: 64,
            decision_cache_size: 1024,
        }
    }

    /// Check the parameters are internally consistent
    pub fn verify(&self) -> Result<(), ParametersError> {
        if self.k == 0 {
            return Err(ParametersError::InvalidK(self.k));
        }
        if self.alpha <= self.k / 2 {
            return Err(ParametersError::AlphaTooLow {
                alpha: self.alpha,
                half: self.k / 2,
            });
        }
        if self.alpha > self.k {
            return Err(ParametersError::AlphaTooHigh {
                alpha: self.alpha,
                k: self.k,
            });
        }
        if self.beta == 0 {
            return Err(ParametersError::InvalidBeta(self.beta));
        }
        if self.concurrent_repolls == 0 || self.concurrent_repolls > self.beta {
            return Err(ParametersError::InvalidConcurrentRepolls {
                repolls: self.concurrent_repolls,
                beta: self.beta,
            });
        }
        if self.max_outstanding_polls < self.concurrent_repolls {
            return Err(ParametersError::InvalidMaxOutstandingPolls(
                self.max_outstanding_polls,
            ));
        }
        if self.decision_cache_size == 0 {
            return Err(ParametersError::InvalidDecisionCacheSize);
        }
        Ok(())
    }
}
