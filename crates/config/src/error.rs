//! Configuration error types

use std::path::PathBuf;

use glacier_consensus::ParametersError;
use thiserror::Error;

/// Errors that can occur during configuration loading and validation
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file at {path}: {source}")]
    FileRead {
        /// File that could not be read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to write configuration file
    #[error("Failed to write config file at {path}: {source}")]
    FileWrite {
        /// File that could not be written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Failed to serialize TOML configuration
    #[error("Failed to serialize TOML config: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Consensus parameters are inconsistent
    #[error("Invalid consensus parameters: {0}")]
    InvalidConsensus(#[from] ParametersError),

    /// Invalid timeout configuration
    #[error("Invalid timeout: {name} must be positive, got {value}ms")]
    InvalidTimeout {
        /// Offending field
        name: &'static str,
        /// Configured value
        value: u64,
    },

    /// Timeout cap below the base timeout
    #[error("Invalid timeout: max_ms ({max}) must be at least base_ms ({base})")]
    TimeoutCapTooLow {
        /// Configured base
        base: u64,
        /// Configured cap
        max: u64,
    },

    /// Jitter outside the accepted range
    #[error("Invalid jitter_percent: must be within [0.0, 0.5], got {0}")]
    InvalidJitter(f64),

    /// Invalid log level
    #[error("Invalid log level: {0}. Valid values: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    /// Invalid log format
    #[error("Invalid log format: {0}. Valid values: text, json, compact")]
    InvalidLogFormat(String),

    /// Simulation needs more nodes than the sample can be drawn from
    #[error("Invalid simulation: need at least 2 nodes, got {0}")]
    TooFewNodes(usize),

    /// More conflicting transactions than transactions
    #[error("Invalid simulation: conflicts ({conflicts}) exceed txs ({txs})")]
    TooManyConflicts {
        /// Configured conflicts
        conflicts: usize,
        /// Configured transactions
        txs: usize,
    },

    /// Drop rate outside `[0.0, 1.0)`
    #[error("Invalid simulation: drop_rate must be within [0.0, 1.0), got {0}")]
    InvalidDropRate(f64),

    /// Unknown simulation mode
    #[error("Invalid simulation mode: {0}. Valid values: dag, chain")]
    InvalidMode(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
