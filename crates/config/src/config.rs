//! Main configuration module for Glacier
//!
//! Every setting lives in one `glacier.toml` file. Each section has a
//! `Default` so a partial file is valid; missing sections fall back to the
//! defaults.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use glacier_consensus::{BackoffMode, Parameters, PollTimeoutConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};

/// Main configuration struct containing all Glacier settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Snowball parameters
    pub consensus: ConsensusConfig,

    /// Poll deadlines
    pub timeouts: TimeoutsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Network simulation settings
    pub simulation: SimulationConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// The parsed configuration is validated before it is returned.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        info!("Loading configuration from {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content)?;

        debug!("Configuration parsed successfully, validating...");
        config.validate()?;

        info!(
            k = config.consensus.k,
            alpha = config.consensus.alpha,
            beta = config.consensus.beta,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> ConfigResult<()> {
        self.consensus.validate()?;
        self.timeouts.validate()?;
        self.logging.validate()?;
        self.simulation.validate()?;

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }
}

// =============================================================================
// Consensus Configuration
// =============================================================================

/// Snowball parameters, mirrored field for field into [`Parameters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Validator slots sampled per poll
    pub k: usize,

    /// Sampled weight a candidate needs for a successful poll
    pub alpha: usize,

    /// Consecutive successful polls needed to decide
    pub beta: usize,

    /// Polls kept in flight while items are processing
    pub concurrent_repolls: usize,

    /// Cap on outstanding polls
    pub max_outstanding_polls: usize,

    /// Decided IDs remembered per consensus instance
    pub decision_cache_size: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        let params = Parameters::default();
        Self {
            k: params.k,
            alpha: params.alpha,
            beta: params.beta,
            concurrent_repolls: params.concurrent_repolls,
            max_outstanding_polls: params.max_outstanding_polls,
            decision_cache_size: params.decision_cache_size,
        }
    }
}

impl ConsensusConfig {
    /// Parameters for the consensus crate
    pub fn to_parameters(&self) -> Parameters {
        Parameters {
            k: self.k,
            alpha: self.alpha,
            beta: self.beta,
            concurrent_repolls: self.concurrent_repolls,
            max_outstanding_polls: self.max_outstanding_polls,
            decision_cache_size: self.decision_cache_size,
        }
    }

    /// Check the parameters are internally consistent
    pub fn validate(&self) -> ConfigResult<()> {
        self.to_parameters().verify()?;
        Ok(())
    }
}

// =============================================================================
// Timeout Configuration
// =============================================================================

/// Growth of poll deadlines after consecutive expirations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// base + delta * expirations
    #[default]
    Linear,
    /// base * 2^expirations, capped by `max_exponent`
    Exponential,
}

/// Poll deadline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Deadline with no recent expirations (milliseconds)
    pub base_ms: u64,

    /// Growth per consecutive expiration under linear backoff (milliseconds)
    pub delta_ms: u64,

    /// Upper bound on any deadline (milliseconds)
    pub max_ms: u64,

    /// Backoff strategy
    pub backoff: Backoff,

    /// Exponent cap for exponential backoff
    pub max_exponent: u32,

    /// Extra random delay as a fraction of the deadline
    pub jitter_percent: f64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            base_ms: 2000,
            delta_ms: 500,
            max_ms: 30_000,
            backoff: Backoff::Linear,
            max_exponent: 6,
            jitter_percent: 0.10,
        }
    }
}

impl TimeoutsConfig {
    /// Deadline configuration for the consensus crate
    pub fn to_poll_timeout_config(&self) -> PollTimeoutConfig {
        let backoff_mode = match self.backoff {
            Backoff::Linear => BackoffMode::Linear,
            Backoff::Exponential => BackoffMode::Exponential {
                max_exponent: self.max_exponent,
            },
        };
        PollTimeoutConfig {
            base: Duration::from_millis(self.base_ms),
            delta: Duration::from_millis(self.delta_ms),
            max_timeout: Duration::from_millis(self.max_ms),
            backoff_mode,
            jitter_percent: self.jitter_percent,
        }
    }

    /// Check deadlines are positive and ordered
    pub fn validate(&self) -> ConfigResult<()> {
        if self.base_ms == 0 {
            return Err(ConfigError::InvalidTimeout {
                name: "base_ms",
                value: 0,
            });
        }

        if self.max_ms < self.base_ms {
            return Err(ConfigError::TimeoutCapTooLow {
                base: self.base_ms,
                max: self.max_ms,
            });
        }

        if !(0.0..=0.5).contains(&self.jitter_percent) {
            return Err(ConfigError::InvalidJitter(self.jitter_percent));
        }

        Ok(())
    }
}

// =============================================================================
// Logging Configuration
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json, compact)
    pub format: String,
}

impl LoggingConfig {
    /// Check level and format are known
    pub fn validate(&self) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.level.clone()));
        }

        let valid_formats = ["text", "json", "compact"];
        if !valid_formats.contains(&self.format.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogFormat(self.format.clone()));
        }

        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

// =============================================================================
// Simulation Configuration
// =============================================================================

/// Which consensus flavour the simulation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationMode {
    /// Conflicting transactions decided by the DAG resolver
    #[default]
    Dag,
    /// Competing blocks decided by chain consensus
    Chain,
}

impl fmt::Display for SimulationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationMode::Dag => write!(f, "dag"),
            SimulationMode::Chain => write!(f, "chain"),
        }
    }
}

impl FromStr for SimulationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dag" => Ok(SimulationMode::Dag),
            "chain" => Ok(SimulationMode::Chain),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

/// In-process network simulation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Consensus flavour
    pub mode: SimulationMode,

    /// Number of simulated validators, each running its own engine
    pub nodes: usize,

    /// Items issued to every node
    pub txs: usize,

    /// Items that get a conflicting twin (DAG) or a competing sibling (chain)
    pub conflicts: usize,

    /// Seed for sampling, delivery order and dropped responses
    pub seed: u64,

    /// Fraction of query responses lost in transit
    pub drop_rate: f64,

    /// Delivery rounds before the simulation gives up
    pub max_rounds: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            mode: SimulationMode::Dag,
            nodes: 10,
            txs: 50,
            conflicts: 10,
            seed: 1,
            drop_rate: 0.0,
            max_rounds: 10_000,
        }
    }
}

impl SimulationConfig {
    /// Check the simulation can run
    pub fn validate(&self) -> ConfigResult<()> {
        if self.nodes < 2 {
            return Err(ConfigError::TooFewNodes(self.nodes));
        }

        if self.conflicts > self.txs {
            return Err(ConfigError::TooManyConflicts {
                conflicts: self.conflicts,
                txs: self.txs,
            });
        }

        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(ConfigError::InvalidDropRate(self.drop_rate));
        }

        Ok(())
    }
}
