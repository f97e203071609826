//! # Glacier
//!
//! Command-line entry point for the Glacier consensus core, usable as a
//! library for driving simulated networks.
//!
//! ## Components
//!
//! - [`simulation::Network`] - validators exchanging queries in memory
//! - [`simulation::run`] - run the DAG or chain scenario described by a
//!   [`glacier_config::SimulationConfig`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use glacier_config::Config;
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load(Path::new("glacier.toml"))?;
//!     let report = glacier::simulation::run(&config.simulation, config.consensus.to_parameters())?;
//!     assert!(report.is_complete());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod simulation;

pub use simulation::{Network, SimulationError, SimulationReport, SimulationResult};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "glacier.toml";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_CONFIG_FILE, "glacier.toml");
    }
}
