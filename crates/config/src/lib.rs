//! # Glacier Configuration
//!
//! This crate parses and validates the single `glacier.toml` file that
//! configures consensus parameters, poll deadlines, logging and the network
//! simulation.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use glacier_config::Config;
//! use std::path::Path;
//!
//! let config = Config::load(Path::new("glacier.toml"))?;
//! let params = config.consensus.to_parameters();
//! let timeouts = config.timeouts.to_poll_timeout_config();
//! ```
//!
//! ## Configuration Sections
//!
//! - `[consensus]` - Snowball parameters (k, alpha, beta, repolls, limits)
//! - `[timeouts]` - Poll deadline base, growth, cap and jitter
//! - `[logging]` - Log level and output format
//! - `[simulation]` - In-process network simulation settings

mod config;
mod error;

pub use config::*;
pub use error::*;
