//! # Glacier
//!
//! Main entry point for the Glacier consensus tools.
//!
//! This binary provides:
//! - An in-process network simulation of DAG or chain consensus
//! - Configuration file generation and validation

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use glacier::{simulation, DEFAULT_CONFIG_FILE, VERSION};
use glacier_config::{Config, LoggingConfig, SimulationMode};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Glacier consensus tools
#[derive(Parser, Debug)]
#[command(name = "glacier")]
#[command(version)]
#[command(about = "Glacier - metastable snowball consensus core")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format: text, json, or compact (overrides config)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
    Compact,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run validators against each other in memory
    Simulate {
        /// Consensus flavour: dag or chain
        #[arg(long)]
        mode: Option<SimulationMode>,

        /// Number of validators
        #[arg(long)]
        nodes: Option<usize>,

        /// Items issued to every validator
        #[arg(long)]
        txs: Option<usize>,

        /// Items that get a conflicting twin
        #[arg(long)]
        conflicts: Option<usize>,

        /// Seed for sampling and message loss
        #[arg(long)]
        seed: Option<u64>,

        /// Fraction of responses lost in transit
        #[arg(long)]
        drop_rate: Option<f64>,

        /// Delivery rounds before giving up
        #[arg(long)]
        max_rounds: Option<u64>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration file commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Show version information
    Version,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigCommands {
    /// Write a configuration file with default values
    Init {
        /// Output file path
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    init_tracing(&cli, &config.logging)?;

    info!(version = VERSION, "Starting Glacier");

    match cli.command {
        Commands::Simulate {
            mode,
            nodes,
            txs,
            conflicts,
            seed,
            drop_rate,
            max_rounds,
            json,
        } => {
            let mut config = config;
            let sim = &mut config.simulation;
            if let Some(mode) = mode {
                sim.mode = mode;
            }
            if let Some(nodes) = nodes {
                sim.nodes = nodes;
            }
            if let Some(txs) = txs {
                sim.txs = txs;
            }
            if let Some(conflicts) = conflicts {
                sim.conflicts = conflicts;
            }
            if let Some(seed) = seed {
                sim.seed = seed;
            }
            if let Some(drop_rate) = drop_rate {
                sim.drop_rate = drop_rate;
            }
            if let Some(max_rounds) = max_rounds {
                sim.max_rounds = max_rounds;
            }
            handle_simulate(&config, json)
        }

        Commands::Config { command } => match command {
            ConfigCommands::Init { output, force } => handle_config_init(&output, force),
            ConfigCommands::Check => {
                let path = cli
                    .config
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
                Config::load(&path)
                    .with_context(|| format!("invalid configuration {}", path.display()))?;
                println!("{} is valid", path.display());
                Ok(())
            }
        },

        Commands::Version => {
            println!("glacier {}", VERSION);
            Ok(())
        }
    }
}

/// Load the given file, or the default file if present, or defaults
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load configuration {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            Config::load(Path::new(DEFAULT_CONFIG_FILE)).context("failed to load glacier.toml")
        }
        None => Ok(Config::default()),
    }
}

fn init_tracing(cli: &Cli, logging: &LoggingConfig) -> Result<()> {
    let filter = match cli.verbose {
        0 => logging.level.to_lowercase(),
        1 => "info,glacier=debug,glacier_consensus=debug".to_string(),
        2 => "debug,glacier=debug,glacier_consensus=debug".to_string(),
        _ => "trace".to_string(),
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let format = cli.log_format.unwrap_or(match logging.format.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        "compact" => LogFormat::Compact,
        _ => LogFormat::Text,
    });

    match format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true))
                .with(env_filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(env_filter)
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(fmt::layer().compact())
                .with(env_filter)
                .init();
        }
    }

    Ok(())
}

/// Handle the `simulate` command
fn handle_simulate(config: &Config, json: bool) -> Result<()> {
    config
        .simulation
        .validate()
        .context("invalid simulation settings")?;

    let report = simulation::run(&config.simulation, config.consensus.to_parameters())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Simulation ({} mode)", report.mode);
        println!("  Validators:  {}", report.nodes);
        println!("  Items:       {}", report.items);
        println!("  Accepted:    {}", report.accepted);
        println!("  Rejected:    {}", report.rejected);
        println!("  Undecided:   {}", report.undecided);
        println!("  Rounds:      {}", report.rounds);
        println!("  Queries:     {}", report.queries);
        println!("  Dropped:     {}", report.dropped);
    }

    if !report.is_complete() {
        warn!(
            undecided = report.undecided,
            max_rounds = config.simulation.max_rounds,
            "Simulation stopped before every item was decided"
        );
    }
    Ok(())
}

/// Handle the `config init` command
fn handle_config_init(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            output.display()
        );
    }
    Config::default()
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}
