//! Command-line interface for CacheMesh.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// CacheMesh - multi-layer cache coordination engine.
#[derive(Parser)]
#[command(name = "cachemesh")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CACHEMESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "CACHEMESH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a cache node until interrupted
    Run {
        /// Use the development preset when no config file is given
        #[arg(long)]
        development: bool,

        /// Local cache capacity in entries
        #[arg(long, default_value_t = crate::store::InMemoryStore::DEFAULT_CAPACITY)]
        capacity: usize,

        /// Interval between expired-entry sweeps (e.g. "30s", "500ms")
        #[arg(long, default_value = "30s", value_parser = parse_interval)]
        sweep_interval: Duration,
    },

    /// Validate a configuration file
    Validate {
        /// File to validate
        file: PathBuf,
    },

    /// Print the effective configuration as JSON
    ShowConfig {
        /// Start from the development preset
        #[arg(long)]
        development: bool,
    },

    /// Show version information
    Version,
}

fn parse_interval(s: &str) -> std::result::Result<Duration, String> {
    let interval = crate::config::humantime_serde::parse_duration(s)?;
    if interval.is_zero() {
        return Err("interval must be non-zero".to_string());
    }
    Ok(interval)
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
