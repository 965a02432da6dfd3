//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "ella")]
#[command(author, version, about = "Session controller harness for Ella wearables", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "ELLA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bound-device preferences file (overrides the config file)
    #[arg(long, global = true, env = "ELLA_PREFS")]
    pub prefs: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show the bound device and where it is stored
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Bind a device as the user's wearable
    Bind {
        /// Device identifier (MAC address or platform UUID)
        id: String,

        /// Display name (defaults to the identifier)
        #[arg(short, long)]
        name: Option<String>,

        /// Replace a different device that is already bound
        #[arg(short, long)]
        force: bool,
    },

    /// Forget the bound device
    Unbind,

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Drive a session and scheduler against a simulated transport
    Simulate(SimulateArgs),
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
    /// Check the configuration file for errors
    Validate,
}

#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    /// Connect attempts that fail before the first success
    #[arg(long, default_value = "2")]
    pub failures: u32,

    /// Times the live link is dropped during the run
    #[arg(long, default_value = "1")]
    pub drops: u32,

    /// Scheduler tick in milliseconds (backoff grows from this)
    #[arg(long, default_value = "100", value_parser = clap::value_parser!(u64).range(1..))]
    pub tick_ms: u64,

    /// Total run time in seconds
    #[arg(long, default_value = "5", value_parser = clap::value_parser!(u64).range(1..))]
    pub duration_secs: u64,

    /// Print a JSON report instead of a transition log
    #[arg(long)]
    pub json: bool,
}
