//! Command-line harness for the Ella wearable session controller.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `status` | Show the bound device |
//! | `bind` | Bind a device, `--force` to replace another |
//! | `unbind` | Forget the bound device |
//! | `config` | Initialize, show or validate the config file |
//! | `simulate` | Run a session against a simulated transport |
//!
//! Configuration lives in `~/.config/ella/config.toml` (or the platform
//! equivalent); `ELLA_CONFIG` and `ELLA_PREFS` override the file locations.

mod cli;
mod commands;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use commands::{cmd_bind, cmd_config, cmd_simulate, cmd_status, cmd_unbind};
use util::{load_config, preferences_path};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_flag = cli.config.as_deref();
    let prefs_flag = cli.prefs.as_deref();

    match cli.command {
        Commands::Config { action } => cmd_config(action, config_flag, cli.quiet)?,
        Commands::Status { json } => {
            let config = load_config(config_flag)?;
            cmd_status(&config, &preferences_path(&config, prefs_flag), json).await?;
        }
        Commands::Bind { id, name, force } => {
            let config = load_config(config_flag)?;
            let prefs = preferences_path(&config, prefs_flag);
            tracing::info!("Binding {} (prefs: {})", id, prefs.display());
            cmd_bind(&config, &prefs, &id, name.as_deref(), force, cli.quiet).await?;
        }
        Commands::Unbind => {
            let config = load_config(config_flag)?;
            cmd_unbind(&config, &preferences_path(&config, prefs_flag), cli.quiet).await?;
        }
        Commands::Simulate(args) => {
            let config = load_config(config_flag)?;
            cmd_simulate(&config, args, cli.quiet).await?;
        }
    }

    Ok(())
}
