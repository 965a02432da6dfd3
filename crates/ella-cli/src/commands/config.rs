//! Config command implementation.

use std::path::Path;

use anyhow::{Result, bail};
use ella_core::ConfigFile;

use crate::cli::ConfigAction;
use crate::util::config_path;

pub fn cmd_config(action: ConfigAction, explicit: Option<&Path>, quiet: bool) -> Result<()> {
    let path = config_path(explicit);

    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "Config file {} already exists. Use --force to overwrite.",
                    path.display()
                );
            }
            ConfigFile::default().save(&path)?;
            if !quiet {
                println!("Wrote {}", path.display());
            }
        }
        ConfigAction::Show => {
            let config = if path.exists() {
                ConfigFile::load(&path)?
            } else {
                if !quiet {
                    eprintln!("# {} not found; showing defaults", path.display());
                }
                ConfigFile::default()
            };
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Validate => {
            ConfigFile::load_validated(&path)?;
            if !quiet {
                println!("{} is valid", path.display());
            }
        }
    }
    Ok(())
}
