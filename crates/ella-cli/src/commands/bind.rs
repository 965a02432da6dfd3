//! Bind and unbind commands.

use std::path::Path;

use anyhow::{Result, bail};
use ella_core::{ConfigFile, DeviceIdentity, Error};

use crate::util::open_registry;

pub async fn cmd_bind(
    config: &ConfigFile,
    prefs: &Path,
    id: &str,
    name: Option<&str>,
    force: bool,
    quiet: bool,
) -> Result<()> {
    let registry = open_registry(config, prefs).await?;
    let identity = DeviceIdentity::new(id, name.unwrap_or(id));

    let bound = match registry.bind(identity, force).await {
        Ok(bound) => bound,
        Err(Error::AlreadyBound { bound, .. }) => {
            bail!("Device '{}' is already bound. Use --force to replace it.", bound)
        }
        Err(e) => return Err(e.into()),
    };

    if !quiet {
        println!("Bound {} ({})", bound.device.name, bound.device.id);
    }
    Ok(())
}

pub async fn cmd_unbind(config: &ConfigFile, prefs: &Path, quiet: bool) -> Result<()> {
    let registry = open_registry(config, prefs).await?;
    let previous = registry.unbind().await?;

    if !quiet {
        match previous {
            Some(bound) => println!("Unbound {} ({})", bound.device.name, bound.device.id),
            None => println!("No device bound"),
        }
    }
    Ok(())
}
