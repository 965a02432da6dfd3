//! Status command implementation.

use std::path::Path;

use anyhow::Result;
use ella_core::ConfigFile;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

use crate::util::open_registry;

#[derive(Debug, Serialize)]
struct StatusReport {
    preferences: String,
    bound: Option<ella_types::BoundDevice>,
}

pub async fn cmd_status(config: &ConfigFile, prefs: &Path, json: bool) -> Result<()> {
    let registry = open_registry(config, prefs).await?;
    let report = StatusReport {
        preferences: prefs.display().to_string(),
        bound: registry.bound_device(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match &report.bound {
        Some(bound) => {
            let since = bound.bound_at.format(&Rfc3339)?;
            println!("Bound device: {} ({})", bound.device.name, bound.device.id);
            println!("Bound since:  {}", since);
        }
        None => println!("No device bound"),
    }
    println!("Preferences:  {}", report.preferences);
    Ok(())
}
