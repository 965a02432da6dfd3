//! Shared helpers for loading configuration and the device registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use ella_core::{ConfigFile, DeviceRegistry, EventDispatcher, FilePreferences, default_config_path};

/// Resolve the configuration file path.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map(Path::to_path_buf).unwrap_or_else(default_config_path)
}

/// Load configuration, falling back to defaults when the file is absent.
///
/// An explicitly named file must exist.
pub fn load_config(explicit: Option<&Path>) -> Result<ConfigFile> {
    let path = config_path(explicit);
    if explicit.is_none() && !path.exists() {
        tracing::debug!("No config at {}; using defaults", path.display());
        return Ok(ConfigFile::default());
    }
    let config = ConfigFile::load_validated(&path)
        .with_context(|| format!("Cannot use configuration {}", path.display()))?;
    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Preferences file: `--prefs` wins over the config file.
pub fn preferences_path(config: &ConfigFile, explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.preferences_path())
}

/// Registry backed by the preferences file, with the binding loaded.
pub async fn open_registry(config: &ConfigFile, prefs: &Path) -> Result<DeviceRegistry> {
    let session = config.to_session_config();
    let registry = DeviceRegistry::new(
        Arc::new(FilePreferences::new(prefs)),
        EventDispatcher::new(session.event_capacity),
    )
    .with_persist_timeout(session.persist_timeout);

    registry
        .load()
        .await
        .with_context(|| format!("Cannot read bound device from {}", prefs.display()))?;
    Ok(registry)
}
