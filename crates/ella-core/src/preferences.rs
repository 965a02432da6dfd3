//! Persistence of the user's bound device.
//!
//! The registry writes through a [`PreferencesStore`] whenever the binding
//! changes and reads it back at startup. Two implementations ship here:
//! [`FilePreferences`] for real use and [`MemoryPreferences`] for tests and
//! ephemeral sessions.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tracing::debug;

use ella_types::BoundDevice;

use crate::error::{Error, Result};

/// Storage for the bound device.
#[async_trait]
pub trait PreferencesStore: Send + Sync {
    /// Persist the binding, replacing any previous one.
    async fn save(&self, bound: &BoundDevice) -> Result<()>;

    /// Load the persisted binding, if any.
    async fn load(&self) -> Result<Option<BoundDevice>>;

    /// Remove the persisted binding. Clearing an empty store is not an error.
    async fn clear(&self) -> Result<()>;
}

/// JSON file-backed preferences.
///
/// Writes go to a sibling temporary file first and are renamed into place,
/// so a crash mid-write never leaves a truncated binding behind.
#[derive(Debug, Clone)]
pub struct FilePreferences {
    path: PathBuf,
}

impl FilePreferences {
    /// Use the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Use the default location under the platform data directory.
    pub fn default_location() -> Self {
        Self::new(default_preferences_path())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "bound_device.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PreferencesStore for FilePreferences {
    async fn save(&self, bound: &BoundDevice) -> Result<()> {
        let json = serde_json::to_string_pretty(bound)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!("Saved bound device {} to {}", bound.id(), self.path.display());
        Ok(())
    }

    async fn load(&self) -> Result<Option<BoundDevice>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Cleared bound device at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Default preferences file path.
pub fn default_preferences_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ella")
        .join("bound_device.json")
}

/// In-memory preferences with failure injection.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    bound: Mutex<Option<BoundDevice>>,
    should_fail: AtomicBool,
    save_count: AtomicU32,
}

impl MemoryPreferences {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a binding.
    pub fn with_bound(bound: BoundDevice) -> Self {
        Self {
            bound: Mutex::new(Some(bound)),
            ..Self::default()
        }
    }

    /// Make every subsequent operation fail.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u32 {
        self.save_count.load(Ordering::Relaxed)
    }

    /// Current stored binding without going through the trait.
    pub fn stored(&self) -> Option<BoundDevice> {
        self.slot().clone()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<BoundDevice>> {
        // A poisoned lock still holds a valid Option; keep serving it.
        self.bound.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_fail(&self) -> Result<()> {
        if self.should_fail.load(Ordering::Relaxed) {
            Err(Error::preferences("mock preferences failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PreferencesStore for MemoryPreferences {
    async fn save(&self, bound: &BoundDevice) -> Result<()> {
        self.check_fail()?;
        *self.slot() = Some(bound.clone());
        self.save_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load(&self) -> Result<Option<BoundDevice>> {
        self.check_fail()?;
        Ok(self.slot().clone())
    }

    async fn clear(&self) -> Result<()> {
        self.check_fail()?;
        *self.slot() = None;
        Ok(())
    }
}
