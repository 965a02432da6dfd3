//! Catalog of discovered devices and the user's bound device.
//!
//! The registry is the only component that talks to the preferences store.
//! Reads are synchronous snapshots; changes to the binding are serialized so
//! two concurrent `bind` calls cannot interleave their persistence writes.
//!
//! Sessions built over a registry are attached as binding observers, so a
//! bind or unbind made directly on the registry still drops a link to a
//! device that is no longer bound.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

use ella_types::{BoundDevice, DeviceIdentity};

use crate::error::{Error, Result};
use crate::events::{EventDispatcher, SessionEvent};
use crate::preferences::PreferencesStore;

/// Default bound on preferences writes.
pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Reacts to the binding changing. Called after the change is persisted.
#[async_trait]
pub(crate) trait BindingObserver: Send + Sync {
    async fn binding_changed(&self, bound: Option<&BoundDevice>);
}

/// Known devices plus the bound one.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceIdentity>>,
    bound: RwLock<Option<BoundDevice>>,
    /// Serializes binding changes across their persistence await.
    write_lock: Mutex<()>,
    preferences: Arc<dyn PreferencesStore>,
    events: EventDispatcher,
    persist_timeout: Duration,
    observers: RwLock<Vec<Weak<dyn BindingObserver>>>,
}

impl DeviceRegistry {
    /// Create an empty registry backed by `preferences`.
    ///
    /// Call [`DeviceRegistry::load`] to restore a previous binding.
    pub fn new(preferences: Arc<dyn PreferencesStore>, events: EventDispatcher) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            bound: RwLock::new(None),
            write_lock: Mutex::new(()),
            preferences,
            events,
            persist_timeout: DEFAULT_PERSIST_TIMEOUT,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Override the bound on preferences operations.
    #[must_use]
    pub fn with_persist_timeout(mut self, persist_timeout: Duration) -> Self {
        self.persist_timeout = persist_timeout;
        self
    }

    /// Event dispatcher the registry publishes to.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Restore the binding from the preferences store.
    pub async fn load(&self) -> Result<Option<BoundDevice>> {
        let _write = self.write_lock.lock().await;
        let loaded = self
            .bounded("load bound device", self.preferences.load())
            .await?;

        if let Some(bound) = &loaded {
            info!("Restored bound device {}", bound.device);
            self.devices_mut()
                .insert(bound.device.id.clone(), bound.device.clone());
        }
        *self.bound_mut() = loaded.clone();
        Ok(loaded)
    }

    /// Record a scan sighting, replacing any earlier identity with the same id.
    ///
    /// Sightings with a malformed identifier are ignored.
    pub fn record_discovery(&self, identity: DeviceIdentity) {
        let identity = match normalized(identity) {
            Ok(identity) => identity,
            Err(e) => {
                debug!("Ignoring discovery: {}", e);
                return;
            }
        };
        debug!("Discovered {}", identity);
        self.devices_mut()
            .insert(identity.id.clone(), identity.clone());

        {
            let mut bound = self.bound_mut();
            if let Some(current) = bound.as_mut()
                && current.device.same_device(&identity)
            {
                current.device = identity.clone();
            }
        }

        self.events.send(SessionEvent::Discovered { device: identity });
    }

    /// Bind `identity` as the user's device.
    ///
    /// The identifier is stored trimmed. Binding the device that is already
    /// bound refreshes its identity and keeps the original `bound_at`.
    /// Binding a different device requires `rebind`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidIdentity`] if the identifier is malformed
    /// - [`Error::AlreadyBound`] if another device is bound and `rebind` is false
    /// - [`Error::Timeout`] or [`Error::Preferences`] if persisting fails; the
    ///   in-memory binding is unchanged in that case
    #[instrument(level = "info", skip_all, fields(device = %identity.id, rebind = rebind))]
    pub async fn bind(&self, identity: DeviceIdentity, rebind: bool) -> Result<BoundDevice> {
        let identity = normalized(identity)?;
        let write = self.write_lock.lock().await;

        let (bound, replaced) = match self.bound_device() {
            Some(existing) if existing.device.same_device(&identity) => (
                BoundDevice::bound_at(identity.clone(), existing.bound_at),
                None,
            ),
            Some(existing) if !rebind => {
                return Err(Error::AlreadyBound {
                    bound: existing.device.id,
                    requested: identity.id,
                });
            }
            Some(existing) => (BoundDevice::new(identity.clone()), Some(existing)),
            None => (BoundDevice::new(identity.clone()), None),
        };

        let already_bound = self
            .bound_device()
            .is_some_and(|b| b.device.same_device(&identity));

        self.bounded("save bound device", self.preferences.save(&bound))
            .await?;
        *self.bound_mut() = Some(bound.clone());
        self.devices_mut()
            .insert(identity.id.clone(), identity.clone());
        drop(write);

        if already_bound {
            debug!("Device {} was already bound", identity);
        } else {
            if let Some(previous) = &replaced {
                info!("Rebinding from {} to {}", previous.device, identity);
            } else {
                info!("Bound device {}", identity);
            }
            self.events.send(SessionEvent::Bound {
                device: identity,
                rebind: replaced.is_some(),
            });
            self.notify(Some(&bound)).await;
        }

        Ok(bound)
    }

    /// Clear the binding.
    ///
    /// Returns the previous binding, or `None` if nothing was bound (which
    /// is not an error).
    #[instrument(level = "info", skip_all)]
    pub async fn unbind(&self) -> Result<Option<BoundDevice>> {
        let write = self.write_lock.lock().await;

        let Some(previous) = self.bound_device() else {
            debug!("Unbind requested with no bound device");
            return Ok(None);
        };

        self.bounded("clear bound device", self.preferences.clear())
            .await?;
        *self.bound_mut() = None;
        drop(write);

        info!("Unbound device {}", previous.device);
        self.events.send(SessionEvent::Unbound {
            device: previous.device.clone(),
        });
        self.notify(None).await;
        Ok(Some(previous))
    }

    /// Current binding.
    pub fn bound_device(&self) -> Option<BoundDevice> {
        self.bound.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether `id` is the bound device.
    pub fn is_bound(&self, id: &str) -> bool {
        self.bound_device().is_some_and(|b| b.id() == id)
    }

    /// Look up a known device.
    pub fn get(&self, id: &str) -> Option<DeviceIdentity> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All known devices, most recently seen first.
    pub fn known_devices(&self) -> Vec<DeviceIdentity> {
        let mut devices: Vec<_> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        devices.sort_by(|a, b| {
            b.last_seen_at
                .cmp(&a.last_seen_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        devices
    }

    /// Drop a discovery entry. The bound device cannot be forgotten.
    pub fn forget(&self, id: &str) -> bool {
        if self.is_bound(id) {
            return false;
        }
        self.devices_mut().remove(id).is_some()
    }

    /// Register an observer of binding changes. Dropped observers are pruned.
    pub(crate) fn attach(&self, observer: Weak<dyn BindingObserver>) {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        observers.retain(|o| o.strong_count() > 0);
        observers.push(observer);
    }

    async fn notify(&self, bound: Option<&BoundDevice>) {
        let observers: Vec<_> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            observer.binding_changed(bound).await;
        }
    }

    async fn bounded<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        timeout(self.persist_timeout, fut)
            .await
            .map_err(|_| Error::timeout(operation, self.persist_timeout))?
    }

    fn devices_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DeviceIdentity>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bound_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<BoundDevice>> {
        self.bound.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rebuild `identity` around its validated, trimmed identifier.
fn normalized(identity: DeviceIdentity) -> Result<DeviceIdentity> {
    let id = DeviceIdentity::parse_id(&identity.id)?;
    Ok(DeviceIdentity::seen_at(id, identity.name, identity.last_seen_at))
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("bound", &self.bound_device().map(|b| b.device.id))
            .field("known", &self.devices.read().map(|d| d.len()).unwrap_or(0))
            .finish()
    }
}
