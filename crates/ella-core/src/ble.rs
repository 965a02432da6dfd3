//! Bluetooth LE transport backed by btleplug.
//!
//! Only link establishment and loss are handled here. Service discovery and
//! characteristic I/O belong to whoever consumes the connected device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use ella_types::{DeviceIdentity, DisconnectReason};

use crate::error::TransportError;
use crate::transport::{LinkEventSender, Transport, TransportEvent, TransportLink};

/// Default time spent scanning for a device that is not cached yet.
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(5);

impl From<btleplug::Error> for TransportError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::PermissionDenied => TransportError::AdapterUnavailable,
            btleplug::Error::DeviceNotFound => TransportError::NotFound(String::new()),
            btleplug::Error::TimedOut(_) => TransportError::Timeout,
            other => TransportError::Ble(other.to_string()),
        }
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or(TransportError::AdapterUnavailable)
}

/// Scan for nearby devices.
///
/// Returns every named peripheral seen during `duration`, ready for
/// [`crate::DeviceRegistry::record_discovery`].
pub async fn scan_devices(duration: Duration) -> Result<Vec<DeviceIdentity>, TransportError> {
    let adapter = get_adapter().await?;
    scan_with_adapter(&adapter, duration).await
}

/// Scan using a specific adapter.
pub async fn scan_with_adapter(
    adapter: &Adapter,
    duration: Duration,
) -> Result<Vec<DeviceIdentity>, TransportError> {
    info!("Starting BLE scan for {} seconds...", duration.as_secs());
    adapter.start_scan(ScanFilter::default()).await?;
    sleep(duration).await;
    adapter.stop_scan().await?;

    let mut found = Vec::new();
    for peripheral in adapter.peripherals().await? {
        match identify(&peripheral).await {
            Ok(Some(identity)) => found.push(identity),
            Ok(None) => {}
            Err(e) => debug!("Error processing peripheral: {}", e),
        }
    }

    info!("Scan complete. Found {} device(s)", found.len());
    Ok(found)
}

async fn identify(peripheral: &Peripheral) -> Result<Option<DeviceIdentity>, TransportError> {
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };
    let Some(name) = properties.local_name else {
        return Ok(None);
    };
    let id = peripheral_identifier(&properties.address.to_string(), &peripheral.id());
    Ok(Some(DeviceIdentity::new(id, name)))
}

/// Identifier for a peripheral.
///
/// macOS hides addresses (reporting 00:00:00:00:00:00), so the platform
/// peripheral id is used there instead.
fn peripheral_identifier(address: &str, id: &PeripheralId) -> String {
    choose_identifier(address, || {
        format!("{:?}", id)
            .trim_start_matches("PeripheralId(")
            .trim_end_matches(')')
            .to_string()
    })
}

fn choose_identifier(address: &str, platform_id: impl FnOnce() -> String) -> String {
    if address == "00:00:00:00:00:00" {
        platform_id()
    } else {
        address.to_string()
    }
}

type PeripheralMap = Arc<Mutex<HashMap<u64, Peripheral>>>;

fn lock_map(map: &PeripheralMap) -> MutexGuard<'_, HashMap<u64, Peripheral>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Disconnect `peripheral` in the background if it is still connected.
fn release(peripheral: Peripheral) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("No runtime to release peripheral {:?}", peripheral.id());
        return;
    };
    handle.spawn(async move {
        if peripheral.is_connected().await.unwrap_or(false)
            && let Err(e) = peripheral.disconnect().await
        {
            warn!("Failed to release abandoned connection: {}", e);
        }
    });
}

/// Runs its cleanup on drop unless defused.
///
/// Armed across a connect so a caller that times out or cancels mid-connect
/// does not leave an untracked radio link behind.
struct ConnectCleanup<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> ConnectCleanup<F> {
    fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    fn defuse(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for ConnectCleanup<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// [`Transport`] over the first local Bluetooth adapter.
pub struct BleTransport {
    adapter: Adapter,
    scan_duration: Duration,
    next_link_id: AtomicU64,
    peripherals: PeripheralMap,
}

impl BleTransport {
    /// Open the first available adapter.
    pub async fn new() -> Result<Self, TransportError> {
        Ok(Self::with_adapter(get_adapter().await?))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            scan_duration: DEFAULT_SCAN_DURATION,
            next_link_id: AtomicU64::new(1),
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Set how long to scan when the target is not yet known to the adapter.
    #[must_use]
    pub fn scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    async fn find(&self, device_id: &str) -> Result<Option<Peripheral>, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            let id = peripheral_identifier(&properties.address.to_string(), &peripheral.id());
            if id.eq_ignore_ascii_case(device_id) {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn locate(&self, device_id: &str) -> Result<Peripheral, TransportError> {
        if let Some(peripheral) = self.find(device_id).await? {
            return Ok(peripheral);
        }

        debug!("{} not cached; scanning", device_id);
        self.adapter.start_scan(ScanFilter::default()).await?;
        sleep(self.scan_duration).await;
        self.adapter.stop_scan().await?;

        self.find(device_id)
            .await?
            .ok_or_else(|| TransportError::NotFound(device_id.to_string()))
    }

    async fn forward_disconnects(&self, peripheral_id: PeripheralId, tx: LinkEventSender) {
        let mut events = match self.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Cannot watch adapter events: {}", e);
                return;
            }
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            let _ = tx.send(TransportEvent::Disconnected(DisconnectReason::OutOfRange));
                            break;
                        }
                        Some(_) => {}
                        None => {
                            let _ = tx.send(TransportEvent::Disconnected(DisconnectReason::LinkLost(
                                "adapter event stream ended".to_string(),
                            )));
                            break;
                        }
                    },
                }
            }
        });
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&self, device: &DeviceIdentity) -> Result<TransportLink, TransportError> {
        let peripheral = self.locate(&device.id).await?;
        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);

        let cleanup = ConnectCleanup::new({
            let peripheral = peripheral.clone();
            let peripherals = Arc::clone(&self.peripherals);
            move || {
                lock_map(&peripherals).remove(&link_id);
                release(peripheral);
            }
        });

        peripheral.connect().await?;
        lock_map(&self.peripherals).insert(link_id, peripheral.clone());

        let (link, tx) = TransportLink::channel(&device.id, link_id);
        self.forward_disconnects(peripheral.id(), tx).await;
        cleanup.defuse();

        info!("Connected to {}", device);
        Ok(link)
    }

    async fn disconnect(&self, link: &TransportLink) -> Result<(), TransportError> {
        let Some(peripheral) = lock_map(&self.peripherals).remove(&link.link_id()) else {
            return Ok(());
        };
        if peripheral.is_connected().await.unwrap_or(false) {
            peripheral.disconnect().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport")
            .field("scan_duration", &self.scan_duration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_prefers_address() {
        assert_eq!(
            choose_identifier("AA:BB:CC:DD:EE:FF", || "platform".to_string()),
            "AA:BB:CC:DD:EE:FF"
        );
        assert_eq!(
            choose_identifier("00:00:00:00:00:00", || "platform".to_string()),
            "platform"
        );
    }

    #[test]
    fn test_connect_cleanup_runs_unless_defused() {
        use std::sync::atomic::AtomicU32;

        let runs = Arc::new(AtomicU32::new(0));

        {
            let runs = Arc::clone(&runs);
            let _cleanup = ConnectCleanup::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let defused = ConnectCleanup::new({
            let runs = Arc::clone(&runs);
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        });
        defused.defuse();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_cleanup_runs_when_future_is_dropped() {
        use std::sync::atomic::AtomicBool;

        let cleaned = Arc::new(AtomicBool::new(false));
        let connect = {
            let cleaned = Arc::clone(&cleaned);
            async move {
                let cleanup = ConnectCleanup::new(move || cleaned.store(true, Ordering::SeqCst));
                std::future::pending::<()>().await;
                cleanup.defuse();
            }
        };

        let timed_out = tokio::time::timeout(Duration::from_millis(10), connect).await;
        assert!(timed_out.is_err());
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_btleplug_error_mapping() {
        assert_eq!(
            TransportError::from(btleplug::Error::PermissionDenied),
            TransportError::AdapterUnavailable
        );
        assert_eq!(
            TransportError::from(btleplug::Error::TimedOut(Duration::from_secs(1))),
            TransportError::Timeout
        );
        assert!(TransportError::from(btleplug::Error::NotConnected).is_retryable());
    }
}
