//! Reconnecting device-session controller for Ella wearables.
//!
//! This crate keeps one wearable connected: it remembers which device the
//! user bound, serializes connection attempts, retries with capped
//! exponential backoff after failures or link loss, and publishes the
//! connection state to any number of observers.
//!
//! # Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`ConnectionMutex`] | Single-flight guard for connect attempts, with bounded waits |
//! | [`DeviceRegistry`] | Discovered devices and the persisted binding |
//! | [`ConnectionSession`] | The state machine; sole owner of [`ConnectionState`] |
//! | [`ReconnectionScheduler`] | Periodic retries honoring [`BackoffPolicy`] |
//! | [`ObservableConnectionState`] | Selector-filtered change notifications |
//!
//! The radio and the preferences store are reached through the [`Transport`]
//! and [`PreferencesStore`] traits. [`MockTransport`] and
//! [`MemoryPreferences`] stand in for them in tests; the `ble` feature
//! provides a btleplug-backed transport.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ella_core::{
//!     ConnectionSession, ConnectionState, DeviceIdentity, FilePreferences, MockTransport,
//!     ReconnectionScheduler, SessionConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = ConnectionSession::with_preferences(
//!         Arc::new(MockTransport::new()),
//!         Arc::new(FilePreferences::default_location()),
//!         SessionConfig::default(),
//!     )?;
//!     session.registry().load().await?;
//!
//!     let _badge = session
//!         .observe()
//!         .subscribe(ConnectionState::is_connected, |connected| {
//!             println!("connected: {connected}");
//!         });
//!
//!     session
//!         .bind(DeviceIdentity::new("AA:BB:CC:DD:EE:FF", "Ella Pendant"), false)
//!         .await?;
//!
//!     let scheduler = ReconnectionScheduler::new(session.clone());
//!     scheduler.start();
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     scheduler.stop();
//!     session.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
#[cfg(feature = "ble")]
pub mod ble;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod mock;
pub mod mutex;
pub mod observable;
pub mod preferences;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod transport;

// Core exports
pub use backoff::BackoffPolicy;
pub use clock::Clock;
pub use config::{ConfigError, ConfigFile, SessionConfig, ValidationError, default_config_path};
pub use error::{Error, Result, TransportError};
pub use events::{EventDispatcher, EventReceiver, EventSender, SessionEvent};
pub use metrics::{ConnectionMetrics, ConnectionMetricsSnapshot};
pub use mock::MockTransport;
pub use mutex::{ConnectionGuard, ConnectionMutex};
pub use observable::{ObservableConnectionState, StateStream, Subscription};
pub use preferences::{
    FilePreferences, MemoryPreferences, PreferencesStore, default_preferences_path,
};
pub use registry::DeviceRegistry;
pub use scheduler::{ReconnectionScheduler, SkipReason, TickOutcome};
pub use session::{ConnectOutcome, ConnectionSession};
pub use transport::{Transport, TransportEvent, TransportLink};

#[cfg(feature = "ble")]
pub use ble::{BleTransport, scan_devices};

// Re-export from ella-types
pub use ella_types::{
    BoundDevice, ConnectionState, DeviceIdentity, DisconnectReason, ParseError, StateKind,
};
