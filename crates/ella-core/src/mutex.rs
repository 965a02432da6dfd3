//! Connection mutex with bounded acquisition.
//!
//! Several independent triggers can ask for a connection at the same time:
//! the reconnection timer, a manual "reconnect" button, an app-foreground
//! hook. [`ConnectionMutex`] makes sure only one of them runs a scan/connect
//! sequence. Waiting is always bounded; a caller that cannot get the lock in
//! time gets [`Error::Timeout`] back instead of hanging.
//!
//! The mutex is not reentrant. Every connection attempt goes through
//! [`crate::ConnectionSession::request_connect`], which acquires it exactly
//! once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{Instant, timeout};
use tracing::trace;

use crate::error::{Error, Result};

/// Serializes connection attempts for one bound device.
///
/// Cloning the mutex yields another handle to the same lock.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ella_core::ConnectionMutex;
///
/// # async fn example() -> ella_core::Result<()> {
/// let mutex = ConnectionMutex::new();
/// let guard = mutex.acquire(Duration::from_secs(10)).await?;
/// assert!(mutex.is_locked());
/// drop(guard);
/// assert!(!mutex.is_locked());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct ConnectionMutex {
    inner: Arc<Mutex<()>>,
}

impl ConnectionMutex {
    /// Create a new, unlocked mutex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock, giving up after `wait`.
    ///
    /// The returned guard releases the lock when dropped, including when the
    /// future holding it is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the lock is still held after `wait`.
    pub async fn acquire(&self, wait: Duration) -> Result<ConnectionGuard> {
        let started = Instant::now();
        match timeout(wait, Arc::clone(&self.inner).lock_owned()).await {
            Ok(guard) => {
                trace!("Connection mutex acquired after {:?}", started.elapsed());
                Ok(ConnectionGuard::new(guard))
            }
            Err(_) => {
                trace!("Connection mutex still held after {:?}", wait);
                Err(Error::timeout("acquire connection mutex", wait))
            }
        }
    }

    /// Take the lock only if it is free right now.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        Arc::clone(&self.inner)
            .try_lock_owned()
            .ok()
            .map(ConnectionGuard::new)
    }

    /// Whether some guard currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

impl fmt::Debug for ConnectionMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Scoped ownership of the [`ConnectionMutex`].
///
/// Dropping the guard releases the lock on every exit path.
#[must_use = "the connection mutex is released as soon as the guard is dropped"]
pub struct ConnectionGuard {
    _guard: OwnedMutexGuard<()>,
    acquired_at: Instant,
}

impl ConnectionGuard {
    fn new(guard: OwnedMutexGuard<()>) -> Self {
        Self {
            _guard: guard,
            acquired_at: Instant::now(),
        }
    }

    /// How long this guard has held the lock.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("held_for", &self.held_for())
            .finish()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        trace!("Connection mutex released after {:?}", self.held_for());
    }
}
