//! Distributed ephemeral lock.
//!
//! A best-effort "try-acquire, run, release" primitive over a shared
//! [`SessionCache`]. Acquiring inserts `key -> key` with insert-if-absent;
//! the entry's TTL is the only expiry, so a holder that crashes before
//! releasing blocks the key for at most one TTL.
//!
//! There is no renewal and no fencing token. A body that outlives the TTL
//! can run concurrently with a second holder, so only idempotent actions
//! belong under this lock.

use std::future::Future;
use std::sync::Arc;

use keel_storage::SessionCache;
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};

/// Optimistic lock keyed by string, shared across processes through the
/// session cache.
#[derive(Clone)]
pub struct EphemeralLock {
    cache: Arc<dyn SessionCache>,
}

impl EphemeralLock {
    /// Build a lock over `cache`.
    #[must_use]
    pub fn new(cache: Arc<dyn SessionCache>) -> Self {
        Self { cache }
    }

    /// Run `on_acquired` while holding `key`, or `on_unavailable` if someone
    /// else holds it.
    ///
    /// The key is released after `on_acquired` finishes, whether it returns
    /// an error or not. If the returned future is dropped mid-body the key
    /// is released in the background.
    ///
    /// # Errors
    ///
    /// Returns the session cache's error if the acquire attempt fails, and
    /// otherwise whatever the chosen callback returns.
    pub async fn try_lock<T, A, AF, U, UF>(
        &self,
        key: &str,
        on_acquired: A,
        on_unavailable: U,
    ) -> PluginResult<T>
    where
        A: FnOnce() -> AF,
        AF: Future<Output = PluginResult<T>>,
        U: FnOnce() -> UF,
        UF: Future<Output = PluginResult<T>>,
    {
        if !self.cache.put_if_absent(key, key.to_string()).await? {
            debug!(key, "lock held elsewhere");
            return on_unavailable().await;
        }
        debug!(key, "lock acquired");

        let guard = LockGuard {
            held: Some((Arc::clone(&self.cache), key.to_string())),
        };
        let result = on_acquired().await;
        guard.release().await;
        result
    }

    /// Run `on_acquired` while holding `key`, failing with
    /// [`PluginError::LockUnavailable`] if it is held.
    ///
    /// # Errors
    ///
    /// See [`EphemeralLock::try_lock`].
    pub async fn lock_or_fail<T, A, AF>(&self, key: &str, on_acquired: A) -> PluginResult<T>
    where
        A: FnOnce() -> AF,
        AF: Future<Output = PluginResult<T>>,
    {
        self.try_lock(key, on_acquired, || async {
            Err(PluginError::LockUnavailable(key.to_string()))
        })
        .await
    }
}

impl std::fmt::Debug for EphemeralLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralLock").finish_non_exhaustive()
    }
}

/// Releases a held key, in the background if dropped without
/// [`LockGuard::release`].
struct LockGuard {
    held: Option<(Arc<dyn SessionCache>, String)>,
}

impl LockGuard {
    async fn release(mut self) {
        if let Some((cache, key)) = self.held.take() {
            remove(cache, key).await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some((cache, key)) = self.held.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(remove(cache, key));
            },
            Err(_) => warn!(key = %key, "no runtime to release lock, leaving it to expire"),
        }
    }
}

async fn remove(cache: Arc<dyn SessionCache>, key: String) {
    match cache.remove(&key).await {
        Ok(_) => debug!(key = %key, "lock released"),
        Err(e) => warn!(key = %key, error = %e, "failed to release lock, leaving it to expire"),
    }
}
