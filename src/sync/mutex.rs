//! Named asynchronous mutual exclusion.
//!
//! Two components that agree on a name serialize on the same gate without
//! holding a reference to each other. Acquisition is awaitable and FIFO;
//! release happens when the ownership guard drops, so it is reachable on
//! every exit path including panics and early returns.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::LockError;

/// Registry of name-keyed asynchronous mutexes.
#[derive(Default)]
pub struct NamedMutexes {
    entries: StdMutex<FxHashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Scoped ownership of one named mutex; dropping it releases the lock.
pub struct NamedMutexGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl NamedMutexGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl NamedMutexes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the named lock is free, then take ownership.
    pub async fn lock(&self, name: &str) -> NamedMutexGuard {
        let entry = self.entry(name);
        NamedMutexGuard {
            name: name.to_string(),
            _guard: entry.lock_owned().await,
        }
    }

    /// Like [`lock`](Self::lock) but gives up after `limit`.
    pub async fn lock_timeout(
        &self,
        name: &str,
        limit: Duration,
    ) -> Result<NamedMutexGuard, LockError> {
        let entry = self.entry(name);
        match tokio::time::timeout(limit, entry.lock_owned()).await {
            Ok(guard) => Ok(NamedMutexGuard {
                name: name.to_string(),
                _guard: guard,
            }),
            Err(_) => Err(LockError::Timeout {
                resource: name.to_string(),
                timeout: limit,
            }),
        }
    }

    fn entry(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Drop names nobody holds or waits on anymore.
        entries.retain(|_, m| Arc::strong_count(m) > 1);
        Arc::clone(entries.entry(name.to_string()).or_default())
    }

    #[cfg(test)]
    fn live_entries(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
