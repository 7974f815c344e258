use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::{deadline_after, BuildMutex, MutexError, MutexKey};

/// In-process [`BuildMutex`].
///
/// Exclusive within one process only. Counters are exposed so tests can
/// assert that every acquisition was released.
#[derive(Debug, Default)]
pub struct MemoryBuildMutex {
    held: Mutex<HashSet<String>>,
    released: Notify,
    acquisitions: AtomicU64,
    releases: AtomicU64,
}

impl MemoryBuildMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently held.
    pub fn held_count(&self) -> usize {
        self.held().len()
    }

    pub fn is_held(&self, key: &MutexKey) -> bool {
        self.held().contains(key.as_str())
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, key: &MutexKey) -> bool {
        let inserted = self.held().insert(key.as_str().to_string());
        if inserted {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
        }
        inserted
    }
}

#[async_trait]
impl BuildMutex for MemoryBuildMutex {
    async fn try_lock(&self, key: &MutexKey, timeout: Duration) -> Result<bool, MutexError> {
        let deadline = deadline_after(timeout);
        loop {
            // Register for wakeups before checking, so a release between the
            // check and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.acquire(key) {
                debug!(%key, "lock acquired");
                return Ok(true);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.acquire(key));
            }
        }
    }

    async fn unlock(&self, key: &MutexKey) -> Result<(), MutexError> {
        if !self.held().remove(key.as_str()) {
            return Err(MutexError::NotHeld {
                key: key.to_string(),
            });
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.released.notify_waiters();
        debug!(%key, "lock released");
        Ok(())
    }
}
