//! De-duplication of pipeline triggers.
//!
//! Created once at service start and shared. Entries expire after the TTL,
//! checked on every admission and removed by a background sweeper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct TriggerThrottle {
    ttl: Duration,
    admitted: Mutex<HashMap<String, Instant>>,
}

impl TriggerThrottle {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            admitted: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn admitted(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.admitted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` if `key` was not admitted within the last TTL; records it.
    pub fn try_admit(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut admitted = self.admitted();
        match admitted.get(key) {
            Some(at) if now.duration_since(*at) < self.ttl => false,
            _ => {
                admitted.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget `key` so the next trigger is admitted.
    pub fn release(&self, key: &str) {
        self.admitted().remove(key);
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut admitted = self.admitted();
        let before = admitted.len();
        admitted.retain(|_, at| now.duration_since(*at) < self.ttl);
        before - admitted.len()
    }

    pub fn len(&self) -> usize {
        self.admitted().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep every `interval` until the throttle is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let throttle = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(throttle) = throttle.upgrade() else {
                    break;
                };
                let removed = throttle.sweep();
                if removed > 0 {
                    debug!(removed, "expired trigger entries swept");
                }
            }
        })
    }
}
