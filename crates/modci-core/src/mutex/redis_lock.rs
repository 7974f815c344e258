use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{deadline_after, BuildMutex, MutexError, MutexKey};

/// Deletes the key only if it still carries our token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed [`BuildMutex`].
///
/// Acquisition is `SET key token NX PX lease`, retried every
/// `poll_interval` until the deadline. Each holder writes a fresh token so
/// unlock never deletes a lock taken over after lease expiry.
// TODO: renew the lease while a build runs so `lease_ms` need not exceed
// the longest build.
pub struct RedisBuildMutex {
    conn: ConnectionManager,
    lease: Duration,
    poll_interval: Duration,
    unlock_script: redis::Script,
    tokens: Mutex<HashMap<String, String>>,
}

impl RedisBuildMutex {
    pub async fn connect(
        redis_url: &str,
        lease: Duration,
        poll_interval: Duration,
    ) -> Result<Self, MutexError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(conn, lease, poll_interval))
    }

    pub fn from_connection(conn: ConnectionManager, lease: Duration, poll_interval: Duration) -> Self {
        Self {
            conn,
            lease,
            poll_interval,
            unlock_script: redis::Script::new(UNLOCK_SCRIPT),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn set_if_absent(&self, key: &MutexKey, token: &str) -> Result<bool, MutexError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key.as_str())
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(self.lease.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl BuildMutex for RedisBuildMutex {
    async fn try_lock(&self, key: &MutexKey, timeout: Duration) -> Result<bool, MutexError> {
        let deadline = deadline_after(timeout);
        let token = Uuid::new_v4().to_string();

        loop {
            if self.set_if_absent(key, &token).await? {
                self.tokens().insert(key.as_str().to_string(), token);
                debug!(%key, lease_ms = self.lease.as_millis() as u64, "redis lock acquired");
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn unlock(&self, key: &MutexKey) -> Result<(), MutexError> {
        let token = self
            .tokens()
            .remove(key.as_str())
            .ok_or_else(|| MutexError::NotHeld {
                key: key.to_string(),
            })?;

        let mut conn = self.conn.clone();
        let deleted: i32 = self
            .unlock_script
            .key(key.as_str())
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            warn!(%key, "redis lock lease expired before release");
            return Err(MutexError::LeaseExpired {
                key: key.to_string(),
            });
        }
        debug!(%key, "redis lock released");
        Ok(())
    }
}
