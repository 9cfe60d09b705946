//! Redis-backed deploy locks.
//!
//! One mutex per lab across the whole fleet: key `deploy_lock:<lab_id>`,
//! value `<agent_id>:<acquired_at_unix_seconds>`. A short TTL gives fast
//! crash recovery; a background extension task keeps the lock alive through
//! long deploys. Force release exists for operators clearing stuck state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use trellis_types::LockStatus;

const LOCK_KEY_PREFIX: &str = "deploy_lock:";
const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("could not acquire deploy lock for lab {lab_id} within {timeout:?}")]
    AcquisitionTimeout { lab_id: String, timeout: Duration },
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

pub struct DeployLockManager {
    client: redis::Client,
    agent_id: String,
    lock_ttl: Duration,
    extend_interval: Duration,
    /// Per-lab local mutexes so tasks on the same agent don't thrash Redis
    /// retrying against each other.
    local: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held lock. Dropping the guard stops the extension task; `release` should
/// be called for a clean owner-checked delete.
pub struct LockGuard {
    manager: Arc<DeployLockManager>,
    lab_id: String,
    _local: tokio::sync::OwnedMutexGuard<()>,
    extender: Option<tokio::task::JoinHandle<()>>,
}

fn lock_key(lab_id: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{lab_id}")
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Parse `<agent_id>:<acquired_at>`.
fn parse_lock_value(value: &str) -> (String, Option<i64>) {
    match value.split_once(':') {
        Some((owner, ts)) => (owner.to_string(), ts.parse().ok()),
        None => (value.to_string(), None),
    }
}

impl DeployLockManager {
    pub fn new(
        redis_url: &str,
        agent_id: &str,
        lock_ttl: Duration,
        extend_interval: Duration,
    ) -> Result<Self, LockError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            agent_id: agent_id.to_string(),
            lock_ttl,
            extend_interval,
            local: Mutex::new(HashMap::new()),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, LockError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn lock_value(&self) -> String {
        format!("{}:{}", self.agent_id, now_unix())
    }

    async fn local_lock(&self, lab_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.local.lock().await;
        locks
            .entry(lab_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the lab's lock, retrying every 500 ms until `timeout`.
    pub async fn acquire(
        self: &Arc<Self>,
        lab_id: &str,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let local = self.local_lock(lab_id).await.lock_owned().await;
        let mut conn = self.connection().await?;
        let key = lock_key(lab_id);
        let value = self.lock_value();
        let ttl_secs = self.lock_ttl.as_secs().max(1);

        let started = tokio::time::Instant::now();
        loop {
            let acquired: bool = redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query_async::<Option<String>>(&mut conn)
                .await?
                .is_some();

            if acquired {
                info!(lab_id = %lab_id, ttl_secs, "acquired deploy lock");
                break;
            }

            if started.elapsed() >= timeout {
                let holder: Option<String> = conn.get(&key).await?;
                let ttl: i64 = conn.ttl(&key).await?;
                warn!(
                    lab_id = %lab_id,
                    holder = ?holder,
                    ttl,
                    "deploy lock acquisition timed out"
                );
                return Err(LockError::AcquisitionTimeout {
                    lab_id: lab_id.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(ACQUIRE_RETRY_INTERVAL).await;
        }

        Ok(LockGuard {
            manager: Arc::clone(self),
            lab_id: lab_id.to_string(),
            _local: local,
            extender: None,
        })
    }

    /// Acquire with a background task re-arming the TTL every
    /// `extend_interval`. The extension stops when the guard drops.
    pub async fn acquire_with_heartbeat(
        self: &Arc<Self>,
        lab_id: &str,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let mut guard = self.acquire(lab_id, timeout).await?;

        let manager = Arc::clone(self);
        let lab = lab_id.to_string();
        let interval = self.extend_interval;
        guard.extender = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                match manager.extend(&lab).await {
                    Ok(true) => debug!(lab_id = %lab, "extended deploy lock"),
                    Ok(false) => {
                        warn!(lab_id = %lab, "could not extend deploy lock, it may have been force-released")
                    }
                    Err(err) => warn!(lab_id = %lab, error = %err, "lock extension failed"),
                }
            }
        }));
        Ok(guard)
    }

    /// Re-arm the TTL iff this agent still owns the lock.
    pub async fn extend(&self, lab_id: &str) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let key = lock_key(lab_id);
        let value: Option<String> = conn.get(&key).await?;
        match value {
            Some(current) if current.starts_with(&format!("{}:", self.agent_id)) => {
                let _: bool = conn.expire(&key, self.lock_ttl.as_secs() as i64).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Owner-checked release: delete only if the value still names this
    /// agent. A mismatch means someone force-released us.
    pub async fn release(&self, lab_id: &str) -> Result<(), LockError> {
        let mut conn = self.connection().await?;
        let key = lock_key(lab_id);
        let value: Option<String> = conn.get(&key).await?;
        match value {
            Some(current) if current.starts_with(&format!("{}:", self.agent_id)) => {
                let _: i64 = conn.del(&key).await?;
                info!(lab_id = %lab_id, "released deploy lock");
            }
            other => {
                warn!(
                    lab_id = %lab_id,
                    expected_owner = %self.agent_id,
                    found = ?other,
                    "deploy lock no longer ours, not deleting"
                );
            }
        }
        Ok(())
    }

    /// Unconditional delete for stuck recovery.
    pub async fn force_release(&self, lab_id: &str) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let key = lock_key(lab_id);
        let value: Option<String> = conn.get(&key).await?;
        if let Some(current) = &value {
            let ttl: i64 = conn.ttl(&key).await?;
            warn!(lab_id = %lab_id, owner = %current, ttl, "force-releasing deploy lock");
        }
        let deleted: i64 = conn.del(&key).await?;
        Ok(deleted > 0)
    }

    pub async fn status(&self, lab_id: &str) -> Result<LockStatus, LockError> {
        let mut conn = self.connection().await?;
        let key = lock_key(lab_id);
        let value: Option<String> = conn.get(&key).await?;
        let ttl: i64 = conn.ttl(&key).await?;

        let Some(value) = value.filter(|_| ttl >= 0) else {
            return Ok(LockStatus {
                lab_id: lab_id.to_string(),
                held: false,
                owner: None,
                age_seconds: 0.0,
                ttl: 0,
                is_stuck: false,
            });
        };

        let (owner, acquired_at) = parse_lock_value(&value);
        let age_seconds = match acquired_at {
            Some(ts) => (now_unix() - ts).max(0) as f64,
            None => (self.lock_ttl.as_secs() as i64 - ttl).max(0) as f64,
        };

        Ok(LockStatus {
            lab_id: lab_id.to_string(),
            held: true,
            owner: Some(owner),
            age_seconds,
            ttl,
            is_stuck: age_seconds > self.lock_ttl.as_secs_f64() * 0.9,
        })
    }

    pub async fn all_locks(&self) -> Result<Vec<LockStatus>, LockError> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(format!("{LOCK_KEY_PREFIX}*"))
                .await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut locks = Vec::new();
        for key in keys {
            let lab_id = key.trim_start_matches(LOCK_KEY_PREFIX).to_string();
            let status = self.status(&lab_id).await?;
            if status.held {
                locks.push(status);
            }
        }
        Ok(locks)
    }

    /// Delete locks this agent held before a crash. Run once at startup.
    pub async fn clear_own_locks(&self) -> Result<Vec<String>, LockError> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(format!("{LOCK_KEY_PREFIX}*"))
                .await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let prefix = format!("{}:", self.agent_id);
        let mut cleared = Vec::new();
        for key in keys {
            let value: Option<String> = conn.get(&key).await?;
            if value.is_some_and(|v| v.starts_with(&prefix)) {
                let _: i64 = conn.del(&key).await?;
                let lab_id = key.trim_start_matches(LOCK_KEY_PREFIX).to_string();
                info!(lab_id = %lab_id, "cleared orphaned deploy lock from previous run");
                cleared.push(lab_id);
            }
        }
        Ok(cleared)
    }
}

impl LockGuard {
    pub async fn release(mut self) {
        if let Some(extender) = self.extender.take() {
            extender.abort();
        }
        if let Err(err) = self.manager.release(&self.lab_id).await {
            warn!(lab_id = %self.lab_id, error = %err, "lock release failed");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Extension must never outlive the holder; the Redis key itself is
        // covered by the TTL if release was skipped.
        if let Some(extender) = self.extender.take() {
            extender.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_values_carry_owner_and_timestamp() {
        let (owner, ts) = parse_lock_value("agent-a:1722500000");
        assert_eq!(owner, "agent-a");
        assert_eq!(ts, Some(1_722_500_000));

        let (owner, ts) = parse_lock_value("legacy-value");
        assert_eq!(owner, "legacy-value");
        assert_eq!(ts, None);
    }

    #[test]
    fn lock_keys_are_namespaced() {
        assert_eq!(lock_key("lab-1"), "deploy_lock:lab-1");
    }
}
