//! Concurrency Slot Manager: per-account and per-user active-request
//! counters stored as TTL'd keys in `gateway-kv`, plus a sweeper that
//! resets counters abandoned by crashed requests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gateway_core::{AccountId, UserId};
use gateway_kv::KvStore;
use tracing::{debug, warn};

fn user_key(user_id: &UserId) -> String {
    format!("slot:user:{}", user_id.as_str())
}

fn account_key(account_id: &AccountId) -> String {
    format!("slot:account:{}", account_id.as_str())
}

pub struct ConcurrencySlots {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    /// Every key a slot was ever acquired under, so the sweeper knows what
    /// to check without a caller-supplied list. Never shrinks; a handful of
    /// stale string keys outliving their accounts is immaterial.
    known_keys: Mutex<HashSet<String>>,
}

impl ConcurrencySlots {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl, known_keys: Mutex::new(HashSet::new()) }
    }

    pub async fn try_acquire_user(&self, user_id: &UserId, limit: i64) -> bool {
        let key = user_key(user_id);
        self.known_keys.lock().unwrap().insert(key.clone());
        self.kv.incr_if_below(&key, limit, self.ttl).await.unwrap_or(false)
    }

    pub async fn try_acquire_account(&self, account_id: &AccountId, limit: i64) -> bool {
        let key = account_key(account_id);
        self.known_keys.lock().unwrap().insert(key.clone());
        self.kv.incr_if_below(&key, limit, self.ttl).await.unwrap_or(false)
    }

    /// Decrements both counters, clamped at zero. Idempotent — calling this
    /// twice for the same request is harmless since the floor is zero.
    pub async fn release(&self, account_id: &AccountId, user_id: &UserId) {
        let _ = self.kv.decr_clamped(&account_key(account_id)).await;
        let _ = self.kv.decr_clamped(&user_key(user_id)).await;
    }

    /// Releases only the per-user counter, used when a request gives up
    /// before any account slot was ever acquired.
    pub async fn release_user(&self, user_id: &UserId) {
        let _ = self.kv.decr_clamped(&user_key(user_id)).await;
    }

    pub async fn account_load(&self, account_id: &AccountId, concurrency_limit: i64) -> f64 {
        if concurrency_limit <= 0 {
            return 0.0;
        }
        let current = self.kv.get_counter(&account_key(account_id)).await.unwrap_or(0);
        current as f64 / concurrency_limit as f64
    }

    /// Runs until cancelled. A `interval` of zero disables the sweep,
    /// matching `slot_cleanup_interval=0` in the scheduling config. Sweeps
    /// every key a slot was ever acquired under (tracked in `known_keys`)
    /// rather than a caller-supplied list, since callers have no complete
    /// view of live user/account ids.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            debug!("concurrency slot sweeper disabled (slot_cleanup_interval=0)");
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let keys: Vec<String> = self.known_keys.lock().unwrap().iter().cloned().collect();
            for key in &keys {
                if let Err(err) = self.kv.reset_counter(key).await {
                    warn!(key, %err, "slot sweeper failed to reset counter");
                }
            }
        }
    }
}
