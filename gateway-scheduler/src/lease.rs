use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gateway_core::{AccountId, UserId};
use tracing::warn;

use crate::SchedulerInner;

/// A lease on one account's concurrency slot. Dropping it without calling
/// [`Lease::release`] still releases the slot and wakes the next waiter —
/// `Drop` spawns the async cleanup on the current runtime, the same
/// fallback a sync `Drop` impl needs whenever the resource it frees can
/// only be released through an `await`.
pub struct Lease {
    pub(crate) account_id: AccountId,
    pub(crate) user_id: UserId,
    pub(crate) inner: Arc<SchedulerInner>,
    pub(crate) released: AtomicBool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("account_id", &self.account_id)
            .field("user_id", &self.user_id)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl Lease {
    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Explicit async release. Prefer this over relying on `Drop` when the
    /// caller is already in an async context, since it avoids the
    /// spawn-a-task indirection.
    pub async fn release(self) {
        self.released.store(true, Ordering::SeqCst);
        self.inner.release(&self.account_id, &self.user_id).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let account_id = self.account_id.clone();
        let user_id = self.user_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    inner.release(&account_id, &user_id).await;
                });
            }
            Err(_) => {
                warn!("lease dropped outside a tokio runtime; slot will expire via TTL sweep");
            }
        }
    }
}
