use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct Waiter {
    notify: Arc<Notify>,
}

/// A bounded FIFO waitlist. Each waiter gets its own [`Notify`] so a
/// release can wake exactly the front waiter instead of broadcasting to
/// everyone (no thundering herd).
pub struct Bucket {
    capacity: usize,
    waiters: Mutex<VecDeque<Waiter>>,
}

pub struct Ticket(Arc<Notify>);

impl Bucket {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, waiters: Mutex::new(VecDeque::new()) }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    /// Enqueues a new waiter, or `None` if the bucket is already at
    /// `capacity` (caller should surface `NoCapacity`).
    pub fn try_enqueue(&self) -> Option<Ticket> {
        let mut q = self.waiters.lock().unwrap();
        if q.len() >= self.capacity {
            return None;
        }
        let notify = Arc::new(Notify::new());
        q.push_back(Waiter { notify: notify.clone() });
        Some(Ticket(notify))
    }

    pub fn remove(&self, ticket: &Ticket) {
        let mut q = self.waiters.lock().unwrap();
        q.retain(|w| !Arc::ptr_eq(&w.notify, &ticket.0));
    }

    pub fn is_front(&self, ticket: &Ticket) -> bool {
        self.waiters.lock().unwrap().front().map(|w| Arc::ptr_eq(&w.notify, &ticket.0)).unwrap_or(false)
    }

    /// Wakes the current front waiter, if any. Called once per `Release`.
    pub fn wake_front(&self) {
        if let Some(front) = self.waiters.lock().unwrap().front() {
            front.notify.notify_one();
        }
    }

    pub async fn wait_for_wakeup(&self, ticket: &Ticket) {
        ticket.0.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_rejects_beyond_capacity() {
        let bucket = Bucket::new(1);
        let _first = bucket.try_enqueue().unwrap();
        assert!(bucket.try_enqueue().is_none());
    }

    #[test]
    fn remove_frees_capacity() {
        let bucket = Bucket::new(1);
        let first = bucket.try_enqueue().unwrap();
        bucket.remove(&first);
        assert!(bucket.try_enqueue().is_some());
    }

    #[tokio::test]
    async fn wake_front_only_notifies_first_waiter() {
        let bucket = Arc::new(Bucket::new(4));
        let first = bucket.try_enqueue().unwrap();
        let second = bucket.try_enqueue().unwrap();
        assert!(bucket.is_front(&first));
        assert!(!bucket.is_front(&second));

        bucket.wake_front();
        // The front ticket's notify should now be resolved.
        tokio::time::timeout(std::time::Duration::from_millis(50), bucket.wait_for_wakeup(&first))
            .await
            .expect("front waiter must be woken");
    }
}
