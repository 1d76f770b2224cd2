//! Per-queue wait registries for suspended receive calls.

use std::collections::VecDeque;

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::metrics::LongPollMetrics;

struct Waiter {
    id: Uuid,
    permit: oneshot::Sender<()>,
}

/// Handle held by a suspended receive call.
pub struct WaitTicket {
    pub id: Uuid,
    pub permit: oneshot::Receiver<()>,
}

/// Registry of pending long-poll waiters keyed by queue ARN.
///
/// A notification is a permit, not a broadcast: `notify_one` releases at
/// most one waiter, spreading arrivals across blocked consumers instead
/// of waking the herd to race for one message.
pub struct WaitRegistry {
    waiters: DashMap<String, VecDeque<Waiter>>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self {
            waiters: DashMap::new(),
        }
    }

    /// Register a waiter for the queue ARN. The caller must either be
    /// woken, time out and `cancel`, or be drained at shutdown.
    pub fn register(&self, arn: &str) -> WaitTicket {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        self.waiters
            .entry(arn.to_string())
            .or_default()
            .push_back(Waiter { id, permit: tx });
        LongPollMetrics::record_registered();
        WaitTicket { id, permit: rx }
    }

    /// Wake at most one pending waiter. Waiters whose receive side has
    /// already gone away (timed out) are discarded until a live one
    /// accepts the permit.
    pub fn notify_one(&self, arn: &str) -> bool {
        let Some(mut queue) = self.waiters.get_mut(arn) else {
            return false;
        };
        while let Some(waiter) = queue.pop_front() {
            LongPollMetrics::record_completed();
            if waiter.permit.send(()).is_ok() {
                return true;
            }
        }
        false
    }

    /// Remove a waiter that timed out or was abandoned.
    pub fn cancel(&self, arn: &str, id: Uuid) {
        if let Some(mut queue) = self.waiters.get_mut(arn) {
            if let Some(pos) = queue.iter().position(|w| w.id == id) {
                queue.remove(pos);
                LongPollMetrics::record_completed();
            }
        }
    }

    /// Wake every pending waiter (process shutdown). Each suspended call
    /// re-checks its queue and completes, normally with an empty result.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        for mut entry in self.waiters.iter_mut() {
            while let Some(waiter) = entry.value_mut().pop_front() {
                LongPollMetrics::record_completed();
                let _ = waiter.permit.send(());
                drained += 1;
            }
        }
        drained
    }

    pub fn waiting(&self, arn: &str) -> usize {
        self.waiters.get(arn).map(|q| q.len()).unwrap_or(0)
    }

    pub fn total_waiting(&self) -> usize {
        self.waiters.iter().map(|q| q.len()).sum()
    }
}

impl Default for WaitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARN: &str = "arn:hxmq:dc1:123:orders";

    #[tokio::test]
    async fn test_notify_wakes_exactly_one() {
        let registry = WaitRegistry::new();
        let mut first = registry.register(ARN);
        let mut second = registry.register(ARN);
        assert_eq!(registry.waiting(ARN), 2);

        assert!(registry.notify_one(ARN));
        assert!(first.permit.try_recv().is_ok());
        assert!(second.permit.try_recv().is_err());
        assert_eq!(registry.waiting(ARN), 1);
    }

    #[tokio::test]
    async fn test_notify_skips_dead_waiters() {
        let registry = WaitRegistry::new();
        let dead = registry.register(ARN);
        drop(dead.permit);
        let mut live = registry.register(ARN);

        assert!(registry.notify_one(ARN));
        assert!(live.permit.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_notify_without_waiters() {
        let registry = WaitRegistry::new();
        assert!(!registry.notify_one(ARN));
    }

    #[tokio::test]
    async fn test_cancel_removes_waiter() {
        let registry = WaitRegistry::new();
        let ticket = registry.register(ARN);
        registry.cancel(ARN, ticket.id);
        assert_eq!(registry.waiting(ARN), 0);
        assert!(!registry.notify_one(ARN));
    }

    #[tokio::test]
    async fn test_drain_wakes_everyone() {
        let registry = WaitRegistry::new();
        let mut a = registry.register(ARN);
        let mut b = registry.register("arn:hxmq:dc1:123:other");

        assert_eq!(registry.drain(), 2);
        assert!(a.permit.try_recv().is_ok());
        assert!(b.permit.try_recv().is_ok());
        assert_eq!(registry.total_waiting(), 0);
    }

    #[tokio::test]
    async fn test_fifo_wake_order() {
        let registry = WaitRegistry::new();
        let mut first = registry.register(ARN);
        let mut second = registry.register(ARN);

        registry.notify_one(ARN);
        registry.notify_one(ARN);

        assert!(first.permit.try_recv().is_ok());
        assert!(second.permit.try_recv().is_ok());
    }
}
