//! Coalescing request queue.
//!
//! Misses are parked here keyed by [`ValueKey`]; a second miss for a key that
//! is already queued attaches another waiter instead of adding an entry. The
//! queue hands out requests in arrival order when drained.

use ledgerlink_common::{FetchError, ValueKey, ValueRequest};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::timer::{DebouncePolicy, DebounceTimer};

pub type ValueResult = Result<f64, FetchError>;

/// Receiving half handed back to a caller. Resolves exactly once.
#[derive(Debug)]
pub struct Waiter {
    rx: oneshot::Receiver<ValueResult>,
}

impl Waiter {
    pub fn channel() -> (oneshot::Sender<ValueResult>, Waiter) {
        let (tx, rx) = oneshot::channel();
        (tx, Waiter { rx })
    }

    pub async fn wait(self) -> ValueResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(FetchError::cancelled("request dropped before it settled")),
        }
    }
}

/// A queued or in-flight request with every caller waiting on it.
#[derive(Debug)]
pub struct PendingRequest {
    pub key: ValueKey,
    pub request: ValueRequest,
    waiters: SmallVec<[oneshot::Sender<ValueResult>; 2]>,
    pub created_at: Instant,
}

impl PendingRequest {
    pub fn new(key: ValueKey, request: ValueRequest) -> (Self, Waiter) {
        let (tx, waiter) = Waiter::channel();
        let mut waiters = SmallVec::new();
        waiters.push(tx);
        (
            Self {
                key,
                request,
                waiters,
                created_at: Instant::now(),
            },
            waiter,
        )
    }

    pub fn attach(&mut self) -> Waiter {
        let (tx, waiter) = Waiter::channel();
        self.waiters.push(tx);
        waiter
    }

    /// Move every waiter of `other` onto this request.
    pub fn absorb(&mut self, other: PendingRequest) {
        self.waiters.extend(other.waiters);
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn settle(self, result: ValueResult) -> usize {
        let n = self.waiters.len();
        for tx in self.waiters {
            // Receiver may have given up; nothing to do then.
            let _ = tx.send(result.clone());
        }
        n
    }

    pub fn resolve(self, value: f64) -> usize {
        self.settle(Ok(value))
    }

    pub fn reject(self, error: FetchError) -> usize {
        let key = self.key.to_string();
        let error = if error.key.is_none() {
            error.with_key(key)
        } else {
            error
        };
        self.settle(Err(error))
    }
}

/// Keyed, insertion-ordered request queue with its own debounce timer.
pub struct CoalescingQueue {
    pending: FxHashMap<ValueKey, PendingRequest>,
    order: Vec<ValueKey>,
    timer: DebounceTimer,
}

impl CoalescingQueue {
    pub fn new(policy: DebouncePolicy) -> Self {
        Self {
            pending: FxHashMap::default(),
            order: Vec::new(),
            timer: DebounceTimer::new(policy),
        }
    }

    /// Queue a request. Returns the caller's waiter and whether it merged into
    /// an entry that was already queued.
    pub fn enqueue(&mut self, request: ValueRequest) -> (Waiter, bool) {
        let key = request.key();
        if let Some(existing) = self.pending.get_mut(&key) {
            return (existing.attach(), true);
        }
        let (pending, waiter) = PendingRequest::new(key.clone(), request);
        self.order.push(key.clone());
        self.pending.insert(key, pending);
        (waiter, false)
    }

    /// Add an already-waited-on request, merging waiters on key collision.
    pub fn absorb(&mut self, request: PendingRequest) {
        match self.pending.get_mut(&request.key) {
            Some(existing) => existing.absorb(request),
            None => {
                self.order.push(request.key.clone());
                self.pending.insert(request.key.clone(), request);
            }
        }
    }

    pub fn arm<F>(&mut self, on_fire: F) -> Instant
    where
        F: FnOnce() + Send + 'static,
    {
        self.timer.arm(on_fire)
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_armed()
    }

    /// Take every queued request in arrival order and close the timer window.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.timer.cancel();
        let mut out = Vec::with_capacity(self.order.len());
        for key in self.order.drain(..) {
            if let Some(p) = self.pending.remove(&key) {
                out.push(p);
            }
        }
        out
    }

    /// Reject everything queued. Returns the number of waiters notified.
    pub fn reject_all(&mut self, error: &FetchError) -> usize {
        self.drain()
            .into_iter()
            .map(|p| p.reject(error.clone()))
            .sum()
    }

    pub fn contains(&self, key: &ValueKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerlink_common::{FilterSet, QueryKind};
    use std::time::Duration;

    fn req(entity: &str, period: &str) -> ValueRequest {
        ValueRequest::parse(QueryKind::Balance, entity, period, FilterSet::new()).unwrap()
    }

    fn queue() -> CoalescingQueue {
        CoalescingQueue::new(DebouncePolicy::new(Duration::from_millis(10), None))
    }

    #[tokio::test]
    async fn duplicate_keys_share_one_entry() {
        let mut q = queue();
        let (a, merged_a) = q.enqueue(req("4000", "Jan 2025"));
        let (b, merged_b) = q.enqueue(req("4000 - Revenue", "2025-01"));
        assert!(!merged_a);
        assert!(merged_b);
        assert_eq!(q.len(), 1);
        let drained = q.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].waiter_count(), 2);
        for p in drained {
            p.resolve(12.5);
        }
        assert_eq!(a.wait().await.unwrap(), 12.5);
        assert_eq!(b.wait().await.unwrap(), 12.5);
    }

    #[tokio::test]
    async fn drain_preserves_arrival_order() {
        let mut q = queue();
        for e in ["4020", "4000", "4010"] {
            q.enqueue(req(e, "Jan 2025"));
        }
        let order: Vec<_> = q
            .drain()
            .into_iter()
            .map(|p| p.request.entity.as_str().to_string())
            .collect();
        assert_eq!(order, ["4020", "4000", "4010"]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn reject_all_tags_errors_with_the_key() {
        let mut q = queue();
        let (w, _) = q.enqueue(req("4000", "Jan 2025"));
        assert_eq!(q.reject_all(&FetchError::cancelled("reset")), 1);
        let err = w.wait().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.key.unwrap().starts_with("balance:4000@2025-01"));
    }

    #[tokio::test]
    async fn dropped_sender_reads_as_cancelled() {
        let (tx, w) = Waiter::channel();
        drop(tx);
        assert!(w.wait().await.unwrap_err().is_cancelled());
    }
}
