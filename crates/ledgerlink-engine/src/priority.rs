//! Priority-ordered exclusive lock.
//!
//! One holder at a time. Waiters are served lowest priority number first,
//! FIFO within a priority. `clear` drops the holder and rejects every queued
//! waiter; tickets issued before the clear are ignored when released.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("priority lock was cleared while waiting")]
    Cancelled,
}

/// Proof of holding the lock. Hand it back with [`PriorityLock::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct Ticket {
    id: u64,
    generation: u64,
}

#[derive(Default)]
struct LockState {
    holder: Option<u64>,
    queue: BinaryHeap<Reverse<(u32, u64)>>,
    waiters: FxHashMap<u64, oneshot::Sender<Ticket>>,
    next_id: u64,
    generation: u64,
}

impl LockState {
    fn grant_next(&mut self) {
        while let Some(Reverse((_, id))) = self.queue.pop() {
            let Some(tx) = self.waiters.remove(&id) else {
                continue;
            };
            self.holder = Some(id);
            let ticket = Ticket {
                id,
                generation: self.generation,
            };
            if tx.send(ticket).is_ok() {
                return;
            }
            self.holder = None;
        }
    }
}

#[derive(Default)]
pub struct PriorityLock {
    state: Mutex<LockState>,
}

impl PriorityLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, priority: u32) -> Result<Ticket, LockError> {
        let (id, rx) = {
            let mut s = self.state.lock();
            let id = s.next_id;
            s.next_id += 1;
            if s.holder.is_none() && s.queue.is_empty() {
                s.holder = Some(id);
                return Ok(Ticket {
                    id,
                    generation: s.generation,
                });
            }
            let (tx, rx) = oneshot::channel();
            s.queue.push(Reverse((priority, id)));
            s.waiters.insert(id, tx);
            (id, rx)
        };
        let mut wait = QueuedWait {
            lock: self,
            id,
            rx,
            done: false,
        };
        let outcome = (&mut wait.rx).await;
        wait.done = true;
        outcome.map_err(|_| LockError::Cancelled)
    }

    pub async fn lock(&self, priority: u32) -> Result<PriorityGuard<'_>, LockError> {
        let ticket = self.acquire(priority).await?;
        Ok(PriorityGuard {
            lock: self,
            ticket: Some(ticket),
        })
    }

    /// Returns `false` for a ticket that no longer holds the lock.
    pub fn release(&self, ticket: Ticket) -> bool {
        let mut s = self.state.lock();
        if ticket.generation != s.generation || s.holder != Some(ticket.id) {
            return false;
        }
        s.holder = None;
        s.grant_next();
        true
    }

    /// Drop the holder and cancel every waiter. Returns the number cancelled.
    pub fn clear(&self) -> usize {
        let mut s = self.state.lock();
        s.generation += 1;
        s.holder = None;
        s.queue.clear();
        let cancelled = s.waiters.len();
        // Dropping the senders wakes each waiter with `Cancelled`.
        s.waiters.clear();
        cancelled
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// A queued acquire. If the acquiring future is dropped after the lock was
/// granted but before the ticket was read, the ticket is released here.
struct QueuedWait<'a> {
    lock: &'a PriorityLock,
    id: u64,
    rx: oneshot::Receiver<Ticket>,
    done: bool,
}

impl Drop for QueuedWait<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.lock.state.lock().waiters.remove(&self.id);
        if let Ok(ticket) = self.rx.try_recv() {
            self.lock.release(ticket);
        }
    }
}

/// Releases its ticket on drop.
pub struct PriorityGuard<'a> {
    lock: &'a PriorityLock,
    ticket: Option<Ticket>,
}

impl Drop for PriorityGuard<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.lock.release(ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn lower_priority_number_goes_first() {
        let lock = Arc::new(PriorityLock::new());
        let first = lock.acquire(5).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for (i, prio) in [(0, 2u32), (1, 0), (2, 1), (3, 0)] {
            let lock = lock.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _g = lock.lock(prio).await.unwrap();
                order.lock().push(i);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }));
            // Fix arrival order.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(lock.queued(), 4);
        assert!(lock.release(first));
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![1, 3, 2, 0]);
        assert!(!lock.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_waiters_and_ignores_stale_tickets() {
        let lock = Arc::new(PriorityLock::new());
        let held = lock.acquire(0).await.unwrap();
        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire(1).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(lock.clear(), 1);
        assert_eq!(waiter.await.unwrap(), Err(LockError::Cancelled));
        assert!(!lock.release(held));

        let fresh = lock.acquire(0).await.unwrap();
        assert!(lock.release(fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiter_does_not_wedge_the_lock() {
        let lock = Arc::new(PriorityLock::new());
        let held = lock.acquire(0).await.unwrap();
        let abandoned = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire(0).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        abandoned.abort();
        let _ = abandoned.await;
        assert!(lock.release(held));
        assert!(!lock.is_held());
        let again = tokio::time::timeout(Duration::from_millis(5), lock.acquire(3)).await;
        assert!(again.is_ok());
    }
}
