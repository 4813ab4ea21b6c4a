use ledgerlink_common::FetchError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct GateCounters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    admitted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSnapshot {
    pub capacity: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub peak: usize,
    pub admitted: u64,
}

/// Global cap on simultaneous remote fetches, admitted in FIFO order.
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<GateCounters>,
}

/// Held for the duration of one remote call. Dropping it admits the next waiter.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<GateCounters>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(GateCounters::default()),
        }
    }

    pub async fn acquire(&self) -> Result<GatePermit, FetchError> {
        self.counters.queued.fetch_add(1, Ordering::AcqRel);
        let permit = self.semaphore.clone().acquire_owned().await;
        self.counters.queued.fetch_sub(1, Ordering::AcqRel);
        let permit = permit.map_err(|_| FetchError::cancelled("concurrency gate closed"))?;

        let now = self.counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.peak.fetch_max(now, Ordering::AcqRel);
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(GatePermit {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            capacity: self.capacity,
            queued: self.counters.queued.load(Ordering::Acquire),
            in_flight: self.counters.in_flight.load(Ordering::Acquire),
            peak: self.counters.peak.load(Ordering::Acquire),
            admitted: self.counters.admitted.load(Ordering::Relaxed),
        }
    }
}
