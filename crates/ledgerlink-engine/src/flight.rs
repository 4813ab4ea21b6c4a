//! Single-flight execution.
//!
//! The first caller for a key registers a shared future before awaiting it;
//! every concurrent caller for the same key awaits that same future. The slot
//! is dropped once the future settles, and only if it is still the slot that
//! was registered (a later registration for the key is left alone).

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use ledgerlink_common::FetchError;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

struct Slot<V: Clone> {
    id: u64,
    fut: SharedFetch<V>,
}

#[derive(Debug)]
pub struct FlightOutcome<V> {
    pub result: Result<V, FetchError>,
    /// The caller attached to a flight someone else started.
    pub joined: bool,
}

pub struct SingleFlight<K, V: Clone> {
    slots: Mutex<FxHashMap<K, Slot<V>>>,
    next_id: AtomicU64,
    started: AtomicU64,
    joined: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            started: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Run `make()` for `key` unless a flight for `key` is already in the
    /// air, in which case its result is shared. `make` is only called when a
    /// new flight starts.
    pub async fn run<F>(&self, key: K, make: F) -> FlightOutcome<V>
    where
        F: FnOnce() -> BoxFuture<'static, Result<V, FetchError>>,
    {
        let (fut, id, joined) = {
            let mut slots = self.slots.lock();
            match slots.get(&key) {
                Some(slot) => (slot.fut.clone(), slot.id, true),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let fut = make().shared();
                    slots.insert(
                        key.clone(),
                        Slot {
                            id,
                            fut: fut.clone(),
                        },
                    );
                    (fut, id, false)
                }
            }
        };
        if joined {
            self.joined.fetch_add(1, Ordering::Relaxed);
        } else {
            self.started.fetch_add(1, Ordering::Relaxed);
        }

        let result = fut.await;

        let mut slots = self.slots.lock();
        if slots.get(&key).is_some_and(|s| s.id == id) {
            slots.remove(&key);
        }
        FlightOutcome { result, joined }
    }

    pub fn in_flight(&self, key: &K) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let flight: Arc<SingleFlight<String, f64>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let flight = flight.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                flight
                    .run("k".to_string(), move || {
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(7.0)
                        }
                        .boxed()
                    })
                    .await
            }));
        }
        let mut joined = 0;
        for t in tasks {
            let out = t.await.unwrap();
            assert_eq!(out.result.unwrap(), 7.0);
            joined += out.joined as usize;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(joined, 4);
        assert!(flight.is_empty());
    }

    #[tokio::test]
    async fn errors_are_shared_and_not_retained() {
        let flight: SingleFlight<u32, f64> = SingleFlight::new();
        let out = flight
            .run(1, || async { Err(FetchError::remote("boom")) }.boxed())
            .await;
        assert!(out.result.is_err());
        assert!(!flight.in_flight(&1));
        let out = flight.run(1, || async { Ok(2.0) }.boxed()).await;
        assert_eq!(out.result.unwrap(), 2.0);
        assert_eq!(flight.started(), 2);
    }
}
