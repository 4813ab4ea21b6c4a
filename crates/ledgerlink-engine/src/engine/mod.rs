//! The batch engine service object.
//!
//! One [`BatchEngine`] per execution context owns every in-process structure:
//! caches, queues, claims, timers, locks and counters. Contexts that share a
//! [`PersistedStore`] coordinate through the precache manifest, the persisted
//! value cache and the event bus; nothing else is shared.

mod coordination;
mod dispatch;
mod exclusive;
mod metadata;

#[cfg(test)]
mod tests;

use ledgerlink_common::{
    BulkResponse, EntityId, ExclusiveKey, FetchError, FilterSet, MetadataKind, MetadataPayload,
    PersistedStore, QueryKind, RemoteDataService, ValueKey, ValueRequest,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::time::Instant;

use crate::bus::{EventBus, generate_context_id};
use crate::cache::CacheDomains;
use crate::claims::ClaimRegistry;
use crate::config::{ConfigError, EngineConfig};
use crate::flight::SingleFlight;
use crate::gate::{ConcurrencyGate, GateSnapshot};
use crate::grid::{ColumnBatcher, GridCandidate};
use crate::manifest::{ManifestSlot, PrecacheManifest};
use crate::mode::{ModeSwitch, ModeTransition};
use crate::persist::PersistedValueCache;
use crate::preload::PreloadQueue;
use crate::priority::PriorityLock;
use crate::queue::{CoalescingQueue, Waiter};
use crate::stats::{EngineStats, StatsSnapshot, bump};
use crate::timer::DebouncePolicy;
use crate::wave::EvaluatingSet;

/// Everything the dispatcher mutates, behind one lock so queue, build-mode
/// accumulation, claims and columns always move together.
pub(crate) struct DispatchState {
    pub queue: CoalescingQueue,
    pub build: CoalescingQueue,
    pub mode: ModeSwitch,
    pub claims: ClaimRegistry,
    pub columns: ColumnBatcher,
    pub evaluating: EvaluatingSet,
}

impl DispatchState {
    fn new(cfg: &EngineConfig) -> Self {
        Self {
            queue: CoalescingQueue::new(DebouncePolicy::new(
                cfg.debounce.quiet,
                Some(cfg.debounce.max_wait),
            )),
            build: CoalescingQueue::new(DebouncePolicy::new(
                cfg.build_mode.settle,
                cfg.build_mode.max_wait,
            )),
            mode: ModeSwitch::new(&cfg.build_mode),
            claims: ClaimRegistry::new(),
            columns: ColumnBatcher::new(cfg.grid.column_collect),
            evaluating: EvaluatingSet::new(cfg.evaluating_ttl),
        }
    }
}

pub(crate) struct EngineInner {
    pub config: EngineConfig,
    pub remote: Arc<dyn RemoteDataService>,
    pub caches: Mutex<CacheDomains>,
    pub state: Mutex<DispatchState>,
    pub preload_queue: Mutex<PreloadQueue>,
    pub persisted: Arc<PersistedValueCache>,
    pub manifest: PrecacheManifest,
    pub bus: EventBus,
    pub gate: ConcurrencyGate,
    pub priority: PriorityLock,
    pub bulk_flights: SingleFlight<String, Arc<BulkResponse>>,
    pub exclusive_flights: SingleFlight<ExclusiveKey, f64>,
    pub metadata_flights: SingleFlight<(MetadataKind, EntityId), MetadataPayload>,
    pub preload_flights: SingleFlight<ManifestSlot, usize>,
    pub stats: EngineStats,
}

/// Request-coalescing batch engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BatchEngine {
    inner: Arc<EngineInner>,
}

/// Construct an engine with a fresh context id.
pub fn new_engine(
    remote: Arc<dyn RemoteDataService>,
    store: Arc<dyn PersistedStore>,
    config: EngineConfig,
) -> Result<BatchEngine, ConfigError> {
    BatchEngine::new(remote, store, config)
}

impl BatchEngine {
    pub fn new(
        remote: Arc<dyn RemoteDataService>,
        store: Arc<dyn PersistedStore>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_context_id(remote, store, config, generate_context_id())
    }

    /// Like [`BatchEngine::new`] with an explicit context id for the event bus.
    pub fn with_context_id(
        remote: Arc<dyn RemoteDataService>,
        store: Arc<dyn PersistedStore>,
        config: EngineConfig,
        context_id: String,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let ns = config.persistence.namespace.clone();
        // Manifest and event writes shed cached values when the store is full.
        let persisted = Arc::new(PersistedValueCache::new(store.clone(), &config.persistence));
        let inner = EngineInner {
            caches: Mutex::new(CacheDomains::new(&config.cache)),
            state: Mutex::new(DispatchState::new(&config)),
            preload_queue: Mutex::new(PreloadQueue::new(
                DebouncePolicy::new(config.preload.quiet, Some(config.preload.max_wait)),
                config.preload.overflow_ceiling,
            )),
            manifest: PrecacheManifest::new(store.clone(), &ns, &config.manifest)
                .with_relief(persisted.clone()),
            bus: EventBus::new(store, &ns, context_id, config.persistence.event_retention)
                .with_relief(persisted.clone()),
            persisted,
            gate: ConcurrencyGate::new(config.concurrency.max_bulk_fetches),
            priority: PriorityLock::new(),
            bulk_flights: SingleFlight::new(),
            exclusive_flights: SingleFlight::new(),
            metadata_flights: SingleFlight::new(),
            preload_flights: SingleFlight::new(),
            stats: EngineStats::new(),
            remote,
            config,
        };
        tracing::debug!(context = inner.bus.context_id(), namespace = %ns, "batch engine created");
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn context_id(&self) -> &str {
        self.inner.bus.context_id()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.inner.stats.snapshot();
        snapshot.stale_manifest_reads += self.inner.manifest.stale_discards();
        snapshot.quota_evictions += self.inner.persisted.relieved();
        snapshot
    }

    pub fn gate(&self) -> GateSnapshot {
        self.inner.gate.snapshot()
    }

    pub fn is_build_mode(&self) -> bool {
        self.inner.state.lock().mode.is_active()
    }

    /// Requests parked in the debounce queue and the build-mode accumulation.
    pub fn pending(&self) -> usize {
        let st = self.inner.state.lock();
        st.queue.len() + st.build.len()
    }

    /// Keys with a remote fetch currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().claims.len()
    }

    pub fn manifest(&self) -> &PrecacheManifest {
        &self.inner.manifest
    }

    /// Cached value without any fetching.
    pub fn peek(&self, key: &ValueKey) -> Option<f64> {
        self.inner.caches.lock().values.get(key)
    }

    /// Normalize raw formula arguments and resolve the value.
    pub async fn value(
        &self,
        kind: QueryKind,
        entity: &str,
        period: &str,
        filters: FilterSet,
    ) -> Result<f64, FetchError> {
        let request = ValueRequest::parse(kind, entity, period, filters)?;
        self.get_value(request).await
    }

    /// Resolve one value: memory cache, persisted cache, a running preload
    /// for the slice, then the coalescing queue.
    pub async fn get_value(&self, request: ValueRequest) -> Result<f64, FetchError> {
        let inner = &self.inner;
        bump(&inner.stats.requests);
        let key = request.key();

        if let Some(v) = inner.caches.lock().values.get(&key) {
            bump(&inner.stats.memory_hits);
            return Ok(v);
        }
        if let Some(v) = self.persisted_lookup(&key) {
            bump(&inner.stats.persisted_hits);
            return Ok(v);
        }
        if let Some(v) = self.await_preload(&request, &key).await {
            bump(&inner.stats.preload_hits);
            return Ok(v);
        }

        bump(&inner.stats.misses);
        self.register_miss(request, key).wait().await
    }

    /// Persisted cache lookup; a hit is promoted into the memory cache.
    /// Store failures count as a miss.
    fn persisted_lookup(&self, key: &ValueKey) -> Option<f64> {
        match self.inner.persisted.get(key) {
            Ok(Some(v)) => {
                self.inner.caches.lock().values.set(key.clone(), v);
                Some(v)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "persisted cache read failed; treating as miss");
                None
            }
        }
    }

    fn register_miss(&self, request: ValueRequest, key: ValueKey) -> Waiter {
        let inner = &self.inner;
        let now = Instant::now();
        let mut st = inner.state.lock();

        if let Some(waiter) = st.claims.attach(&key) {
            bump(&inner.stats.claim_joins);
            return waiter;
        }
        // A fetch may have settled between the first cache check and taking
        // the state lock.
        if let Some(v) = inner.caches.lock().values.get(&key) {
            let (tx, waiter) = Waiter::channel();
            let _ = tx.send(Ok(v));
            return waiter;
        }

        if let Some(candidate) = GridCandidate::from_request(&key, &request) {
            st.evaluating.insert(candidate, now);
        }
        if st.mode.observe(now) == ModeTransition::Entered {
            bump(&inner.stats.build_mode_entries);
            let moved = st.queue.drain();
            tracing::debug!(migrated = moved.len(), "build mode on; queue folded into accumulation");
            for pending in moved {
                st.build.absorb(pending);
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let (waiter, merged) = if st.mode.is_active() {
            let out = st.build.enqueue(request);
            st.build.arm(spawn_on(&weak, |engine| async move {
                engine.flush_build().await;
            }));
            out
        } else {
            let out = st.queue.enqueue(request);
            st.queue.arm(spawn_on(&weak, |engine| async move {
                engine.flush_queue().await;
            }));
            out
        };
        if merged {
            bump(&inner.stats.queue_merges);
        }
        waiter
    }

    /// Flush everything immediately: the queue, the build-mode accumulation
    /// and every collecting column, including columns the flush itself
    /// opens. Returns once all resulting fetches settled.
    pub async fn flush_now(&self) {
        let batch = {
            let mut st = self.inner.state.lock();
            if st.mode.exit() {
                bump(&self.inner.stats.build_mode_exits);
            }
            let mut batch = st.queue.drain();
            batch.extend(st.build.drain());
            batch
        };
        self.dispatch(batch).await;
        let columns = self.inner.state.lock().columns.collecting_keys();
        futures::future::join_all(columns.into_iter().map(|c| self.flush_column(c))).await;
    }

    /// Drop every in-process cache, cancel queued work and release the
    /// priority lock. In-flight fetches still settle their own waiters.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.caches.lock().clear();
        let lock_waiters = inner.priority.clear();

        let err = FetchError::cancelled("engine reset");
        let mut rejected = 0;
        {
            let mut st = inner.state.lock();
            rejected += st.queue.reject_all(&err);
            rejected += st.build.reject_all(&err);
            for key in st.columns.cancel_collecting() {
                rejected += st.claims.reject(&key, err.clone());
            }
            st.evaluating.clear();
            if st.mode.exit() {
                bump(&inner.stats.build_mode_exits);
            }
        }
        inner.preload_queue.lock().reset();
        bump(&inner.stats.resets);
        tracing::info!(rejected, lock_waiters, "engine reset");
    }

    /// Remove everything this engine family persisted: manifest, version
    /// marker, persisted values and event logs. Also resets in-process state.
    pub fn clear_persisted(&self) -> Result<(), ledgerlink_common::StoreError> {
        self.reset();
        self.inner.manifest.clear()?;
        self.inner.persisted.clear()?;
        self.inner.bus.clear()?;
        tracing::info!("persisted state cleared");
        Ok(())
    }
}

/// Timer callback that spawns `job` on a live engine. Timers only hold a weak
/// reference; a dropped engine turns the callback into a no-op.
fn spawn_on<F, Fut>(weak: &Weak<EngineInner>, job: F) -> impl FnOnce() + Send + 'static
where
    F: FnOnce(BatchEngine) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak = weak.clone();
    move || {
        if let Some(inner) = weak.upgrade() {
            tokio::spawn(job(BatchEngine { inner }));
        }
    }
}
