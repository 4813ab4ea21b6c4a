//! Test doubles for the ledger service and the persisted store, plus small
//! fixture builders. Only for tests; panics on malformed fixture input.

use async_trait::async_trait;
use ledgerlink_common::{
    AnchorRequest, BulkRequest, BulkResponse, EntityId, ExclusiveKind, FilterSet, MemoryStore,
    MetadataKind, Period, PeriodExpr, PeriodKey, PersistedStore, QueryKind, RemoteDataService,
    RemoteFailure, StoreError, ValueRequest,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Deterministic value the mock returns for a cell.
pub fn expected_value(kind: QueryKind, entity: &EntityId, period: &PeriodKey) -> f64 {
    let seed = entity
        .as_str()
        .bytes()
        .chain(period.as_str().bytes())
        .fold(17u64, |h, b| h.wrapping_mul(31).wrapping_add(u64::from(b)));
    let base = (seed % 100_000) as f64 / 100.0;
    match kind {
        QueryKind::Balance => base,
        QueryKind::Budget => base * 2.0,
    }
}

/// Deterministic value the mock returns for an exclusive computation.
pub fn expected_anchor(kind: ExclusiveKind, entity: &EntityId, anchor: Period) -> f64 {
    let offset = match kind {
        ExclusiveKind::PriorPeriodRollup => 1_000.0,
        ExclusiveKind::NetChange => 2_000.0,
        ExclusiveKind::ConsolidationAdjustment => 3_000.0,
    };
    offset + expected_value(QueryKind::Balance, entity, &PeriodKey::from(anchor))
}

#[derive(Default)]
struct Script {
    bulk_calls: Vec<BulkRequest>,
    anchor_calls: Vec<AnchorRequest>,
    metadata_calls: Vec<(MetadataKind, EntityId)>,
    fail_bulk: Vec<RemoteFailure>,
    fail_anchor: Vec<RemoteFailure>,
    entity_errors: HashMap<EntityId, String>,
    omitted: HashSet<(EntityId, PeriodKey)>,
    metadata: HashMap<(MetadataKind, EntityId), String>,
    universe: Vec<EntityId>,
}

/// Recording, scriptable [`RemoteDataService`].
///
/// Every cell answers with [`expected_value`] unless scripted otherwise.
/// Calls sleep for the configured latency on the Tokio clock, so paused-time
/// tests control exactly when responses land.
#[derive(Default)]
pub struct MockRemote {
    script: Mutex<Script>,
    latency: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Entities returned by slice-wide calls (no entities requested).
    pub fn with_universe(self, entities: &[&str]) -> Self {
        self.script.lock().universe = entities.iter().map(|e| entity(e)).collect();
        self
    }

    /// Fail the next whole bulk call.
    pub fn fail_next_bulk(&self, failure: RemoteFailure) {
        self.script.lock().fail_bulk.push(failure);
    }

    pub fn fail_next_anchor(&self, failure: RemoteFailure) {
        self.script.lock().fail_anchor.push(failure);
    }

    /// Report a per-entity error for `raw` in every bulk response.
    pub fn fail_entity(&self, raw: &str, message: &str) {
        self.script
            .lock()
            .entity_errors
            .insert(entity(raw), message.to_string());
    }

    pub fn clear_entity_errors(&self) {
        self.script.lock().entity_errors.clear();
    }

    /// Leave a cell out of responses without reporting an error.
    pub fn omit_cell(&self, raw: &str, period: PeriodKey) {
        self.script.lock().omitted.insert((entity(raw), period));
    }

    pub fn set_metadata(&self, kind: MetadataKind, raw: &str, payload: &str) {
        self.script
            .lock()
            .metadata
            .insert((kind, entity(raw)), payload.to_string());
    }

    pub fn bulk_calls(&self) -> Vec<BulkRequest> {
        self.script.lock().bulk_calls.clone()
    }

    pub fn bulk_count(&self) -> usize {
        self.script.lock().bulk_calls.len()
    }

    pub fn anchor_calls(&self) -> Vec<AnchorRequest> {
        self.script.lock().anchor_calls.clone()
    }

    pub fn metadata_count(&self) -> usize {
        self.script.lock().metadata_calls.len()
    }

    /// Most calls observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> ActiveCall<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let call = ActiveCall(&self.active);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        call
    }
}

struct ActiveCall<'a>(&'a AtomicUsize);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteDataService for MockRemote {
    async fn fetch_bulk(&self, request: BulkRequest) -> Result<BulkResponse, RemoteFailure> {
        let failure = {
            let mut script = self.script.lock();
            script.bulk_calls.push(request.clone());
            (!script.fail_bulk.is_empty()).then(|| script.fail_bulk.remove(0))
        };
        let _call = self.enter().await;
        if let Some(failure) = failure {
            return Err(failure);
        }

        let script = self.script.lock();
        let entities = if request.entities.is_empty() {
            script.universe.clone()
        } else {
            request.entities.clone()
        };
        let mut response = BulkResponse::new();
        for entity in entities {
            if let Some(message) = script.entity_errors.get(&entity) {
                response = response.with_error(entity, message.clone());
                continue;
            }
            for period in &request.periods {
                let key = period.key();
                if script.omitted.contains(&(entity.clone(), key.clone())) {
                    continue;
                }
                let v = expected_value(request.kind, &entity, &key);
                response.insert(entity.clone(), key, v);
            }
        }
        Ok(response)
    }

    async fn fetch_anchor(&self, request: AnchorRequest) -> Result<f64, RemoteFailure> {
        let failure = {
            let mut script = self.script.lock();
            script.anchor_calls.push(request.clone());
            (!script.fail_anchor.is_empty()).then(|| script.fail_anchor.remove(0))
        };
        let _call = self.enter().await;
        match failure {
            Some(failure) => Err(failure),
            None => Ok(expected_anchor(request.kind, &request.entity, request.anchor)),
        }
    }

    async fn fetch_metadata(
        &self,
        kind: MetadataKind,
        entity: &EntityId,
    ) -> Result<String, RemoteFailure> {
        let payload = {
            let mut script = self.script.lock();
            script.metadata_calls.push((kind, entity.clone()));
            script.metadata.get(&(kind, entity.clone())).cloned()
        };
        let _call = self.enter().await;
        payload.ok_or_else(|| RemoteFailure::new(format!("no {kind} for {entity}")))
    }
}

/// [`MemoryStore`] whose reads or writes can be switched to fail.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_reads: std::sync::Arc<AtomicBool>,
    fail_writes: std::sync::Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn fail_reads(&self, on: bool) {
        self.fail_reads.store(on, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

impl PersistedStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected read failure".into()));
        }
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".into()));
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".into()));
        }
        self.inner.remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.keys()
    }
}

pub fn entity(raw: &str) -> EntityId {
    EntityId::parse(raw).expect("fixture entity id")
}

pub fn period(year: i32, month: u32) -> Period {
    Period::new(year, month).expect("fixture period")
}

/// One single-period request per (entity, period), row-major.
pub fn grid_requests(
    kind: QueryKind,
    entities: &[&str],
    periods: &[Period],
    filters: &FilterSet,
) -> Vec<ValueRequest> {
    entities
        .iter()
        .flat_map(|e| {
            periods.iter().map(move |p| {
                ValueRequest::new(kind, entity(e), PeriodExpr::Single(*p), filters.clone())
            })
        })
        .collect()
}

/// Route engine logs to the test harness. Filtered by `RUST_LOG`; silent
/// unless set. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
