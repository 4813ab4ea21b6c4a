use ledgerlink_common::{
    FetchError, FilterSet, MemoryStore, PeriodExpr, PersistedStore, QueryKind, ValueRequest,
};
use ledgerlink_testkit::{MockRemote, entity, init_tracing, period};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::{BuildModeConfig, EngineConfig};
use crate::engine::BatchEngine;

/// Defaults with build mode off, so each test controls exactly which
/// dispatch path a burst takes.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        build_mode: BuildModeConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub struct Harness {
    pub engine: BatchEngine,
    pub remote: Arc<MockRemote>,
    pub store: MemoryStore,
}

pub fn harness(config: EngineConfig) -> Harness {
    harness_with(MockRemote::new(), config)
}

pub fn harness_with(remote: MockRemote, config: EngineConfig) -> Harness {
    init_tracing();
    let remote = Arc::new(remote);
    let store = MemoryStore::new();
    let engine = BatchEngine::new(
        remote.clone(),
        Arc::new(store.clone()) as Arc<dyn PersistedStore>,
        config,
    )
    .expect("valid test config");
    Harness {
        engine,
        remote,
        store,
    }
}

pub fn subsidiary() -> FilterSet {
    FilterSet::new().with_subsidiary("Parent Co")
}

pub fn balance(raw_entity: &str, year: i32, month: u32) -> ValueRequest {
    ValueRequest::new(
        QueryKind::Balance,
        entity(raw_entity),
        PeriodExpr::Single(period(year, month)),
        subsidiary(),
    )
}

pub fn spawn_get(engine: &BatchEngine, request: ValueRequest) -> JoinHandle<Result<f64, FetchError>> {
    let engine = engine.clone();
    tokio::spawn(async move { engine.get_value(request).await })
}

pub async fn join_all(handles: Vec<JoinHandle<Result<f64, FetchError>>>) -> Vec<Result<f64, FetchError>> {
    let mut out = Vec::with_capacity(handles.len());
    for h in handles {
        out.push(h.await.expect("request task panicked"));
    }
    out
}

pub fn expected(request: &ValueRequest) -> f64 {
    ledgerlink_testkit::expected_value(request.kind, &request.entity, &request.period.key())
}
