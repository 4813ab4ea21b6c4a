use super::common::*;
use ledgerlink_common::{FetchErrorKind, MemoryStore, PersistedStore, QueryKind, RemoteFailure};
use ledgerlink_testkit::{FlakyStore, MockRemote, init_tracing, period};
use std::sync::Arc;
use std::time::Duration;

use crate::bus::PreloadSlot;
use crate::config::{EngineConfig, ManifestConfig, PreloadConfig};
use crate::engine::BatchEngine;
use crate::manifest::ManifestStatus;

fn january() -> PreloadSlot {
    PreloadSlot::new(QueryKind::Balance, subsidiary(), period(2025, 1))
}

fn status(h: &Harness, slot: &PreloadSlot) -> Option<ManifestStatus> {
    h.engine
        .manifest()
        .entry(&slot.manifest_slot())
        .unwrap()
        .map(|e| e.status)
}

#[tokio::test(start_paused = true)]
async fn preload_warms_the_whole_slice() {
    let remote = MockRemote::new().with_universe(&["1000", "2000", "3000"]);
    let h = harness_with(remote, test_config());
    let cached = h.engine.run_preload(january()).await.unwrap();

    assert_eq!(cached, 3);
    assert_eq!(status(&h, &january()), Some(ManifestStatus::Completed));
    let req = balance("2000", 2025, 1);
    assert_eq!(h.engine.get_value(req.clone()).await.unwrap(), expected(&req));
    assert_eq!(h.remote.bulk_count(), 1);
    assert!(h.remote.bulk_calls()[0].entities.is_empty());
    assert_eq!(h.engine.stats().memory_hits, 1);
    assert_eq!(h.engine.stats().persisted_writes, 1);
}

#[tokio::test(start_paused = true)]
async fn miss_waits_for_a_running_preload() {
    let remote = MockRemote::with_latency(Duration::from_millis(300)).with_universe(&["1000", "2000"]);
    let h = harness_with(remote, test_config());
    let engine = h.engine.clone();
    let preload = tokio::spawn(async move { engine.run_preload(january()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(status(&h, &january()), Some(ManifestStatus::Running));

    let req = balance("2000", 2025, 1);
    assert_eq!(h.engine.get_value(req.clone()).await.unwrap(), expected(&req));
    assert_eq!(preload.await.unwrap().unwrap(), 2);
    assert_eq!(h.remote.bulk_count(), 1);
    let stats = h.engine.stats();
    assert_eq!(stats.preload_waits, 1);
    assert_eq!(stats.preload_hits, 1);
    assert_eq!(stats.misses, 0);
}

#[tokio::test(start_paused = true)]
async fn signals_coalesce_into_one_flush() {
    let h = harness_with(MockRemote::new().with_universe(&["1000"]), test_config());
    assert!(h.engine.request_preload(january()).unwrap());
    assert!(!h.engine.request_preload(january()).unwrap());
    assert!(!h.engine.request_preload(january()).unwrap());
    assert_eq!(status(&h, &january()), None);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(status(&h, &january()), Some(ManifestStatus::Completed));
    assert_eq!(h.remote.bulk_count(), 1);
    assert_eq!(h.engine.stats().preloads_run, 1);
}

#[tokio::test(start_paused = true)]
async fn kill_switch_refuses_until_drained() {
    let cfg = EngineConfig {
        preload: PreloadConfig {
            overflow_ceiling: 2,
            ..Default::default()
        },
        ..test_config()
    };
    let h = harness(cfg);
    let slot = |m| PreloadSlot::new(QueryKind::Balance, subsidiary(), period(2025, m));
    assert!(h.engine.request_preload(slot(1)).unwrap());
    assert!(h.engine.request_preload(slot(2)).unwrap());
    let err = h.engine.request_preload(slot(3)).unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::QueueOverflow);
    // Still tripped, even for a slot that is already queued.
    assert!(h.engine.request_preload(slot(1)).is_err());
    assert_eq!(h.engine.stats().overflow_rejections, 2);

    assert_eq!(h.engine.flush_preloads().await, 2);
    assert!(h.engine.request_preload(slot(3)).unwrap());
}

#[tokio::test(start_paused = true)]
async fn failed_preload_is_retried_up_to_the_ceiling() {
    let cfg = EngineConfig {
        manifest: ManifestConfig {
            max_attempts: 2,
            ..Default::default()
        },
        ..test_config()
    };
    let h = harness_with(MockRemote::new().with_universe(&["1000"]), cfg);
    h.remote.fail_next_bulk(RemoteFailure::new("timeout"));
    h.remote.fail_next_bulk(RemoteFailure::new("timeout"));

    assert!(h.engine.run_preload(january()).await.is_err());
    let entry = h.engine.manifest().entry(&january().manifest_slot()).unwrap().unwrap();
    assert_eq!(entry.status, ManifestStatus::Failed);
    assert_eq!(entry.attempt_count, 1);
    assert_eq!(entry.last_error.as_deref(), Some("#REMOTE!: timeout"));

    assert!(h.engine.run_preload(january()).await.is_err());
    // Past the ceiling: no third attempt.
    assert_eq!(h.engine.run_preload(january()).await.unwrap(), 0);
    assert_eq!(h.remote.bulk_count(), 2);

    // Misses no longer wait on the slice and fetch directly.
    let req = balance("1000", 2025, 1);
    assert_eq!(h.engine.get_value(req.clone()).await.unwrap(), expected(&req));
    assert_eq!(h.engine.stats().preload_waits, 0);
    assert_eq!(h.remote.bulk_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn miss_on_a_failed_slice_requests_it_again_and_waits() {
    let cfg = EngineConfig {
        manifest: ManifestConfig {
            max_attempts: 3,
            ..Default::default()
        },
        ..test_config()
    };
    let h = harness_with(MockRemote::new().with_universe(&["1000"]), cfg);
    h.remote.fail_next_bulk(RemoteFailure::new("timeout"));
    assert!(h.engine.run_preload(january()).await.is_err());
    assert_eq!(status(&h, &january()), Some(ManifestStatus::Failed));

    let req = balance("1000", 2025, 1);
    assert_eq!(h.engine.get_value(req.clone()).await.unwrap(), expected(&req));
    // The second call is the slice again, not a row fetch for the miss.
    assert_eq!(h.remote.bulk_count(), 2);
    assert!(h.remote.bulk_calls()[1].entities.is_empty());
    let stats = h.engine.stats();
    assert_eq!(stats.preload_waits, 1);
    assert_eq!(stats.preload_hits, 1);
    assert_eq!(stats.misses, 0);
    let entry = h.engine.manifest().entry(&january().manifest_slot()).unwrap().unwrap();
    assert_eq!(entry.status, ManifestStatus::Completed);
    assert_eq!(entry.attempt_count, 1);
}

#[tokio::test(start_paused = true)]
async fn preload_flush_over_quota_sheds_persisted_values() {
    let universe: Vec<String> = (0..40).map(|i| format!("{}", 1000 + i)).collect();
    let universe: Vec<&str> = universe.iter().map(String::as_str).collect();
    let cfg = EngineConfig {
        preload: PreloadConfig {
            execute_locally: false,
            ..Default::default()
        },
        ..test_config()
    };
    let h = harness_with(MockRemote::new().with_universe(&universe), cfg);
    assert_eq!(h.engine.run_preload(january()).await.unwrap(), 40);
    h.store.set_quota(Some(h.store.used_bytes() + 50));

    let february = PreloadSlot::new(QueryKind::Balance, subsidiary(), period(2025, 2));
    assert!(h.engine.request_preload(february.clone()).unwrap());
    assert_eq!(h.engine.flush_preloads().await, 1);
    assert_eq!(status(&h, &february), Some(ManifestStatus::Requested));
    assert!(h.engine.stats().quota_evictions >= 10);
}

#[tokio::test(start_paused = true)]
async fn failed_flush_keeps_signals_queued() {
    init_tracing();
    let store = FlakyStore::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::new().with_universe(&["1000"]));
    let engine = BatchEngine::new(
        remote.clone(),
        Arc::new(store.clone()) as Arc<dyn PersistedStore>,
        test_config(),
    )
    .unwrap();
    let slot_status = || {
        engine
            .manifest()
            .entry(&january().manifest_slot())
            .unwrap()
            .map(|e| e.status)
    };

    assert!(engine.request_preload(january()).unwrap());
    store.fail_writes(true);
    assert_eq!(engine.flush_preloads().await, 0);
    assert_eq!(slot_status(), None);
    // Still queued, so a repeat signal is absorbed.
    assert!(!engine.request_preload(january()).unwrap());

    store.fail_writes(false);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(slot_status(), Some(ManifestStatus::Completed));
    assert_eq!(remote.bulk_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn completed_slice_without_the_value_is_an_inconsistency() {
    let h = harness_with(MockRemote::new().with_universe(&["1000"]), test_config());
    h.engine.run_preload(january()).await.unwrap();

    let req = balance("9999", 2025, 1);
    let start = tokio::time::Instant::now();
    assert_eq!(h.engine.get_value(req.clone()).await.unwrap(), expected(&req));
    // Three re-checks with 100ms between them, then the direct fetch.
    assert!(start.elapsed() >= Duration::from_millis(300));
    let stats = h.engine.stats();
    assert_eq!(stats.inconsistencies, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(h.remote.bulk_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn preloads_for_one_kind_do_not_cover_another() {
    let h = harness_with(MockRemote::new().with_universe(&["1000"]), test_config());
    h.engine.run_preload(january()).await.unwrap();
    let budget = PreloadSlot::new(QueryKind::Budget, subsidiary(), period(2025, 1));
    assert_eq!(status(&h, &budget), None);
}
