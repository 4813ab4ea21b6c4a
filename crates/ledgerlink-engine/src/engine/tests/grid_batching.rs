use super::common::*;
use ledgerlink_common::{PeriodExpr, QueryKind};
use ledgerlink_testkit::{MockRemote, entity, grid_requests, period};
use std::time::Duration;

use crate::config::{EngineConfig, GridConfig};

#[tokio::test(start_paused = true)]
async fn three_by_three_grid_is_fetched_per_column() {
    let h = harness(test_config());
    let periods = [period(2025, 1), period(2025, 2), period(2025, 3)];
    let reqs = grid_requests(QueryKind::Balance, &["1000", "2000", "3000"], &periods, &subsidiary());
    let handles = reqs.iter().map(|r| spawn_get(&h.engine, r.clone())).collect();
    let results = join_all(handles).await;

    for (r, req) in results.iter().zip(&reqs) {
        assert_eq!(r.as_ref().unwrap(), &expected(req));
    }
    let mut calls = h.remote.bulk_calls();
    assert_eq!(calls.len(), 3);
    calls.sort_by_key(|c| c.periods[0]);
    for (call, p) in calls.iter().zip(periods) {
        assert_eq!(call.periods, vec![PeriodExpr::Single(p)]);
        assert_eq!(
            call.entities,
            vec![entity("1000"), entity("2000"), entity("3000")]
        );
    }
    let stats = h.engine.stats();
    assert_eq!(stats.grid_batches, 1);
    assert_eq!(stats.column_fetches, 3);
    assert_eq!(stats.row_fetches, 0);
}

#[tokio::test(start_paused = true)]
async fn single_period_burst_is_one_column() {
    let h = harness(test_config());
    let reqs = grid_requests(
        QueryKind::Budget,
        &["1000", "2000", "3000", "4000"],
        &[period(2025, 6)],
        &subsidiary(),
    );
    let handles = reqs.iter().map(|r| spawn_get(&h.engine, r.clone())).collect();
    let results = join_all(handles).await;

    assert!(results.iter().all(Result::is_ok));
    let calls = h.remote.bulk_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].kind, QueryKind::Budget);
    assert_eq!(calls[0].entities.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn late_entity_merges_into_collecting_column() {
    let cfg = EngineConfig {
        grid: GridConfig {
            column_collect: Duration::from_millis(300),
            ..Default::default()
        },
        ..test_config()
    };
    let h = harness(cfg);
    let mut handles: Vec<_> = ["1000", "2000", "3000"]
        .iter()
        .map(|e| spawn_get(&h.engine, balance(e, 2025, 1)))
        .collect();
    // First wave flushes at 150ms and its column collects until 450ms.
    tokio::time::sleep(Duration::from_millis(160)).await;
    assert_eq!(h.remote.bulk_count(), 0);
    handles.push(spawn_get(&h.engine, balance("4000", 2025, 1)));

    let results = join_all(handles).await;
    assert!(results.iter().all(Result::is_ok));
    let calls = h.remote.bulk_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].entities.len(), 4);
    assert_eq!(h.engine.stats().supplemental_fetches, 0);
}

#[tokio::test(start_paused = true)]
async fn entity_after_column_was_sent_gets_a_supplemental_fetch() {
    let h = harness_with(MockRemote::with_latency(Duration::from_millis(500)), test_config());
    let mut handles: Vec<_> = ["1000", "2000", "3000"]
        .iter()
        .map(|e| spawn_get(&h.engine, balance(e, 2025, 1)))
        .collect();
    // Column sent at 200ms, answered at 700ms.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.remote.bulk_count(), 1);
    handles.push(spawn_get(&h.engine, balance("4000", 2025, 1)));

    let results = join_all(handles).await;
    assert!(results.iter().all(Result::is_ok));
    let calls = h.remote.bulk_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].entities, vec![entity("4000")]);
    let stats = h.engine.stats();
    assert_eq!(stats.column_fetches, 1);
    assert_eq!(stats.supplemental_fetches, 1);
}

#[tokio::test(start_paused = true)]
async fn disabled_grid_fetches_per_entity() {
    let cfg = EngineConfig {
        grid: GridConfig {
            enabled: false,
            ..Default::default()
        },
        ..test_config()
    };
    let h = harness(cfg);
    let reqs = grid_requests(
        QueryKind::Balance,
        &["1000", "2000"],
        &[period(2025, 1), period(2025, 2)],
        &subsidiary(),
    );
    let handles = reqs.iter().map(|r| spawn_get(&h.engine, r.clone())).collect();
    assert!(join_all(handles).await.iter().all(Result::is_ok));

    let calls = h.remote.bulk_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.entities.len() == 1 && c.periods.len() == 2));
    assert_eq!(h.engine.stats().row_fetches, 2);
}

#[tokio::test(start_paused = true)]
async fn oversized_grid_falls_back_to_rows() {
    let cfg = EngineConfig {
        grid: GridConfig {
            max_entities: 2,
            ..Default::default()
        },
        ..test_config()
    };
    let h = harness(cfg);
    let reqs = grid_requests(
        QueryKind::Balance,
        &["1000", "2000", "3000"],
        &[period(2025, 1), period(2025, 2)],
        &subsidiary(),
    );
    let handles = reqs.iter().map(|r| spawn_get(&h.engine, r.clone())).collect();
    assert!(join_all(handles).await.iter().all(Result::is_ok));

    let stats = h.engine.stats();
    assert_eq!(stats.grid_rejections, 1);
    assert_eq!(stats.column_fetches, 0);
    assert_eq!(stats.row_fetches, 3);
}

#[tokio::test(start_paused = true)]
async fn column_failure_rejects_every_entity_in_it() {
    let h = harness(test_config());
    h.remote
        .fail_next_bulk(ledgerlink_common::RemoteFailure::new("rate limited"));
    let handles = ["1000", "2000"]
        .iter()
        .map(|e| spawn_get(&h.engine, balance(e, 2025, 1)))
        .collect();
    let results = join_all(handles).await;

    assert!(results.iter().all(|r| r.as_ref().is_err_and(|e| e.message.as_deref() == Some("rate limited"))));
    assert_eq!(h.engine.in_flight(), 0);
    // Nothing was cached, so a retry goes back to the service.
    assert!(h.engine.get_value(balance("1000", 2025, 1)).await.is_ok());
    assert_eq!(h.remote.bulk_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn in_flight_request_counts_toward_the_next_flush_grid() {
    let h = harness_with(MockRemote::with_latency(Duration::from_millis(500)), test_config());
    let first = spawn_get(&h.engine, balance("1000", 2025, 1));
    // First flush at 150ms sends 1000 alone; it is still in flight at 200ms.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.engine.in_flight(), 1);
    let second = spawn_get(&h.engine, balance("2000", 2025, 1));

    let results = join_all(vec![first, second]).await;
    assert_eq!(results[0].as_ref().unwrap(), &expected(&balance("1000", 2025, 1)));
    assert_eq!(results[1].as_ref().unwrap(), &expected(&balance("2000", 2025, 1)));
    let stats = h.engine.stats();
    assert_eq!(stats.grid_batches, 1);
    assert_eq!(stats.column_fetches, 1);
    assert_eq!(stats.row_fetches, 1);
}
