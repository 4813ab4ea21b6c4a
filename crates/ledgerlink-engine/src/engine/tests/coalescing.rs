use super::common::*;
use ledgerlink_common::{FetchErrorKind, FilterSet, PeriodExpr, QueryKind, RemoteFailure, ValueRequest};
use ledgerlink_testkit::{MockRemote, entity, period};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn identical_requests_share_one_fetch() {
    let h = harness(test_config());
    let req = balance("4000", 2025, 1);
    let handles = (0..5).map(|_| spawn_get(&h.engine, req.clone())).collect();
    let results = join_all(handles).await;

    for r in results {
        assert_eq!(r.unwrap(), expected(&req));
    }
    assert_eq!(h.remote.bulk_count(), 1);
    let stats = h.engine.stats();
    assert_eq!(stats.misses, 5);
    assert_eq!(stats.queue_merges, 4);
    assert_eq!(stats.row_fetches, 1);
    assert_eq!(stats.flushes, 1);
}

#[tokio::test(start_paused = true)]
async fn settled_value_is_served_from_memory() {
    let h = harness(test_config());
    let req = balance("4000", 2025, 1);
    h.engine.get_value(req.clone()).await.unwrap();
    let again = h.engine.get_value(req.clone()).await.unwrap();

    assert_eq!(again, expected(&req));
    assert_eq!(h.remote.bulk_count(), 1);
    assert_eq!(h.engine.stats().memory_hits, 1);
    assert_eq!(h.engine.peek(&req.key()), Some(expected(&req)));
}

#[tokio::test(start_paused = true)]
async fn request_during_fetch_joins_the_claim() {
    let h = harness_with(MockRemote::with_latency(Duration::from_millis(500)), test_config());
    let req = balance("4000", 2025, 1);
    let first = spawn_get(&h.engine, req.clone());
    // Flushed at the quiet deadline; the fetch is now in the air.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.engine.in_flight(), 1);

    let second = h.engine.get_value(req.clone()).await.unwrap();
    assert_eq!(second, expected(&req));
    assert_eq!(first.await.unwrap().unwrap(), expected(&req));
    assert_eq!(h.remote.bulk_count(), 1);
    assert_eq!(h.engine.stats().claim_joins, 1);
    assert_eq!(h.engine.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn failures_are_never_cached() {
    let h = harness(test_config());
    h.remote.fail_next_bulk(RemoteFailure::new("ledger offline"));
    let req = balance("4000", 2025, 1);

    let err = h.engine.get_value(req.clone()).await.unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::Remote);
    assert_eq!(err.message.as_deref(), Some("ledger offline"));
    assert_eq!(h.engine.peek(&req.key()), None);

    let ok = h.engine.get_value(req.clone()).await.unwrap();
    assert_eq!(ok, expected(&req));
    assert_eq!(h.remote.bulk_count(), 2);
    assert_eq!(h.engine.stats().remote_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn entity_error_only_rejects_that_entity() {
    let h = harness(test_config());
    h.remote.fail_entity("2000", "inactive account");
    let reqs: Vec<_> = ["1000", "2000", "3000"]
        .iter()
        .map(|e| balance(e, 2025, 1))
        .collect();
    let handles = reqs.iter().map(|r| spawn_get(&h.engine, r.clone())).collect();
    let results = join_all(handles).await;

    assert_eq!(results[0].as_ref().unwrap(), &expected(&reqs[0]));
    let err = results[1].as_ref().unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::Remote);
    assert_eq!(err.message.as_deref(), Some("inactive account"));
    assert_eq!(results[2].as_ref().unwrap(), &expected(&reqs[2]));
    assert_eq!(h.remote.bulk_count(), 1);
    assert_eq!(h.engine.peek(&reqs[1].key()), None);
}

#[tokio::test(start_paused = true)]
async fn omitted_cell_is_retried_directly_and_never_zero_filled() {
    let h = harness(test_config());
    h.remote.omit_cell("2000", period(2025, 1).into());
    let reqs: Vec<_> = ["1000", "2000", "3000"]
        .iter()
        .map(|e| balance(e, 2025, 1))
        .collect();
    let handles = reqs.iter().map(|r| spawn_get(&h.engine, r.clone())).collect();
    let results = join_all(handles).await;

    assert!(results[0].is_ok());
    assert!(results[2].is_ok());
    assert_eq!(results[1].as_ref().unwrap_err().kind, FetchErrorKind::Remote);
    let stats = h.engine.stats();
    assert_eq!(stats.column_fetches, 1);
    assert_eq!(stats.cell_fallbacks, 1);
    assert_eq!(stats.row_fetches, 1);
    assert_eq!(h.remote.bulk_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn different_filters_are_fetched_apart() {
    let h = harness(test_config());
    let a = balance("4000", 2025, 1);
    let b = ValueRequest::new(
        QueryKind::Balance,
        entity("4000"),
        PeriodExpr::Single(period(2025, 1)),
        FilterSet::new().with_subsidiary("Europe"),
    );
    let results = join_all(vec![
        spawn_get(&h.engine, a.clone()),
        spawn_get(&h.engine, b.clone()),
    ])
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(h.remote.bulk_count(), 2);
    assert_ne!(a.key(), b.key());
}

#[tokio::test(start_paused = true)]
async fn one_entity_many_periods_is_one_row_fetch() {
    let h = harness(test_config());
    let reqs: Vec<_> = (1..=4).map(|m| balance("4000", 2025, m)).collect();
    let handles = reqs.iter().map(|r| spawn_get(&h.engine, r.clone())).collect();
    let results = join_all(handles).await;

    for (r, req) in results.iter().zip(&reqs) {
        assert_eq!(r.as_ref().unwrap(), &expected(req));
    }
    let calls = h.remote.bulk_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].entities.len(), 1);
    assert_eq!(calls[0].periods.len(), 4);
    assert_eq!(h.engine.stats().grid_rejections, 1);
}

#[tokio::test(start_paused = true)]
async fn range_requests_go_straight_to_a_row_fetch() {
    let h = harness(test_config());
    let range = PeriodExpr::range(period(2025, 1), period(2025, 3)).unwrap();
    let req = ValueRequest::new(QueryKind::Balance, entity("4000"), range, subsidiary());
    let v = h.engine.get_value(req.clone()).await.unwrap();

    assert_eq!(v, expected(&req));
    let calls = h.remote.bulk_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].periods, vec![range]);
}

#[tokio::test(start_paused = true)]
async fn raw_arguments_are_normalized_before_lookup() {
    let h = harness(test_config());
    let a = h
        .engine
        .value(QueryKind::Balance, "4000 - Revenue", "Jan 2025", subsidiary())
        .await
        .unwrap();
    let b = h
        .engine
        .value(QueryKind::Balance, " 4000 ", "2025-01", subsidiary())
        .await
        .unwrap();

    assert_eq!(a, b);
    assert_eq!(h.remote.bulk_count(), 1);
    let err = h
        .engine
        .value(QueryKind::Balance, "4000", "not a month", subsidiary())
        .await
        .unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::InvalidInput);
}

#[tokio::test(start_paused = true)]
async fn flush_now_skips_the_quiet_period() {
    let h = harness(test_config());
    let start = tokio::time::Instant::now();
    let pending = spawn_get(&h.engine, balance("4000", 2025, 1));
    tokio::task::yield_now().await;
    assert_eq!(h.engine.pending(), 1);

    h.engine.flush_now().await;
    assert!(pending.await.unwrap().is_ok());
    assert!(start.elapsed() < Duration::from_millis(150));
}
