//! Flush handling: claims, grid partitioning, column and row fetches.

use futures::FutureExt;
use futures::future::join_all;
use ledgerlink_common::{
    BulkRequest, BulkResponse, EntityId, FetchError, FilterKey, FilterSet, PeriodExpr, PeriodKey,
    QueryKind, ValueKey, ValueRequest,
};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::Instrument;

use super::{BatchEngine, spawn_on};
use crate::grid::{ColumnAdmission, ColumnKey, GridCandidate, SealedColumn, detect};
use crate::queue::{PendingRequest, ValueResult};
use crate::stats::{add, bump};

type RowGroupKey = (QueryKind, FilterKey, EntityId);

impl BatchEngine {
    pub(super) async fn flush_queue(&self) {
        let batch = self.inner.state.lock().queue.drain();
        self.dispatch(batch).await;
    }

    /// Settle-timer flush of the build-mode accumulation. Build mode only
    /// exits once arrivals have actually gone quiet; a flush forced by the
    /// accumulation's max wait leaves it on.
    pub(super) async fn flush_build(&self) {
        let batch = {
            let mut st = self.inner.state.lock();
            if st.mode.settled(Instant::now()) {
                if st.mode.exit() {
                    bump(&self.inner.stats.build_mode_exits);
                }
            } else {
                tracing::debug!(pending = st.build.len(), "build mode accumulation hit its max wait");
            }
            st.build.drain()
        };
        self.dispatch(batch).await;
    }

    /// Claim, partition and fetch one drained batch. Every persisted write
    /// produced by the batch goes out as one store write.
    pub(super) async fn dispatch(&self, batch: Vec<PendingRequest>) {
        if batch.is_empty() {
            return;
        }
        let inner = &self.inner;
        bump(&inner.stats.flushes);
        let span = tracing::debug_span!("flush", requests = batch.len());

        let (rows, supplements) = {
            let _enter = span.enter();
            let mut st = inner.state.lock();

            let mut fresh: Vec<(ValueKey, ValueRequest)> = Vec::with_capacity(batch.len());
            for pending in batch {
                let (key, request) = (pending.key.clone(), pending.request.clone());
                if st.claims.claim(pending) {
                    fresh.push((key, request));
                } else {
                    bump(&inner.stats.claim_joins);
                }
            }

            let now = Instant::now();
            let mut wave: FxHashMap<ValueKey, GridCandidate> = st
                .evaluating
                .snapshot(None, now)
                .into_iter()
                .map(|c| (c.key.clone(), c))
                .collect();
            for (key, request) in &fresh {
                if let Some(c) = GridCandidate::from_request(key, request) {
                    wave.entry(key.clone()).or_insert(c);
                }
            }
            let candidates: Vec<GridCandidate> = wave.into_values().collect();
            let detection = detect(&candidates, &inner.config.grid);
            if detection.eligible {
                bump(&inner.stats.grid_batches);
                tracing::debug!(
                    mode = ?detection.mode,
                    entities = detection.entities.len(),
                    columns = detection.columns.len(),
                    "grid detected"
                );
            } else {
                bump(&inner.stats.grid_rejections);
                if let Some(reason) = &detection.rejection {
                    tracing::trace!(%reason, "no grid; fetching per entity");
                }
            }

            let mut rows = Vec::new();
            let mut opened = Vec::new();
            let mut supplemental: BTreeMap<ColumnKey, (Vec<EntityId>, FilterSet)> = BTreeMap::new();
            for (key, request) in fresh {
                let candidate = GridCandidate::from_request(&key, &request)
                    .filter(|c| detection.covers(c));
                let Some(candidate) = candidate else {
                    rows.push((key, request));
                    continue;
                };
                match st.columns.admit(&candidate) {
                    ColumnAdmission::Opened => opened.push(candidate.column()),
                    ColumnAdmission::Merged => {}
                    ColumnAdmission::Supplemental => {
                        supplemental
                            .entry(candidate.column())
                            .or_insert_with(|| (Vec::new(), candidate.filters.clone()))
                            .0
                            .push(candidate.entity.clone());
                    }
                    // Sent column already settled this entity; fetch it directly.
                    ColumnAdmission::Covered => rows.push((key, request)),
                }
            }

            let weak = Arc::downgrade(&self.inner);
            for column in opened {
                let key = column.clone();
                st.columns.arm(
                    &column,
                    spawn_on(&weak, move |engine| async move {
                        engine.flush_column(key).await;
                    }),
                );
            }
            let supplements: Vec<SealedColumn> = supplemental
                .into_iter()
                .filter_map(|(key, (entities, filters))| {
                    st.columns.supplement(&key, entities, filters)
                })
                .collect();
            (rows, supplements)
        };

        let sup_jobs = supplements.into_iter().map(|sealed| {
            bump(&inner.stats.supplemental_fetches);
            self.fetch_column(sealed, false)
        });
        let (row_values, sup_values) =
            futures::join!(self.fetch_rows(rows), join_all(sup_jobs));
        let mut values = row_values;
        values.extend(sup_values.into_iter().flatten());
        self.persist(values);
    }

    /// Collect-timer flush of one grid column.
    pub(super) async fn flush_column(&self, key: ColumnKey) {
        let Some(sealed) = self.inner.state.lock().columns.seal(&key) else {
            return;
        };
        bump(&self.inner.stats.column_fetches);
        let values = self.fetch_column(sealed, true).await;
        self.persist(values);
    }

    /// One bulk call for a column. Returns the values that settled
    /// successfully, for persisting by the caller.
    async fn fetch_column(&self, sealed: SealedColumn, completes: bool) -> Vec<(ValueKey, f64)> {
        let column = sealed.key.clone();
        let request = BulkRequest {
            kind: column.kind,
            entities: sealed.entities.clone(),
            periods: vec![PeriodExpr::Single(column.period)],
            filters: sealed.filters.clone(),
        };
        let span = tracing::debug_span!("column", key = %sealed.flight_key, entities = sealed.entities.len());
        let response = self
            .bulk(sealed.flight_key.clone(), request)
            .instrument(span)
            .await;
        let done = completes.then_some(&column);

        let response = match response {
            Ok(r) => r,
            Err(err) => {
                bump(&self.inner.stats.remote_failures);
                tracing::warn!(column = %column, error = %err, "column fetch failed; rejecting its waiters");
                let results = sealed
                    .entities
                    .iter()
                    .map(|e| (column.value_key(e), Err(err.clone())))
                    .collect();
                self.settle(results, done);
                return Vec::new();
            }
        };

        let period = PeriodKey::from(column.period);
        let mut results = Vec::with_capacity(sealed.entities.len());
        let mut missing = Vec::new();
        for entity in &sealed.entities {
            let key = column.value_key(entity);
            if let Some(msg) = response.error_for(entity) {
                results.push((key, Err(FetchError::remote(msg))));
            } else if let Some(v) = response.value(entity, &period) {
                results.push((key, Ok(v)));
            } else {
                missing.push((
                    key,
                    ValueRequest::new(
                        column.kind,
                        entity.clone(),
                        PeriodExpr::Single(column.period),
                        sealed.filters.clone(),
                    ),
                ));
            }
        }
        let mut values = self.settle(results, done);
        if !missing.is_empty() {
            add(&self.inner.stats.cell_fallbacks, missing.len() as u64);
            tracing::warn!(column = %column, missing = missing.len(), "column response omitted cells; fetching them directly");
            values.extend(self.fetch_rows(missing).await);
        }
        values
    }

    /// Per-entity fallback: one bulk call per (kind, filters, entity) group
    /// covering all of that entity's requested periods.
    pub(super) async fn fetch_rows(
        &self,
        requests: Vec<(ValueKey, ValueRequest)>,
    ) -> Vec<(ValueKey, f64)> {
        if requests.is_empty() {
            return Vec::new();
        }
        let mut groups: BTreeMap<RowGroupKey, Vec<(ValueKey, ValueRequest)>> = BTreeMap::new();
        for (key, request) in requests {
            groups
                .entry((request.kind, key.filters.clone(), request.entity.clone()))
                .or_default()
                .push((key, request));
        }
        let jobs = groups
            .into_iter()
            .map(|(group, members)| self.fetch_row(group, members));
        join_all(jobs).await.into_iter().flatten().collect()
    }

    async fn fetch_row(
        &self,
        (kind, filter_key, entity): RowGroupKey,
        members: Vec<(ValueKey, ValueRequest)>,
    ) -> Vec<(ValueKey, f64)> {
        bump(&self.inner.stats.row_fetches);
        let mut periods: Vec<PeriodExpr> = members.iter().map(|(_, r)| r.period).collect();
        periods.sort();
        periods.dedup();
        let period_text: Vec<String> = periods.iter().map(|p| p.key().to_string()).collect();
        let flight_key = format!(
            "row:{kind}:{}:{entity}:{}",
            filter_key.short(),
            period_text.join(",")
        );
        let request = BulkRequest {
            kind,
            entities: vec![entity.clone()],
            periods,
            filters: members[0].1.filters.clone(),
        };

        let results: Vec<(ValueKey, ValueResult)> = match self.bulk(flight_key, request).await {
            Err(err) => {
                bump(&self.inner.stats.remote_failures);
                tracing::warn!(%entity, error = %err, "row fetch failed; rejecting its waiters");
                members
                    .into_iter()
                    .map(|(key, _)| (key, Err(err.clone())))
                    .collect()
            }
            Ok(response) => members
                .into_iter()
                .map(|(key, request)| {
                    let result = row_cell(&response, &entity, &request.period.key());
                    (key, result)
                })
                .collect(),
        };
        self.settle(results, None)
    }

    /// Single-flight bulk call through the concurrency gate.
    pub(super) async fn bulk(
        &self,
        flight_key: String,
        request: BulkRequest,
    ) -> Result<Arc<BulkResponse>, FetchError> {
        let engine = self.clone();
        let trace_key = flight_key.clone();
        let outcome = self
            .inner
            .bulk_flights
            .run(flight_key, move || {
                async move {
                    let _permit = engine.inner.gate.acquire().await?;
                    tracing::trace!(cells = request.cell_count(), "remote bulk fetch");
                    engine
                        .inner
                        .remote
                        .fetch_bulk(request)
                        .await
                        .map(Arc::new)
                        .map_err(FetchError::from)
                }
                .boxed()
            })
            .await;
        if outcome.joined {
            tracing::trace!(key = %trace_key, "joined in-flight bulk fetch");
        }
        outcome.result
    }

    /// Cache successes, then release claims and resolve every waiter.
    /// Values are cached before claims are released so a concurrent miss
    /// either joins the claim or finds the value.
    pub(super) fn settle(
        &self,
        results: Vec<(ValueKey, ValueResult)>,
        column: Option<&ColumnKey>,
    ) -> Vec<(ValueKey, f64)> {
        let successes: Vec<(ValueKey, f64)> = results
            .iter()
            .filter_map(|(k, r)| r.as_ref().ok().map(|v| (k.clone(), *v)))
            .collect();
        {
            let mut caches = self.inner.caches.lock();
            for (key, v) in &successes {
                caches.values.set(key.clone(), *v);
            }
        }
        let mut st = self.inner.state.lock();
        for (key, result) in results {
            match result {
                Ok(v) => st.claims.settle(&key, Ok(v)),
                Err(err) => st.claims.reject(&key, err),
            };
            st.evaluating.remove(&key);
        }
        if let Some(column) = column {
            st.columns.complete(column);
        }
        successes
    }

    /// One document write for every value settled by a flush.
    pub(super) fn persist(&self, values: Vec<(ValueKey, f64)>) {
        if values.is_empty() {
            return;
        }
        match self.inner.persisted.write_batch(&values) {
            Ok(outcome) => {
                bump(&self.inner.stats.persisted_writes);
                if outcome.quota_retry {
                    add(&self.inner.stats.quota_evictions, outcome.evicted as u64);
                }
            }
            Err(err) => {
                tracing::warn!(values = values.len(), error = %err, "persisted cache write failed");
            }
        }
    }
}

fn row_cell(response: &BulkResponse, entity: &EntityId, period: &PeriodKey) -> ValueResult {
    if let Some(msg) = response.error_for(entity) {
        return Err(FetchError::remote(msg));
    }
    response
        .value(entity, period)
        .ok_or_else(|| FetchError::remote("response omitted a requested cell"))
}
