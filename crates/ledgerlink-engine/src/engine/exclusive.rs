use futures::FutureExt;
use ledgerlink_common::{AnchorRequest, ExclusiveRequest, FetchError};
use tracing::Instrument;

use super::BatchEngine;
use crate::priority::LockError;
use crate::stats::bump;

impl BatchEngine {
    /// Run an exclusive computation. At most one runs against the remote
    /// service at a time, in priority order; identical concurrent requests
    /// share one run. Only successes are cached.
    pub async fn compute_exclusive(&self, request: ExclusiveRequest) -> Result<f64, FetchError> {
        if let Some(end) = request.through
            && end < request.anchor
        {
            return Err(FetchError::invalid(format!(
                "range end {end} precedes anchor {}",
                request.anchor
            )));
        }
        let key = request.key();
        if let Some(v) = self.inner.caches.lock().exclusive.get(&key) {
            return Ok(v);
        }

        let engine = self.clone();
        let flight_key = key.clone();
        let outcome = self
            .inner
            .exclusive_flights
            .run(flight_key, move || {
                async move {
                    let inner = &engine.inner;
                    let priority = inner.config.concurrency.exclusive_priorities.for_kind(request.kind);
                    let _turn = inner.priority.lock(priority).await.map_err(|err| match err {
                        LockError::Cancelled => FetchError::cancelled("exclusive lock cleared"),
                    })?;
                    let _permit = inner.gate.acquire().await?;
                    bump(&inner.stats.exclusive_runs);
                    let span = tracing::debug_span!("exclusive", kind = %request.kind, entity = %request.entity);
                    let value = inner
                        .remote
                        .fetch_anchor(AnchorRequest {
                            kind: request.kind,
                            entity: request.entity.clone(),
                            anchor: request.anchor,
                            through: request.through,
                            filters: request.filters.clone(),
                        })
                        .instrument(span)
                        .await?;
                    let key = request.key();
                    inner.caches.lock().exclusive.set(key, value);
                    Ok::<f64, FetchError>(value)
                }
                .boxed()
            })
            .await;
        if outcome.joined {
            tracing::trace!(key = %key, "joined running exclusive computation");
        }
        if let Err(err) = &outcome.result {
            tracing::warn!(key = %key, error = %err, "exclusive computation failed");
        }
        outcome.result
    }
}
