//! Cross-context coordination: preload waits, preload execution, events and
//! invalidation.

use futures::FutureExt;
use futures::future::join_all;
use ledgerlink_common::{
    BulkRequest, FetchError, FetchErrorKind, PeriodExpr, PeriodKey, StoreError, ValueKey,
    ValueRequest,
};
use std::sync::Arc;
use tracing::Instrument;

use super::{BatchEngine, spawn_on};
use crate::bus::{ContextEvent, InvalidateScope, PreloadSlot};
use crate::manifest::{ManifestSlot, ManifestStatus, WaitOutcome};
use crate::stats::bump;

impl BatchEngine {
    /// Wait on a preload of the request's slice when the manifest tracks one,
    /// then look the value up again. `None` sends the request down the
    /// normal miss path.
    pub(super) async fn await_preload(&self, request: &ValueRequest, key: &ValueKey) -> Option<f64> {
        let inner = &self.inner;
        if !inner.config.preload.enabled {
            return None;
        }
        let period = request.period.as_single()?;
        let slot = ManifestSlot::new(request.kind, key.filters.clone(), period);
        let entry = match inner.manifest.entry(&slot) {
            Ok(entry) => entry?,
            Err(err) => {
                tracing::warn!(slot = %slot.storage_key(), error = %err, "manifest unreadable; skipping preload wait");
                return None;
            }
        };

        let ready = match entry.status {
            ManifestStatus::Completed => true,
            ManifestStatus::Failed => {
                if !inner.manifest.retry_allowed(&entry) {
                    return None;
                }
                if let Err(err) = inner.manifest.request(std::slice::from_ref(&slot)) {
                    tracing::warn!(error = %err, "could not re-request failed preload");
                    return None;
                }
                let preload = PreloadSlot::new(request.kind, request.filters.clone(), period);
                if let Err(err) = self.request_preload(preload) {
                    tracing::debug!(error = %err, "preload retry refused");
                    return None;
                }
                self.wait_slot(&slot).await
            }
            ManifestStatus::Requested | ManifestStatus::Running => self.wait_slot(&slot).await,
        };
        if !ready {
            return None;
        }
        self.recheck(key).await
    }

    async fn wait_slot(&self, slot: &ManifestSlot) -> bool {
        bump(&self.inner.stats.preload_waits);
        match self.inner.manifest.wait_for(slot).await {
            WaitOutcome::Completed => true,
            WaitOutcome::TimedOut => {
                bump(&self.inner.stats.preload_timeouts);
                tracing::warn!(slot = %slot.storage_key(), "preload wait timed out; fetching directly");
                false
            }
            WaitOutcome::Failed { retryable, error } => {
                tracing::debug!(slot = %slot.storage_key(), retryable, error = ?error, "preload failed; fetching directly");
                false
            }
            WaitOutcome::NotTracked => false,
            WaitOutcome::Unavailable(err) => {
                tracing::warn!(slot = %slot.storage_key(), error = %err, "manifest unreadable while waiting");
                false
            }
        }
    }

    /// Re-check both caches after a slice reported completed, with a short
    /// backoff between tries.
    async fn recheck(&self, key: &ValueKey) -> Option<f64> {
        let retries = self.inner.config.manifest.inconsistency_retries;
        let backoff = self.inner.config.manifest.inconsistency_backoff;
        for attempt in 0..=retries {
            if let Some(v) = self.inner.caches.lock().values.get(key) {
                return Some(v);
            }
            if let Some(v) = self.persisted_lookup(key) {
                return Some(v);
            }
            if attempt < retries {
                tokio::time::sleep(backoff).await;
            }
        }
        bump(&self.inner.stats.inconsistencies);
        tracing::warn!(
            key = %key,
            code = %FetchErrorKind::Inconsistency,
            "slice reported completed but value is not cached; fetching directly"
        );
        None
    }

    /// Queue a slice for preloading. Signals are coalesced and flushed to the
    /// manifest in one write after the preload quiet period.
    ///
    /// Returns `Ok(false)` when the slice was already queued, and a
    /// `QueueOverflow` error while the queue's kill-switch is tripped. Must be
    /// called from within a Tokio runtime.
    pub fn request_preload(&self, slot: PreloadSlot) -> Result<bool, FetchError> {
        let mut queue = self.inner.preload_queue.lock();
        match queue.signal(slot) {
            Err(err) => {
                bump(&self.inner.stats.overflow_rejections);
                Err(err)
            }
            Ok(false) => Ok(false),
            Ok(true) => {
                let weak = Arc::downgrade(&self.inner);
                queue.arm(flush_preloads_on(&weak));
                Ok(true)
            }
        }
    }

    /// Write every queued preload signal to the manifest, announce it to
    /// other contexts and, when configured, run the slices here. Returns the
    /// number of slices flushed.
    pub async fn flush_preloads(&self) -> usize {
        let inner = &self.inner;
        let slots = inner.preload_queue.lock().drain();
        if slots.is_empty() {
            return 0;
        }
        let manifest_slots: Vec<ManifestSlot> = slots.iter().map(PreloadSlot::manifest_slot).collect();
        match inner.manifest.request(&manifest_slots) {
            Ok(changed) => {
                tracing::debug!(queued = slots.len(), changed = changed.len(), "preload signals flushed");
            }
            Err(err) => {
                tracing::warn!(queued = slots.len(), error = %err, "preload flush could not write the manifest; requeued");
                let mut queue = inner.preload_queue.lock();
                queue.requeue(slots);
                let weak = Arc::downgrade(inner);
                queue.arm(flush_preloads_on(&weak));
                return 0;
            }
        }
        let count = slots.len();
        if let Err(err) = inner.bus.publish(ContextEvent::TriggerPreload {
            slots: slots.clone(),
        }) {
            tracing::warn!(error = %err, "could not announce preload");
        }
        if inner.config.preload.execute_locally {
            join_all(slots.into_iter().map(|slot| self.run_preload(slot))).await;
        }
        count
    }

    /// Fetch a whole slice and cache it. Runs at most once per slice at a
    /// time in this context, and only when this context wins the manifest
    /// claim. Returns the number of values cached.
    pub async fn run_preload(&self, slot: PreloadSlot) -> Result<usize, FetchError> {
        let engine = self.clone();
        self.inner
            .preload_flights
            .run(slot.manifest_slot(), move || {
                async move { engine.execute_preload(slot).await }.boxed()
            })
            .await
            .result
    }

    async fn execute_preload(&self, slot: PreloadSlot) -> Result<usize, FetchError> {
        let inner = &self.inner;
        let mslot = slot.manifest_slot();
        match inner.manifest.mark_running(&mslot) {
            Ok(true) => {}
            Ok(false) => {
                tracing::trace!(slot = %mslot.storage_key(), "preload already handled");
                return Ok(0);
            }
            Err(err) => {
                return Err(FetchError::new(FetchErrorKind::TransientWait)
                    .with_message(format!("manifest unavailable: {err}")));
            }
        }
        self.announce(&mslot, ManifestStatus::Running);
        bump(&inner.stats.preloads_run);

        let request = BulkRequest {
            kind: slot.kind,
            entities: Vec::new(),
            periods: vec![PeriodExpr::Single(slot.period)],
            filters: slot.filters.clone(),
        };
        let span = tracing::info_span!("preload", slot = %mslot.storage_key());
        let response = self
            .bulk(format!("pre:{}", mslot.storage_key()), request)
            .instrument(span)
            .await;

        match response {
            Ok(response) => {
                let period = PeriodKey::from(slot.period);
                let filters = slot.filters.key();
                let values: Vec<(ValueKey, f64)> = response
                    .values
                    .iter()
                    .filter_map(|(entity, row)| {
                        row.get(&period).map(|v| {
                            let key = ValueKey {
                                kind: slot.kind,
                                entity: entity.clone(),
                                period: period.clone(),
                                filters: filters.clone(),
                            };
                            (key, *v)
                        })
                    })
                    .collect();
                {
                    let mut caches = inner.caches.lock();
                    for (key, v) in &values {
                        caches.values.set(key.clone(), *v);
                    }
                }
                let count = values.len();
                self.persist(values);
                if let Err(err) = inner.manifest.mark_completed(&mslot) {
                    tracing::warn!(error = %err, "could not mark preload completed");
                }
                self.announce(&mslot, ManifestStatus::Completed);
                tracing::info!(slot = %mslot.storage_key(), values = count, "preload completed");
                Ok(count)
            }
            Err(err) => {
                bump(&inner.stats.remote_failures);
                if let Err(store_err) = inner.manifest.mark_failed(&mslot, &err.to_string()) {
                    tracing::warn!(error = %store_err, "could not mark preload failed");
                }
                self.announce(&mslot, ManifestStatus::Failed);
                tracing::warn!(slot = %mslot.storage_key(), error = %err, "preload failed");
                Err(err)
            }
        }
    }

    fn announce(&self, slot: &ManifestSlot, status: ManifestStatus) {
        let event = ContextEvent::StatusChanged {
            slot: slot.clone(),
            status,
        };
        if let Err(err) = self.inner.bus.publish(event) {
            tracing::debug!(error = %err, "status event not published");
        }
    }

    /// Consume events other contexts published since the last poll. Preload
    /// triggers are run in the background when this context executes
    /// preloads; invalidations are applied to the in-process caches.
    /// Must be called from within a Tokio runtime.
    pub fn poll_events(&self) -> Result<usize, StoreError> {
        let events = self.inner.bus.poll()?;
        let count = events.len();
        for envelope in events {
            match envelope.event {
                ContextEvent::TriggerPreload { slots } => {
                    if !self.inner.config.preload.execute_locally {
                        continue;
                    }
                    for slot in slots {
                        let engine = self.clone();
                        tokio::spawn(async move {
                            let _ = engine.run_preload(slot).await;
                        });
                    }
                }
                ContextEvent::StatusChanged { slot, status } => {
                    tracing::trace!(origin = %envelope.origin, slot = %slot.storage_key(), ?status, "slice status changed");
                }
                ContextEvent::Invalidate { scope } => {
                    let dropped = self.apply_invalidation(&scope);
                    tracing::debug!(origin = %envelope.origin, ?scope, dropped, "applied remote invalidation");
                }
            }
        }
        Ok(count)
    }

    /// Invalidate cached values here and in the persisted cache, then tell
    /// the other contexts. Returns the number of persisted values removed.
    pub fn invalidate(&self, scope: InvalidateScope) -> Result<usize, StoreError> {
        let dropped = self.apply_invalidation(&scope);
        let persisted = &self.inner.persisted;
        let removed = match &scope {
            InvalidateScope::All => {
                self.inner.manifest.clear()?;
                persisted.remove_where(|_| true)?
            }
            InvalidateScope::Entity { entity } => {
                persisted.remove_where(|k| persisted_entity(k) == Some(entity.as_str()))?
            }
            InvalidateScope::Slot { filters, period } => {
                let suffix = format!("@{}#{}", period.key(), filters.short());
                persisted.remove_where(|k| k.ends_with(&suffix))?
            }
        };
        tracing::info!(?scope, dropped, removed, "invalidated");
        self.inner.bus.publish(ContextEvent::Invalidate { scope })?;
        Ok(removed)
    }

    /// Memory-only invalidation. Returns the number of entries dropped.
    fn apply_invalidation(&self, scope: &InvalidateScope) -> usize {
        let mut caches = self.inner.caches.lock();
        match scope {
            InvalidateScope::All => {
                let n = caches.values.len() + caches.exclusive.len();
                caches.values.clear();
                caches.exclusive.clear();
                n
            }
            InvalidateScope::Entity { entity } => {
                let mut n = caches.values.retain(|k, _| &k.entity != entity);
                n += caches
                    .exclusive
                    .retain(|k, _| persisted_entity(k.as_str()) != Some(entity.as_str()));
                n += usize::from(caches.labels.delete(entity).is_some());
                n += usize::from(caches.classifications.delete(entity).is_some());
                n
            }
            InvalidateScope::Slot { filters, period } => {
                let period = PeriodKey::from(*period);
                caches
                    .values
                    .retain(|k, _| !(&k.filters == filters && k.period == period))
            }
        }
    }
}

/// Entity part of a `kind:entity@period#filters` key.
fn persisted_entity(key: &str) -> Option<&str> {
    let (_, rest) = key.split_once(':')?;
    rest.rsplit_once('@').map(|(entity, _)| entity)
}

/// Timer callback that flushes queued preload signals on a live engine. Kept
/// outside `flush_preloads` so the re-arm inside it does not make the future's
/// `Send` check cyclic.
fn flush_preloads_on(weak: &std::sync::Weak<super::EngineInner>) -> impl FnOnce() + Send + 'static {
    spawn_on(weak, |engine| async move {
        engine.flush_preloads().await;
    })
}
