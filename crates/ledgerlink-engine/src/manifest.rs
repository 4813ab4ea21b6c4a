//! Durable precache manifest.
//!
//! Tracks, per (query kind, filter set, period) slice, whether a preload has been
//! requested, is running, completed or failed. The manifest is one JSON
//! document in the persisted store plus a separate version marker. Every
//! mutation bumps the marker; readers compare their cached view against it
//! and re-read on mismatch. Mutations always start from a fresh read.

use chrono::{DateTime, Utc};
use ledgerlink_common::{FilterKey, Period, PersistedStore, QueryKind, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ManifestConfig;
use crate::persist::{QuotaRelief, write_with_eviction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Requested,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub status: ManifestStatus,
    /// Failed attempts so far.
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ManifestEntry {
    fn requested(now: DateTime<Utc>) -> Self {
        Self {
            status: ManifestStatus::Requested,
            attempt_count: 0,
            requested_at: Some(now),
            started_at: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
        }
    }
}

/// One preloadable slice: a query kind, a filter set and a single period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestSlot {
    pub kind: QueryKind,
    pub filters: FilterKey,
    pub period: Period,
}

impl ManifestSlot {
    pub fn new(kind: QueryKind, filters: FilterKey, period: Period) -> Self {
        Self {
            kind,
            filters,
            period,
        }
    }

    pub fn storage_key(&self) -> String {
        format!(
            "{}|{:016x}|{}",
            self.kind,
            self.filters.hash64(),
            self.period.key()
        )
    }
}

impl Display for ManifestSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ManifestDocument {
    version: u64,
    entries: BTreeMap<String, ManifestEntry>,
}

/// Result of waiting on a slice.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Completed,
    Failed { retryable: bool, error: Option<String> },
    TimedOut,
    NotTracked,
    Unavailable(String),
}

pub struct PrecacheManifest {
    store: Arc<dyn PersistedStore>,
    doc_key: String,
    version_key: String,
    max_attempts: u32,
    poll_interval: Duration,
    max_wait: Duration,
    view: Mutex<Option<Arc<ManifestDocument>>>,
    stale_discards: AtomicU64,
    relief: Option<Arc<dyn QuotaRelief>>,
}

impl PrecacheManifest {
    pub fn new(store: Arc<dyn PersistedStore>, namespace: &str, cfg: &ManifestConfig) -> Self {
        Self {
            store,
            doc_key: format!("{namespace}:manifest"),
            version_key: format!("{namespace}:manifest:version"),
            max_attempts: cfg.max_attempts,
            poll_interval: cfg.poll_interval,
            max_wait: cfg.max_wait,
            view: Mutex::new(None),
            stale_discards: AtomicU64::new(0),
            relief: None,
        }
    }

    /// Free space through `relief` when a write hits the store quota.
    pub fn with_relief(mut self, relief: Arc<dyn QuotaRelief>) -> Self {
        self.relief = Some(relief);
        self
    }

    pub fn store_keys(&self) -> [&str; 2] {
        [&self.doc_key, &self.version_key]
    }

    fn read_marker(&self) -> Result<u64, StoreError> {
        Ok(self
            .store
            .get(&self.version_key)?
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0))
    }

    fn read_document(&self) -> Result<ManifestDocument, StoreError> {
        match self.store.get(&self.doc_key)? {
            Some(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Codec {
                key: self.doc_key.clone(),
                source,
            }),
            None => Ok(ManifestDocument::default()),
        }
    }

    /// Current view, re-read if another context moved the marker.
    fn view(&self) -> Result<Arc<ManifestDocument>, StoreError> {
        let marker = self.read_marker()?;
        let mut view = self.view.lock();
        if let Some(doc) = view.as_ref() {
            if doc.version == marker {
                return Ok(doc.clone());
            }
            self.stale_discards.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(cached = doc.version, marker, "manifest view stale; re-reading");
        }
        let mut doc = self.read_document()?;
        // A cleared manifest has no document but a live marker.
        doc.version = doc.version.max(marker);
        let doc = Arc::new(doc);
        *view = Some(doc.clone());
        Ok(doc)
    }

    /// Version of the last view this context read.
    pub fn cached_version(&self) -> Option<u64> {
        self.view.lock().as_ref().map(|d| d.version)
    }

    pub fn stale_discards(&self) -> u64 {
        self.stale_discards.load(Ordering::Relaxed)
    }

    pub fn version(&self) -> Result<u64, StoreError> {
        self.read_marker()
    }

    pub fn entry(&self, slot: &ManifestSlot) -> Result<Option<ManifestEntry>, StoreError> {
        Ok(self.view()?.entries.get(&slot.storage_key()).cloned())
    }

    /// Read-modify-write against a fresh read. `apply` reports whether it
    /// changed anything; unchanged documents are not written back.
    fn mutate<R>(
        &self,
        apply: impl FnOnce(&mut ManifestDocument, DateTime<Utc>) -> (R, bool),
    ) -> Result<R, StoreError> {
        let marker = self.read_marker()?;
        let mut doc = self.read_document()?;
        let (out, changed) = apply(&mut doc, Utc::now());
        if !changed {
            return Ok(out);
        }
        doc.version = doc.version.max(marker) + 1;
        let raw = serde_json::to_string(&doc).map_err(|source| StoreError::Codec {
            key: self.doc_key.clone(),
            source,
        })?;
        let relief = self.relief.as_deref();
        write_with_eviction(&*self.store, &self.doc_key, raw, relief)?;
        write_with_eviction(&*self.store, &self.version_key, doc.version.to_string(), relief)?;
        *self.view.lock() = Some(Arc::new(doc));
        Ok(out)
    }

    pub fn retry_allowed(&self, entry: &ManifestEntry) -> bool {
        entry.status == ManifestStatus::Failed && entry.attempt_count < self.max_attempts
    }

    /// Mark slices requested in one write. Absent slices and failed slices
    /// below the retry ceiling become requested; everything else is left
    /// alone. Returns the slices that changed.
    pub fn request(&self, slots: &[ManifestSlot]) -> Result<Vec<ManifestSlot>, StoreError> {
        let max_attempts = self.max_attempts;
        self.mutate(|doc, now| {
            let mut changed = Vec::new();
            for slot in slots {
                let key = slot.storage_key();
                match doc.entries.get_mut(&key) {
                    None => {
                        doc.entries.insert(key, ManifestEntry::requested(now));
                    }
                    Some(e)
                        if e.status == ManifestStatus::Failed && e.attempt_count < max_attempts =>
                    {
                        e.status = ManifestStatus::Requested;
                        e.requested_at = Some(now);
                        e.started_at = None;
                    }
                    Some(_) => continue,
                }
                changed.push(slot.clone());
            }
            let any = !changed.is_empty();
            (changed, any)
        })
    }

    /// Claim a slice for execution. Fails (returns `false`) when the slice is
    /// already running, completed, or failed past the retry ceiling.
    pub fn mark_running(&self, slot: &ManifestSlot) -> Result<bool, StoreError> {
        let max_attempts = self.max_attempts;
        self.mutate(|doc, now| {
            let key = slot.storage_key();
            let entry = doc
                .entries
                .entry(key)
                .or_insert_with(|| ManifestEntry::requested(now));
            let allowed = match entry.status {
                ManifestStatus::Requested => true,
                ManifestStatus::Failed => entry.attempt_count < max_attempts,
                ManifestStatus::Running | ManifestStatus::Completed => false,
            };
            if allowed {
                entry.status = ManifestStatus::Running;
                entry.started_at = Some(now);
            }
            (allowed, allowed)
        })
    }

    pub fn mark_completed(&self, slot: &ManifestSlot) -> Result<bool, StoreError> {
        self.mutate(|doc, now| match doc.entries.get_mut(&slot.storage_key()) {
            Some(e) if e.status == ManifestStatus::Running => {
                e.status = ManifestStatus::Completed;
                e.completed_at = Some(now);
                e.last_error = None;
                (true, true)
            }
            _ => (false, false),
        })
    }

    pub fn mark_failed(&self, slot: &ManifestSlot, error: &str) -> Result<bool, StoreError> {
        self.mutate(|doc, now| match doc.entries.get_mut(&slot.storage_key()) {
            Some(e) if e.status == ManifestStatus::Running => {
                e.status = ManifestStatus::Failed;
                e.attempt_count += 1;
                e.failed_at = Some(now);
                e.last_error = Some(error.to_string());
                (true, true)
            }
            _ => (false, false),
        })
    }

    /// Poll until the slice leaves requested/running or the bounded wait
    /// expires. Every poll checks the version marker.
    pub async fn wait_for(&self, slot: &ManifestSlot) -> WaitOutcome {
        let deadline = Instant::now() + self.max_wait;
        loop {
            let entry = match self.entry(slot) {
                Ok(e) => e,
                Err(err) => return WaitOutcome::Unavailable(err.to_string()),
            };
            match entry {
                None => return WaitOutcome::NotTracked,
                Some(e) => match e.status {
                    ManifestStatus::Completed => return WaitOutcome::Completed,
                    ManifestStatus::Failed => {
                        return WaitOutcome::Failed {
                            retryable: self.retry_allowed(&e),
                            error: e.last_error,
                        };
                    }
                    ManifestStatus::Requested | ManifestStatus::Running => {}
                },
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Remove the whole manifest. The marker is bumped rather than removed so
    /// other contexts notice.
    pub fn clear(&self) -> Result<(), StoreError> {
        let next = self.read_marker()? + 1;
        self.store.remove(&self.doc_key)?;
        self.store.set(&self.version_key, next.to_string())?;
        *self.view.lock() = None;
        Ok(())
    }
}
