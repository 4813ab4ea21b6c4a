//! Persisted value cache shared by every context over the same store.
//!
//! All values live in one JSON document so a flush costs one document
//! write regardless of how many keys it settled. A small revision marker
//! written next to it lets readers skip re-fetching an unchanged document.

use chrono::{DateTime, Utc};
use ledgerlink_common::{PersistedStore, StoreError, ValueKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::bus::generate_context_id;
use crate::config::PersistenceConfig;

/// Something that can free space in an over-quota store.
pub trait QuotaRelief: Send + Sync {
    /// Drop some of the caller's own oldest entries. Returns how many went.
    fn relieve(&self) -> Result<usize, StoreError>;
}

/// Write `value` under `key`. If the store reports its quota exhausted,
/// `relief` frees space once and the write is retried once. Returns the
/// number of entries evicted to make room.
pub fn write_with_eviction(
    store: &dyn PersistedStore,
    key: &str,
    value: String,
    relief: Option<&dyn QuotaRelief>,
) -> Result<usize, StoreError> {
    let err = match store.set(key, value.clone()) {
        Ok(()) => return Ok(0),
        Err(err) => err,
    };
    let Some(relief) = relief.filter(|_| err.is_quota()) else {
        return Err(err);
    };
    let evicted = relief.relieve()?;
    tracing::warn!(key, evicted, "store over quota; evicted own entries and retrying once");
    store.set(key, value)?;
    Ok(evicted)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    pub v: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ValuesDocument {
    entries: BTreeMap<String, StoredValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: usize,
    pub evicted: usize,
    pub quota_retry: bool,
}

struct CachedDocument {
    rev: Option<String>,
    raw: String,
    doc: Arc<ValuesDocument>,
}

pub struct PersistedValueCache {
    store: Arc<dyn PersistedStore>,
    key: String,
    rev_key: String,
    writer: String,
    revisions: AtomicU64,
    relieved: AtomicU64,
    max_age: Duration,
    max_entries: usize,
    quota_eviction_fraction: f64,
    parsed: Mutex<Option<CachedDocument>>,
}

impl PersistedValueCache {
    pub fn new(store: Arc<dyn PersistedStore>, cfg: &PersistenceConfig) -> Self {
        Self {
            store,
            key: format!("{}:values", cfg.namespace),
            rev_key: format!("{}:values:rev", cfg.namespace),
            writer: generate_context_id(),
            revisions: AtomicU64::new(0),
            relieved: AtomicU64::new(0),
            max_age: cfg.max_age,
            max_entries: cfg.max_entries.max(1),
            quota_eviction_fraction: cfg.quota_eviction_fraction,
            parsed: Mutex::new(None),
        }
    }

    pub fn store_key(&self) -> &str {
        &self.key
    }

    /// Current document. The marker is read first, so a document written
    /// after it only makes the cached copy newer than its marker.
    fn read(&self) -> Result<Arc<ValuesDocument>, StoreError> {
        let rev = self.store.get(&self.rev_key)?;
        if let Some(rev) = &rev
            && let Some(cached) = self.parsed.lock().as_ref()
            && cached.rev.as_ref() == Some(rev)
        {
            return Ok(cached.doc.clone());
        }
        let Some(raw) = self.store.get(&self.key)? else {
            return Ok(Arc::new(ValuesDocument::default()));
        };
        let mut parsed = self.parsed.lock();
        let doc = match parsed.as_ref() {
            Some(cached) if cached.raw == raw => cached.doc.clone(),
            _ => Arc::new(serde_json::from_str(&raw).map_err(|source| StoreError::Codec {
                key: self.key.clone(),
                source,
            })?),
        };
        *parsed = Some(CachedDocument {
            rev,
            raw,
            doc: doc.clone(),
        });
        Ok(doc)
    }

    fn write(&self, doc: &ValuesDocument) -> Result<(), StoreError> {
        let raw = serde_json::to_string(doc).map_err(|source| StoreError::Codec {
            key: self.key.clone(),
            source,
        })?;
        self.store.set(&self.key, raw.clone())?;
        let n = self.revisions.fetch_add(1, Ordering::Relaxed);
        let rev = format!("{}:{n}", self.writer);
        let rev = match self.store.set(&self.rev_key, rev.clone()) {
            Ok(()) => Some(rev),
            Err(err) => {
                // Without a marker readers fall back to comparing documents.
                tracing::debug!(error = %err, "revision marker not written");
                let _ = self.store.remove(&self.rev_key);
                None
            }
        };
        *self.parsed.lock() = Some(CachedDocument {
            rev,
            raw,
            doc: Arc::new(doc.clone()),
        });
        Ok(())
    }

    fn fresh(&self, stored: &StoredValue, now: DateTime<Utc>) -> bool {
        (now - stored.at)
            .to_std()
            .map(|age| age <= self.max_age)
            // Timestamps from the future count as fresh.
            .unwrap_or(true)
    }

    /// Fresh persisted value for `key`, if any.
    pub fn get(&self, key: &ValueKey) -> Result<Option<f64>, StoreError> {
        let doc = self.read()?;
        let now = Utc::now();
        Ok(doc
            .entries
            .get(&key.to_string())
            .filter(|s| self.fresh(s, now))
            .map(|s| s.v))
    }

    /// Merge `values` into the document with a single store write.
    ///
    /// Reads the current document first so writes from other contexts are
    /// kept. Overflow past `max_entries` drops the oldest entries; if the
    /// store reports its quota exhausted, the oldest share of entries is
    /// dropped and the write retried once.
    pub fn write_batch(&self, values: &[(ValueKey, f64)]) -> Result<WriteOutcome, StoreError> {
        let finite: Vec<_> = values.iter().filter(|(_, v)| v.is_finite()).collect();
        if finite.is_empty() {
            return Ok(WriteOutcome::default());
        }
        let mut doc = (*self.read()?).clone();
        let now = Utc::now();
        for (key, v) in &finite {
            doc.entries.insert(key.to_string(), StoredValue { v: *v, at: now });
        }
        let mut outcome = WriteOutcome {
            written: finite.len(),
            ..Default::default()
        };
        if doc.entries.len() > self.max_entries {
            let excess = doc.entries.len() - self.max_entries;
            outcome.evicted += evict_oldest(&mut doc, excess);
        }
        match self.write(&doc) {
            Ok(()) => Ok(outcome),
            Err(err) if err.is_quota() => {
                let n = ((doc.entries.len() as f64) * self.quota_eviction_fraction).ceil() as usize;
                let evicted = evict_oldest(&mut doc, n.max(1));
                tracing::warn!(evicted, key = %self.key, "persisted value cache over quota; evicting and retrying once");
                outcome.evicted += evicted;
                outcome.quota_retry = true;
                self.write(&doc)?;
                Ok(outcome)
            }
            Err(err) => Err(err),
        }
    }

    /// Drop every persisted value whose key text matches `pred`.
    pub fn remove_where(&self, pred: impl Fn(&str) -> bool) -> Result<usize, StoreError> {
        let mut doc = (*self.read()?).clone();
        let before = doc.entries.len();
        doc.entries.retain(|k, _| !pred(k));
        let removed = before - doc.entries.len();
        if removed > 0 {
            self.write(&doc)?;
        }
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.entries.len())
    }

    /// Drop the oldest `quota_eviction_fraction` of entries (at least one).
    pub fn shed(&self) -> Result<usize, StoreError> {
        let mut doc = (*self.read()?).clone();
        if doc.entries.is_empty() {
            return Ok(0);
        }
        let n = ((doc.entries.len() as f64) * self.quota_eviction_fraction).ceil() as usize;
        let evicted = evict_oldest(&mut doc, n.max(1));
        self.write(&doc)?;
        self.relieved.fetch_add(evicted as u64, Ordering::Relaxed);
        Ok(evicted)
    }

    /// Entries dropped on behalf of other writers' quota failures.
    pub fn relieved(&self) -> u64 {
        self.relieved.load(Ordering::Relaxed)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        *self.parsed.lock() = None;
        self.store.remove(&self.key)?;
        self.store.remove(&self.rev_key)
    }
}

impl QuotaRelief for PersistedValueCache {
    fn relieve(&self) -> Result<usize, StoreError> {
        self.shed()
    }
}

fn evict_oldest(doc: &mut ValuesDocument, n: usize) -> usize {
    let mut by_age: Vec<(DateTime<Utc>, String)> = doc
        .entries
        .iter()
        .map(|(k, s)| (s.at, k.clone()))
        .collect();
    by_age.sort();
    let n = n.min(by_age.len());
    for (_, key) in by_age.into_iter().take(n) {
        doc.entries.remove(&key);
    }
    n
}
