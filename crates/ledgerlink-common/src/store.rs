//! Persisted key-value store shared across execution contexts.
//!
//! The store is deliberately minimal and non-transactional: callers must
//! treat every read-then-write as racy and re-verify after waiting.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store quota exceeded writing '{key}' ({bytes} bytes)")]
    QuotaExceeded { key: String, bytes: usize },
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("malformed document under '{key}': {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}

pub trait PersistedStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: String) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    entries: BTreeMap<String, String>,
    quota_bytes: Option<usize>,
    used_bytes: usize,
    writes: u64,
}

/// In-memory store. Clones share the same contents, which is how tests and
/// single-process hosts model several execution contexts over one store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would push the total of key and value bytes past `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        let store = Self::default();
        store.inner.write().quota_bytes = Some(bytes);
        store
    }

    /// Change the quota on a store that may already hold data. Existing
    /// contents are kept even when they exceed the new limit.
    pub fn set_quota(&self, bytes: Option<usize>) {
        self.inner.write().quota_bytes = bytes;
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.read().used_bytes
    }

    /// Successful `set` calls since creation.
    pub fn write_count(&self) -> u64 {
        self.inner.read().writes
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

impl PersistedStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let old = inner
            .entries
            .get(key)
            .map(|v| key.len() + v.len())
            .unwrap_or(0);
        let new = key.len() + value.len();
        let projected = inner.used_bytes - old + new;
        if let Some(quota) = inner.quota_bytes
            && projected > quota
        {
            return Err(StoreError::QuotaExceeded {
                key: key.to_string(),
                bytes: new,
            });
        }
        inner.used_bytes = projected;
        inner.writes += 1;
        inner.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(old) = inner.entries.remove(key) {
            inner.used_bytes -= key.len() + old.len();
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.read().entries.keys().cloned().collect())
    }
}
