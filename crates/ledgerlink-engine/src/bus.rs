//! Cross-context events over the persisted store.
//!
//! Each topic is a bounded JSON log under its own key. Publishers append with
//! a sequence number; consumers remember the next sequence they expect per
//! topic and only ever see newer events, never their own.

use chrono::{DateTime, Utc};
use ledgerlink_common::{EntityId, FilterKey, FilterSet, Period, PersistedStore, QueryKind, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::manifest::{ManifestSlot, ManifestStatus};
use crate::persist::{QuotaRelief, write_with_eviction};

/// A slice some context wants preloaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreloadSlot {
    pub kind: QueryKind,
    pub filters: FilterSet,
    pub period: Period,
}

impl PreloadSlot {
    pub fn new(kind: QueryKind, filters: FilterSet, period: Period) -> Self {
        Self {
            kind,
            filters,
            period,
        }
    }

    pub fn manifest_slot(&self) -> ManifestSlot {
        ManifestSlot::new(self.kind, self.filters.key(), self.period)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum InvalidateScope {
    All,
    Entity { entity: EntityId },
    Slot { filters: FilterKey, period: Period },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextEvent {
    StatusChanged {
        slot: ManifestSlot,
        status: ManifestStatus,
    },
    TriggerPreload {
        slots: Vec<PreloadSlot>,
    },
    Invalidate {
        scope: InvalidateScope,
    },
}

impl ContextEvent {
    pub fn topic(&self) -> Topic {
        match self {
            ContextEvent::StatusChanged { .. } => Topic::StatusChanged,
            ContextEvent::TriggerPreload { .. } => Topic::TriggerPreload,
            ContextEvent::Invalidate { .. } => Topic::Invalidate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    StatusChanged,
    TriggerPreload,
    Invalidate,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::StatusChanged, Topic::TriggerPreload, Topic::Invalidate];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::StatusChanged => "status-changed",
            Topic::TriggerPreload => "trigger-preload",
            Topic::Invalidate => "invalidate",
        }
    }

    fn index(self) -> usize {
        match self {
            Topic::StatusChanged => 0,
            Topic::TriggerPreload => 1,
            Topic::Invalidate => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub origin: String,
    pub at: DateTime<Utc>,
    pub event: ContextEvent,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TopicLog {
    next_seq: u64,
    events: VecDeque<EventEnvelope>,
}

static CONTEXT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifier unique to this process and engine instance.
pub fn generate_context_id() -> String {
    let n = CONTEXT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("ctx-{}-{nanos:x}-{n}", std::process::id())
}

pub struct EventBus {
    store: Arc<dyn PersistedStore>,
    namespace: String,
    context_id: String,
    retention: usize,
    cursors: Mutex<[u64; 3]>,
    relief: Option<Arc<dyn QuotaRelief>>,
}

impl EventBus {
    /// Consumers start at the current end of every log.
    pub fn new(
        store: Arc<dyn PersistedStore>,
        namespace: &str,
        context_id: String,
        retention: usize,
    ) -> Self {
        let bus = Self {
            store,
            namespace: namespace.to_string(),
            context_id,
            retention: retention.max(1),
            cursors: Mutex::new([0; 3]),
            relief: None,
        };
        let mut cursors = [0; 3];
        for topic in Topic::ALL {
            match bus.read_log(topic) {
                Ok(log) => cursors[topic.index()] = log.next_seq,
                Err(err) => tracing::warn!(topic = topic.as_str(), error = %err, "event log unreadable; starting from zero"),
            }
        }
        *bus.cursors.lock() = cursors;
        bus
    }

    /// Free space through `relief` when a publish hits the store quota.
    pub fn with_relief(mut self, relief: Arc<dyn QuotaRelief>) -> Self {
        self.relief = Some(relief);
        self
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn log_key(&self, topic: Topic) -> String {
        format!("{}:events:{}", self.namespace, topic.as_str())
    }

    fn read_log(&self, topic: Topic) -> Result<TopicLog, StoreError> {
        let key = self.log_key(topic);
        match self.store.get(&key)? {
            Some(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Codec { key, source }),
            None => Ok(TopicLog::default()),
        }
    }

    /// Append `event` to its topic log. Returns the assigned sequence number.
    pub fn publish(&self, event: ContextEvent) -> Result<u64, StoreError> {
        let topic = event.topic();
        let key = self.log_key(topic);
        let mut log = self.read_log(topic)?;
        let seq = log.next_seq;
        log.next_seq += 1;
        log.events.push_back(EventEnvelope {
            seq,
            origin: self.context_id.clone(),
            at: Utc::now(),
            event,
        });
        while log.events.len() > self.retention {
            log.events.pop_front();
        }
        let raw = serde_json::to_string(&log).map_err(|source| StoreError::Codec {
            key: key.clone(),
            source,
        })?;
        write_with_eviction(&*self.store, &key, raw, self.relief.as_deref())?;
        tracing::trace!(topic = topic.as_str(), seq, "published context event");
        Ok(seq)
    }

    /// Events from other contexts published since the last poll.
    pub fn poll(&self) -> Result<Vec<EventEnvelope>, StoreError> {
        let mut out = Vec::new();
        for topic in Topic::ALL {
            let log = self.read_log(topic)?;
            let mut cursors = self.cursors.lock();
            let cursor = &mut cursors[topic.index()];
            // A cleared log restarts numbering.
            if log.next_seq < *cursor {
                *cursor = 0;
            }
            out.extend(
                log.events
                    .into_iter()
                    .filter(|e| e.seq >= *cursor && e.origin != self.context_id),
            );
            *cursor = log.next_seq;
        }
        Ok(out)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        for topic in Topic::ALL {
            self.store.remove(&self.log_key(topic))?;
        }
        *self.cursors.lock() = [0; 3];
        Ok(())
    }
}
