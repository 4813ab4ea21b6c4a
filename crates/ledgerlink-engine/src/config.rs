//! Engine configuration.
//!
//! Every constant that was tuned against a particular remote service lives
//! here rather than in code: concurrency caps, grid ceilings, retry ceilings,
//! debounce timings and the preload overflow ceiling.

use ledgerlink_common::ExclusiveKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not parse engine config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid engine config: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Durations are written as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

/// Capacities of the per-domain bounded caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub value_capacity: usize,
    pub label_capacity: usize,
    pub classification_capacity: usize,
    pub exclusive_capacity: usize,
    /// Share of capacity evicted at once when a cache overflows.
    pub eviction_fraction: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            value_capacity: 20_000,
            label_capacity: 5_000,
            classification_capacity: 5_000,
            exclusive_capacity: 2_000,
            eviction_fraction: 0.1,
        }
    }
}

/// Quiet period and hard cap of the value request queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    #[serde(with = "duration_ms")]
    pub quiet: Duration,
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet: Duration::from_millis(150),
            max_wait: Duration::from_millis(1_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub enabled: bool,
    pub max_entities: usize,
    pub max_columns: usize,
    /// Allow single-column grids (one period, many entities).
    pub secondary_enabled: bool,
    /// How long a column keeps merging late entities before it is sent.
    #[serde(with = "duration_ms")]
    pub column_collect: Duration,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entities: 250,
            max_columns: 24,
            secondary_enabled: true,
            column_collect: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// Failed attempts after which waiting callers stop retrying a preload.
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
    /// Cache re-checks after a slice reports completed.
    pub inconsistency_retries: u32,
    #[serde(with = "duration_ms")]
    pub inconsistency_backoff: Duration,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            poll_interval: Duration::from_millis(250),
            max_wait: Duration::from_secs(15),
            inconsistency_retries: 3,
            inconsistency_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    pub enabled: bool,
    /// Run flushed preloads in this context instead of leaving them to others.
    pub execute_locally: bool,
    #[serde(with = "duration_ms")]
    pub quiet: Duration,
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
    /// Queued-but-unflushed signals tolerated before the kill-switch trips.
    pub overflow_ceiling: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            execute_locally: true,
            quiet: Duration::from_millis(200),
            max_wait: Duration::from_millis(1_000),
            overflow_ceiling: 500,
        }
    }
}

/// Lock priorities of the exclusive computation kinds. Lower runs first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusivePriorities {
    pub prior_period_rollup: u32,
    pub net_change: u32,
    pub consolidation_adjustment: u32,
}

impl Default for ExclusivePriorities {
    fn default() -> Self {
        Self {
            prior_period_rollup: 0,
            net_change: 1,
            consolidation_adjustment: 2,
        }
    }
}

impl ExclusivePriorities {
    pub fn for_kind(&self, kind: ExclusiveKind) -> u32 {
        match kind {
            ExclusiveKind::PriorPeriodRollup => self.prior_period_rollup,
            ExclusiveKind::NetChange => self.net_change,
            ExclusiveKind::ConsolidationAdjustment => self.consolidation_adjustment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Simultaneous remote fetches across all keys.
    pub max_bulk_fetches: usize,
    pub exclusive_priorities: ExclusivePriorities,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_bulk_fetches: 3,
            exclusive_priorities: ExclusivePriorities::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildModeConfig {
    pub enabled: bool,
    /// Rolling window arrivals are counted over.
    #[serde(with = "duration_ms")]
    pub window: Duration,
    /// Arrivals within `window` that switch build mode on.
    pub threshold: usize,
    /// Quiet time after the last arrival before build mode exits.
    #[serde(with = "duration_ms")]
    pub settle: Duration,
    /// Forces a flush of the accumulation under uninterrupted load.
    #[serde(with = "opt_duration_ms")]
    pub max_wait: Option<Duration>,
}

impl Default for BuildModeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_millis(400),
            threshold: 3,
            settle: Duration::from_millis(600),
            max_wait: Some(Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Prefix of every key this engine writes to the persisted store.
    pub namespace: String,
    /// Age after which persisted values are ignored.
    #[serde(with = "duration_ms")]
    pub max_age: Duration,
    pub max_entries: usize,
    /// Share of own entries dropped when the store reports quota exhaustion.
    pub quota_eviction_fraction: f64,
    /// Events kept per topic log.
    pub event_retention: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            namespace: "ledgerlink".to_string(),
            max_age: Duration::from_secs(15 * 60),
            max_entries: 50_000,
            quota_eviction_fraction: 0.25,
            event_retention: 256,
        }
    }
}

/// Configuration for the batch engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub debounce: DebounceConfig,
    pub grid: GridConfig,
    pub manifest: ManifestConfig,
    pub preload: PreloadConfig,
    pub concurrency: ConcurrencyConfig,
    pub build_mode: BuildModeConfig,
    pub persistence: PersistenceConfig,
    /// How long a request stays visible to grid detection after it was issued.
    #[serde(with = "duration_ms")]
    pub evaluating_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            debounce: DebounceConfig::default(),
            grid: GridConfig::default(),
            manifest: ManifestConfig::default(),
            preload: PreloadConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            build_mode: BuildModeConfig::default(),
            persistence: PersistenceConfig::default(),
            evaluating_ttl: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Short timings for a user typing into a live sheet.
    pub fn interactive() -> Self {
        Self {
            debounce: DebounceConfig {
                quiet: Duration::from_millis(80),
                max_wait: Duration::from_millis(500),
            },
            build_mode: BuildModeConfig {
                settle: Duration::from_millis(400),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// One remote call at a time and longer coalescing windows.
    pub fn conservative() -> Self {
        Self {
            debounce: DebounceConfig {
                quiet: Duration::from_millis(300),
                max_wait: Duration::from_secs(2),
            },
            concurrency: ConcurrencyConfig {
                max_bulk_fetches: 1,
                ..Default::default()
            },
            grid: GridConfig {
                max_entities: 100,
                max_columns: 12,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Parse a JSON document; absent fields keep their defaults.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }
        let c = &self.cache;
        for (field, cap) in [
            ("cache.value_capacity", c.value_capacity),
            ("cache.label_capacity", c.label_capacity),
            ("cache.classification_capacity", c.classification_capacity),
            ("cache.exclusive_capacity", c.exclusive_capacity),
        ] {
            if cap == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if !(c.eviction_fraction > 0.0 && c.eviction_fraction <= 1.0) {
            return Err(invalid("cache.eviction_fraction", "must be in (0, 1]"));
        }
        if self.debounce.max_wait < self.debounce.quiet {
            return Err(invalid("debounce.max_wait", "must not be shorter than debounce.quiet"));
        }
        if self.grid.max_entities < 2 || self.grid.max_columns < 1 {
            return Err(invalid("grid", "limits leave no eligible grid"));
        }
        if self.manifest.max_attempts == 0 {
            return Err(invalid("manifest.max_attempts", "must be at least 1"));
        }
        if self.manifest.poll_interval.is_zero() {
            return Err(invalid("manifest.poll_interval", "must be non-zero"));
        }
        if self.preload.overflow_ceiling == 0 {
            return Err(invalid("preload.overflow_ceiling", "must be greater than zero"));
        }
        if self.concurrency.max_bulk_fetches == 0 {
            return Err(invalid("concurrency.max_bulk_fetches", "must be greater than zero"));
        }
        if self.build_mode.threshold == 0 {
            return Err(invalid("build_mode.threshold", "must be greater than zero"));
        }
        if self.evaluating_ttl.is_zero() {
            return Err(invalid("evaluating_ttl", "must be non-zero"));
        }
        let p = &self.persistence;
        if p.namespace.trim().is_empty() {
            return Err(invalid("persistence.namespace", "must not be blank"));
        }
        if !(p.quota_eviction_fraction > 0.0 && p.quota_eviction_fraction <= 1.0) {
            return Err(invalid("persistence.quota_eviction_fraction", "must be in (0, 1]"));
        }
        Ok(())
    }
}
