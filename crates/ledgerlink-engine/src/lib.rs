//! Request-coalescing and adaptive batch-scheduling engine.
//!
//! [`BatchEngine`] sits between a formula surface that fires many concurrent
//! value requests and a slow, rate-limited ledger service. It answers from
//! bounded caches where it can, coalesces misses behind a debounce timer,
//! turns grids of per-cell requests into per-column fetches, and keeps
//! independent execution contexts coordinated through a persisted manifest.

pub mod bus;
pub mod cache;
pub mod claims;
pub mod config;
pub mod engine;
pub mod flight;
pub mod gate;
pub mod grid;
pub mod manifest;
pub mod mode;
pub mod persist;
pub mod preload;
pub mod priority;
pub mod queue;
pub mod stats;
pub mod timer;
pub mod wave;

pub use bus::{ContextEvent, EventEnvelope, InvalidateScope, PreloadSlot, Topic};
pub use cache::{BoundedCache, CacheCounters};
pub use config::{
    BuildModeConfig, CacheConfig, ConcurrencyConfig, ConfigError, DebounceConfig, EngineConfig,
    ExclusivePriorities, GridConfig, ManifestConfig, PersistenceConfig, PreloadConfig,
};
pub use engine::{BatchEngine, new_engine};
pub use gate::GateSnapshot;
pub use grid::{GridCandidate, GridDetectionResult, GridMode, GridRejection, detect};
pub use manifest::{ManifestEntry, ManifestSlot, ManifestStatus, PrecacheManifest, WaitOutcome};
pub use priority::{LockError, PriorityLock};
pub use stats::StatsSnapshot;
