//! Lightweight engine counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated from every engine path. All relaxed; they are for
/// observation, never for control flow.
#[derive(Debug, Default)]
pub struct EngineStats {
    // Lookups
    pub requests: AtomicU64,
    pub memory_hits: AtomicU64,
    pub persisted_hits: AtomicU64,
    pub preload_hits: AtomicU64,
    pub misses: AtomicU64,
    pub queue_merges: AtomicU64,
    pub claim_joins: AtomicU64,

    // Dispatch
    pub flushes: AtomicU64,
    pub grid_batches: AtomicU64,
    pub grid_rejections: AtomicU64,
    pub column_fetches: AtomicU64,
    pub supplemental_fetches: AtomicU64,
    pub row_fetches: AtomicU64,
    pub cell_fallbacks: AtomicU64,
    pub remote_failures: AtomicU64,

    // Preload coordination
    pub preloads_run: AtomicU64,
    pub preload_waits: AtomicU64,
    pub preload_timeouts: AtomicU64,
    pub inconsistencies: AtomicU64,
    pub stale_manifest_reads: AtomicU64,
    pub overflow_rejections: AtomicU64,

    // Persistence
    pub persisted_writes: AtomicU64,
    pub quota_evictions: AtomicU64,

    // Mode switch
    pub build_mode_entries: AtomicU64,
    pub build_mode_exits: AtomicU64,

    // Exclusive and metadata
    pub exclusive_runs: AtomicU64,
    pub metadata_fetches: AtomicU64,
    pub resets: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub memory_hits: u64,
    pub persisted_hits: u64,
    pub preload_hits: u64,
    pub misses: u64,
    pub queue_merges: u64,
    pub claim_joins: u64,
    pub flushes: u64,
    pub grid_batches: u64,
    pub grid_rejections: u64,
    pub column_fetches: u64,
    pub supplemental_fetches: u64,
    pub row_fetches: u64,
    pub cell_fallbacks: u64,
    pub remote_failures: u64,
    pub preloads_run: u64,
    pub preload_waits: u64,
    pub preload_timeouts: u64,
    pub inconsistencies: u64,
    pub stale_manifest_reads: u64,
    pub overflow_rejections: u64,
    pub persisted_writes: u64,
    pub quota_evictions: u64,
    pub build_mode_entries: u64,
    pub build_mode_exits: u64,
    pub exclusive_runs: u64,
    pub metadata_fetches: u64,
    pub resets: u64,
}

impl StatsSnapshot {
    /// Remote calls of every kind issued by the value path.
    pub fn value_fetches(&self) -> u64 {
        self.column_fetches + self.supplemental_fetches + self.row_fetches
    }
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn all(&self) -> [&AtomicU64; 28] {
        [
            &self.requests,
            &self.memory_hits,
            &self.persisted_hits,
            &self.preload_hits,
            &self.misses,
            &self.queue_merges,
            &self.claim_joins,
            &self.flushes,
            &self.grid_batches,
            &self.grid_rejections,
            &self.column_fetches,
            &self.supplemental_fetches,
            &self.row_fetches,
            &self.cell_fallbacks,
            &self.remote_failures,
            &self.preloads_run,
            &self.preload_waits,
            &self.preload_timeouts,
            &self.inconsistencies,
            &self.stale_manifest_reads,
            &self.overflow_rejections,
            &self.persisted_writes,
            &self.quota_evictions,
            &self.build_mode_entries,
            &self.build_mode_exits,
            &self.exclusive_runs,
            &self.metadata_fetches,
            &self.resets,
        ]
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let [
            requests,
            memory_hits,
            persisted_hits,
            preload_hits,
            misses,
            queue_merges,
            claim_joins,
            flushes,
            grid_batches,
            grid_rejections,
            column_fetches,
            supplemental_fetches,
            row_fetches,
            cell_fallbacks,
            remote_failures,
            preloads_run,
            preload_waits,
            preload_timeouts,
            inconsistencies,
            stale_manifest_reads,
            overflow_rejections,
            persisted_writes,
            quota_evictions,
            build_mode_entries,
            build_mode_exits,
            exclusive_runs,
            metadata_fetches,
            resets,
        ] = self.all().map(|c| c.load(Ordering::Relaxed));
        StatsSnapshot {
            requests,
            memory_hits,
            persisted_hits,
            preload_hits,
            misses,
            queue_merges,
            claim_joins,
            flushes,
            grid_batches,
            grid_rejections,
            column_fetches,
            supplemental_fetches,
            row_fetches,
            cell_fallbacks,
            remote_failures,
            preloads_run,
            preload_waits,
            preload_timeouts,
            inconsistencies,
            stale_manifest_reads,
            overflow_rejections,
            persisted_writes,
            quota_evictions,
            build_mode_entries,
            build_mode_exits,
            exclusive_runs,
            metadata_fetches,
            resets,
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for c in self.all() {
            c.store(0, Ordering::Relaxed);
        }
    }
}
