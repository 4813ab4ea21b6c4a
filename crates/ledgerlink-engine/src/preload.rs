use ledgerlink_common::FetchError;
use rustc_hash::FxHashSet;

use crate::bus::PreloadSlot;
use crate::timer::{DebouncePolicy, DebounceTimer};

/// Coalesces preload signals into one manifest write per flush.
///
/// Signals for a slot already queued are absorbed. Once the number of
/// queued-but-unflushed slots reaches the ceiling the queue trips: every
/// further signal is refused with `QueueOverflow` until the queue is drained
/// or reset.
pub struct PreloadQueue {
    pending: FxHashSet<PreloadSlot>,
    order: Vec<PreloadSlot>,
    timer: DebounceTimer,
    ceiling: usize,
    tripped: bool,
    refused: u64,
}

impl PreloadQueue {
    pub fn new(policy: DebouncePolicy, ceiling: usize) -> Self {
        Self {
            pending: FxHashSet::default(),
            order: Vec::new(),
            timer: DebounceTimer::new(policy),
            ceiling: ceiling.max(1),
            tripped: false,
            refused: 0,
        }
    }

    /// Queue `slot`. `Ok(true)` when newly queued, `Ok(false)` when absorbed.
    pub fn signal(&mut self, slot: PreloadSlot) -> Result<bool, FetchError> {
        if self.tripped {
            self.refused += 1;
            return Err(FetchError::overflow("preload queue is refusing writes"));
        }
        if self.pending.contains(&slot) {
            return Ok(false);
        }
        if self.pending.len() >= self.ceiling {
            self.tripped = true;
            self.refused += 1;
            tracing::error!(
                pending = self.pending.len(),
                ceiling = self.ceiling,
                "preload queue overflow; refusing further preload requests until drained"
            );
            return Err(FetchError::overflow(format!(
                "preload queue exceeded {} pending slices",
                self.ceiling
            )));
        }
        self.pending.insert(slot.clone());
        self.order.push(slot);
        Ok(true)
    }

    pub fn arm<F>(&mut self, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.timer.arm(on_fire);
    }

    /// Take every queued slot in arrival order. Re-opens a tripped queue.
    pub fn drain(&mut self) -> Vec<PreloadSlot> {
        self.timer.cancel();
        self.pending.clear();
        self.tripped = false;
        std::mem::take(&mut self.order)
    }

    /// Put slots whose flush failed back at the front, ahead of anything
    /// signalled since. The ceiling is not applied to them.
    pub fn requeue(&mut self, slots: Vec<PreloadSlot>) {
        let mut restored: Vec<PreloadSlot> = slots
            .into_iter()
            .filter(|slot| self.pending.insert(slot.clone()))
            .collect();
        restored.append(&mut self.order);
        self.order = restored;
    }

    pub fn reset(&mut self) {
        self.drain();
        self.refused = 0;
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn refused(&self) -> u64 {
        self.refused
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
