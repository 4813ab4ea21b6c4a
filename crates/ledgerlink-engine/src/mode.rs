use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::BuildModeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeTransition {
    Entered,
    Unchanged,
}

/// Detects a burst of arrivals and switches into build mode.
///
/// While active, misses accumulate instead of going through the regular
/// debounce queue; the owner flushes the accumulation once arrivals have
/// been quiet for the settle period.
#[derive(Debug)]
pub struct ModeSwitch {
    enabled: bool,
    window: Duration,
    threshold: usize,
    settle: Duration,
    arrivals: VecDeque<Instant>,
    active: bool,
    last_arrival: Option<Instant>,
    entries: u64,
    exits: u64,
}

impl ModeSwitch {
    pub fn new(cfg: &BuildModeConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            window: cfg.window,
            threshold: cfg.threshold.max(1),
            settle: cfg.settle,
            arrivals: VecDeque::new(),
            active: false,
            last_arrival: None,
            entries: 0,
            exits: 0,
        }
    }

    /// Record an arrival at `now`.
    pub fn observe(&mut self, now: Instant) -> ModeTransition {
        self.last_arrival = Some(now);
        if !self.enabled {
            return ModeTransition::Unchanged;
        }
        self.arrivals.push_back(now);
        while let Some(&front) = self.arrivals.front() {
            if now.saturating_duration_since(front) > self.window {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
        if !self.active && self.arrivals.len() >= self.threshold {
            self.active = true;
            self.entries += 1;
            tracing::debug!(arrivals = self.arrivals.len(), "entering build mode");
            return ModeTransition::Entered;
        }
        ModeTransition::Unchanged
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// No arrival for at least the settle period.
    pub fn settled(&self, now: Instant) -> bool {
        self.last_arrival
            .is_none_or(|last| now.saturating_duration_since(last) >= self.settle)
    }

    pub fn exit(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.arrivals.clear();
        self.exits += 1;
        tracing::debug!("leaving build mode");
        true
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn exits(&self) -> u64 {
        self.exits
    }
}
