//! Debounce timers.
//!
//! A timer fires `quiet` after the last arm, but never later than `max_wait`
//! after the first arm of the current window. Re-arming replaces the pending
//! task; firing runs a synchronous callback that is expected to hand real work
//! off to a fresh task, so cancelling a timer never interrupts a dispatch.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebouncePolicy {
    pub quiet: Duration,
    pub max_wait: Option<Duration>,
}

impl DebouncePolicy {
    pub fn new(quiet: Duration, max_wait: Option<Duration>) -> Self {
        Self { quiet, max_wait }
    }

    /// Deadline for a window that opened at `window_start`, re-armed at `now`.
    pub fn fire_at(&self, window_start: Instant, now: Instant) -> Instant {
        let quiet = now + self.quiet;
        match self.max_wait {
            Some(cap) => quiet.min(window_start + cap),
            None => quiet,
        }
    }
}

#[derive(Debug)]
pub struct DebounceTimer {
    policy: DebouncePolicy,
    window_start: Option<Instant>,
    deadline: Option<Instant>,
    handle: Option<JoinHandle<()>>,
}

impl DebounceTimer {
    pub fn new(policy: DebouncePolicy) -> Self {
        Self {
            policy,
            window_start: None,
            deadline: None,
            handle: None,
        }
    }

    pub fn policy(&self) -> DebouncePolicy {
        self.policy
    }

    /// (Re)arm the timer and return the new deadline. Must be called from
    /// within a tokio runtime.
    pub fn arm<F>(&mut self, on_fire: F) -> Instant
    where
        F: FnOnce() + Send + 'static,
    {
        let now = Instant::now();
        if self.handle.as_ref().is_some_and(|h| h.is_finished()) {
            // Previous window already fired.
            self.window_start = None;
        }
        let start = *self.window_start.get_or_insert(now);
        let at = self.policy.fire_at(start, now);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.deadline = Some(at);
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            on_fire();
        }));
        at
    }

    /// Cancel the pending fire and close the window.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.window_start = None;
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn window_start(&self) -> Option<Instant> {
        self.window_start
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
