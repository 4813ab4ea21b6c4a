use ledgerlink_common::{FetchError, ValueKey};
use rustc_hash::FxHashMap;

use crate::queue::{PendingRequest, ValueResult, Waiter};

/// Keys with a remote fetch currently running.
///
/// Holding a claim means "this key's answer is on its way"; a later miss for
/// the same key attaches to the claim instead of being queued again.
#[derive(Default)]
pub struct ClaimRegistry {
    claims: FxHashMap<ValueKey, PendingRequest>,
}

impl ClaimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, key: &ValueKey) -> Option<Waiter> {
        self.claims.get_mut(key).map(PendingRequest::attach)
    }

    /// Claim `request`'s key. If the key is already claimed the waiters are
    /// merged into the existing claim and `false` is returned.
    pub fn claim(&mut self, request: PendingRequest) -> bool {
        match self.claims.get_mut(&request.key) {
            Some(existing) => {
                existing.absorb(request);
                false
            }
            None => {
                self.claims.insert(request.key.clone(), request);
                true
            }
        }
    }

    pub fn is_claimed(&self, key: &ValueKey) -> bool {
        self.claims.contains_key(key)
    }

    /// Release a claim and hand back its waiters for settling.
    pub fn release(&mut self, key: &ValueKey) -> Option<PendingRequest> {
        self.claims.remove(key)
    }

    pub fn settle(&mut self, key: &ValueKey, result: ValueResult) -> usize {
        self.release(key).map(|p| p.settle(result)).unwrap_or(0)
    }

    pub fn reject(&mut self, key: &ValueKey, error: FetchError) -> usize {
        self.release(key).map(|p| p.reject(error)).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
