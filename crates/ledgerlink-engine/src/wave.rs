use ledgerlink_common::{QueryKind, ValueKey};
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::grid::GridCandidate;

/// Requests issued recently enough to count as part of the current
/// evaluation wave. Grid detection looks at these alongside the queue so a
/// grid split across two flushes is still recognised.
pub struct EvaluatingSet {
    entries: FxHashMap<ValueKey, (GridCandidate, Instant)>,
    ttl: Duration,
}

impl EvaluatingSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: FxHashMap::default(),
            ttl,
        }
    }

    pub fn insert(&mut self, candidate: GridCandidate, now: Instant) {
        self.entries.insert(candidate.key.clone(), (candidate, now));
    }

    pub fn remove(&mut self, key: &ValueKey) {
        self.entries.remove(key);
    }

    /// Live candidates of `kind` (or every kind), pruning expired entries.
    pub fn snapshot(&mut self, kind: Option<QueryKind>, now: Instant) -> Vec<GridCandidate> {
        let ttl = self.ttl;
        self.entries
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < ttl);
        self.entries
            .values()
            .filter(|(c, _)| kind.is_none_or(|k| c.kind == k))
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerlink_common::{FilterSet, ValueRequest};

    fn cand(kind: QueryKind, entity: &str) -> GridCandidate {
        let req = ValueRequest::parse(kind, entity, "Jan 2025", FilterSet::new()).unwrap();
        GridCandidate::from_request(&req.key(), &req).unwrap()
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut set = EvaluatingSet::new(Duration::from_millis(100));
        let t0 = Instant::now();
        set.insert(cand(QueryKind::Balance, "4000"), t0);
        set.insert(cand(QueryKind::Balance, "4010"), t0 + Duration::from_millis(80));
        let live = set.snapshot(None, t0 + Duration::from_millis(120));
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].entity.as_str(), "4010");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn snapshot_filters_by_kind() {
        let mut set = EvaluatingSet::new(Duration::from_secs(1));
        let now = Instant::now();
        set.insert(cand(QueryKind::Balance, "4000"), now);
        set.insert(cand(QueryKind::Budget, "4000"), now);
        assert_eq!(set.snapshot(Some(QueryKind::Budget), now).len(), 1);
        assert_eq!(set.snapshot(None, now).len(), 2);
        set.remove(&cand(QueryKind::Budget, "4000").key);
        assert_eq!(set.snapshot(None, now).len(), 1);
    }
}
