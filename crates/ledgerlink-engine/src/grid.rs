//! Grid access-pattern detection and per-column batching.
//!
//! A user filling a block of formulas produces an entities × periods grid of
//! requests sharing one filter set. Detected grids are fetched one column
//! (period) at a time instead of one cell at a time.

use ledgerlink_common::{
    EntityId, FilterKey, FilterSet, Period, PeriodKey, QueryKind, ValueKey, ValueRequest,
};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::time::Duration;

use crate::config::GridConfig;
use crate::timer::{DebouncePolicy, DebounceTimer};

/// A single-period request visible to the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct GridCandidate {
    pub key: ValueKey,
    pub kind: QueryKind,
    pub entity: EntityId,
    pub period: Period,
    pub filters: FilterSet,
}

impl GridCandidate {
    /// Range and year requests never take part in grid detection.
    pub fn from_request(key: &ValueKey, request: &ValueRequest) -> Option<Self> {
        let period = request.period.as_single()?;
        Some(Self {
            key: key.clone(),
            kind: request.kind,
            entity: request.entity.clone(),
            period,
            filters: request.filters.clone(),
        })
    }

    pub fn column(&self) -> ColumnKey {
        ColumnKey {
            kind: self.kind,
            filters: self.key.filters.clone(),
            period: self.period,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GridMode {
    /// At least two entities over at least two periods.
    Primary,
    /// One period, at least two entities.
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridRejection {
    Disabled,
    Empty,
    TooLarge { entities: usize, columns: usize },
    MixedFilters,
    TooSparse { entities: usize, columns: usize },
}

impl Display for GridRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridRejection::Disabled => f.write_str("grid batching disabled"),
            GridRejection::Empty => f.write_str("no single-period candidates"),
            GridRejection::TooLarge { entities, columns } => {
                write!(f, "too large ({entities} entities x {columns} columns)")
            }
            GridRejection::MixedFilters => f.write_str("candidates disagree on filters"),
            GridRejection::TooSparse { entities, columns } => {
                write!(f, "too sparse ({entities} entities x {columns} columns)")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridDetectionResult {
    pub eligible: bool,
    pub mode: Option<GridMode>,
    pub kind: Option<QueryKind>,
    pub entities: BTreeSet<EntityId>,
    pub columns: BTreeSet<Period>,
    pub filters: Option<FilterSet>,
    pub filter_key: Option<FilterKey>,
    /// Earliest column; only set once the safety limits have passed.
    pub anchor: Option<Period>,
    pub rejection: Option<GridRejection>,
}

impl GridDetectionResult {
    fn rejected(reason: GridRejection) -> Self {
        Self {
            eligible: false,
            mode: None,
            kind: None,
            entities: BTreeSet::new(),
            columns: BTreeSet::new(),
            filters: None,
            filter_key: None,
            anchor: None,
            rejection: Some(reason),
        }
    }

    /// Whether a candidate belongs to the detected grid.
    pub fn covers(&self, candidate: &GridCandidate) -> bool {
        self.eligible
            && self.kind == Some(candidate.kind)
            && self.filter_key.as_ref() == Some(&candidate.key.filters)
            && self.columns.contains(&candidate.period)
            && self.entities.contains(&candidate.entity)
    }
}

/// Decide whether `candidates` form a batchable grid.
pub fn detect(candidates: &[GridCandidate], cfg: &GridConfig) -> GridDetectionResult {
    if !cfg.enabled {
        return GridDetectionResult::rejected(GridRejection::Disabled);
    }
    let Some(kind) = dominant_kind(candidates) else {
        return GridDetectionResult::rejected(GridRejection::Empty);
    };
    let wave: Vec<&GridCandidate> = candidates.iter().filter(|c| c.kind == kind).collect();

    let entities: BTreeSet<EntityId> = wave.iter().map(|c| c.entity.clone()).collect();
    let columns: BTreeSet<Period> = wave.iter().map(|c| c.period).collect();

    if entities.len() > cfg.max_entities || columns.len() > cfg.max_columns {
        return GridDetectionResult::rejected(GridRejection::TooLarge {
            entities: entities.len(),
            columns: columns.len(),
        });
    }

    let filter_key = &wave[0].key.filters;
    if wave.iter().any(|c| &c.key.filters != filter_key) {
        let mut r = GridDetectionResult::rejected(GridRejection::MixedFilters);
        r.kind = Some(kind);
        return r;
    }

    let mode = match (entities.len(), columns.len()) {
        (e, c) if e >= 2 && c >= 2 => GridMode::Primary,
        (e, 1) if e >= 2 && cfg.secondary_enabled => GridMode::Secondary,
        (e, c) => {
            let mut r = GridDetectionResult::rejected(GridRejection::TooSparse {
                entities: e,
                columns: c,
            });
            r.kind = Some(kind);
            return r;
        }
    };

    let anchor = columns.first().copied();
    GridDetectionResult {
        eligible: true,
        mode: Some(mode),
        kind: Some(kind),
        entities,
        columns,
        filters: Some(wave[0].filters.clone()),
        filter_key: Some(filter_key.clone()),
        anchor,
        rejection: None,
    }
}

fn dominant_kind(candidates: &[GridCandidate]) -> Option<QueryKind> {
    let mut counts: FxHashMap<QueryKind, usize> = FxHashMap::default();
    for c in candidates {
        *counts.entry(c.kind).or_default() += 1;
    }
    // Ties go to the lower kind so the choice is stable.
    counts
        .into_iter()
        .max_by(|(ka, a), (kb, b)| a.cmp(b).then(kb.cmp(ka)))
        .map(|(k, _)| k)
}

/// One column of a grid: a query kind, a filter set and a single period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnKey {
    pub kind: QueryKind,
    pub filters: FilterKey,
    pub period: Period,
}

impl ColumnKey {
    /// Single-flight key of the column fetch.
    pub fn flight_key(&self) -> String {
        format!("col:{}:{}:{}", self.kind, self.filters.short(), self.period.key())
    }

    pub fn supplemental_flight_key(&self, n: u32) -> String {
        format!("{}#sup{n}", self.flight_key())
    }

    pub fn value_key(&self, entity: &EntityId) -> ValueKey {
        ValueKey {
            kind: self.kind,
            entity: entity.clone(),
            period: PeriodKey::from(self.period),
            filters: self.filters.clone(),
        }
    }
}

impl Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flight_key())
    }
}

enum ColumnState {
    Collecting {
        entities: BTreeSet<EntityId>,
        filters: FilterSet,
        timer: DebounceTimer,
    },
    Sent {
        entities: BTreeSet<EntityId>,
        supplements: u32,
    },
}

/// What happened to an entity offered to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnAdmission {
    /// A new column started collecting; its collect timer must be armed.
    Opened,
    /// Joined a column that is still collecting.
    Merged,
    /// Already part of the column's in-flight fetch.
    Covered,
    /// The column was already sent without this entity.
    Supplemental,
}

/// Column fetch that is ready to go out.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedColumn {
    pub key: ColumnKey,
    pub flight_key: String,
    pub entities: Vec<EntityId>,
    pub filters: FilterSet,
}

pub struct ColumnBatcher {
    columns: FxHashMap<ColumnKey, ColumnState>,
    collect: Duration,
}

impl ColumnBatcher {
    pub fn new(collect: Duration) -> Self {
        Self {
            columns: FxHashMap::default(),
            collect,
        }
    }

    pub fn admit(&mut self, candidate: &GridCandidate) -> ColumnAdmission {
        let key = candidate.column();
        match self.columns.get_mut(&key) {
            None => {
                let mut entities = BTreeSet::new();
                entities.insert(candidate.entity.clone());
                let policy = DebouncePolicy::new(self.collect, Some(self.collect));
                self.columns.insert(
                    key,
                    ColumnState::Collecting {
                        entities,
                        filters: candidate.filters.clone(),
                        timer: DebounceTimer::new(policy),
                    },
                );
                ColumnAdmission::Opened
            }
            Some(ColumnState::Collecting { entities, .. }) => {
                entities.insert(candidate.entity.clone());
                ColumnAdmission::Merged
            }
            Some(ColumnState::Sent { entities, .. }) => {
                if entities.insert(candidate.entity.clone()) {
                    ColumnAdmission::Supplemental
                } else {
                    ColumnAdmission::Covered
                }
            }
        }
    }

    /// Arm the collect timer of a column that is still collecting.
    pub fn arm<F>(&mut self, key: &ColumnKey, on_fire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.columns.get_mut(key) {
            Some(ColumnState::Collecting { timer, .. }) => {
                timer.arm(on_fire);
                true
            }
            _ => false,
        }
    }

    /// Stop collecting and hand back the column's fetch.
    pub fn seal(&mut self, key: &ColumnKey) -> Option<SealedColumn> {
        let state = self.columns.get_mut(key)?;
        let ColumnState::Collecting { entities, filters, timer } = state else {
            return None;
        };
        timer.cancel();
        let sealed = SealedColumn {
            key: key.clone(),
            flight_key: key.flight_key(),
            entities: entities.iter().cloned().collect(),
            filters: filters.clone(),
        };
        *state = ColumnState::Sent {
            entities: std::mem::take(entities),
            supplements: 0,
        };
        Some(sealed)
    }

    /// Build a supplemental fetch for entities admitted after the column was sent.
    pub fn supplement(
        &mut self,
        key: &ColumnKey,
        entities: Vec<EntityId>,
        filters: FilterSet,
    ) -> Option<SealedColumn> {
        match self.columns.get_mut(key) {
            Some(ColumnState::Sent { supplements, .. }) => {
                *supplements += 1;
                Some(SealedColumn {
                    key: key.clone(),
                    flight_key: key.supplemental_flight_key(*supplements),
                    entities,
                    filters,
                })
            }
            _ => None,
        }
    }

    /// Forget a sent column once its fetch has settled.
    pub fn complete(&mut self, key: &ColumnKey) {
        if matches!(self.columns.get(key), Some(ColumnState::Sent { .. })) {
            self.columns.remove(key);
        }
    }

    /// Cancel every collecting column and return the keys of the requests
    /// they were holding. Sent columns are left to settle.
    pub fn cancel_collecting(&mut self) -> Vec<ValueKey> {
        let mut keys = Vec::new();
        self.columns.retain(|column, state| match state {
            ColumnState::Collecting { entities, timer, .. } => {
                timer.cancel();
                keys.extend(entities.iter().map(|e| column.value_key(e)));
                false
            }
            ColumnState::Sent { .. } => true,
        });
        keys
    }

    pub fn collecting_keys(&self) -> Vec<ColumnKey> {
        let mut keys: Vec<ColumnKey> = self
            .columns
            .iter()
            .filter(|(_, s)| matches!(s, ColumnState::Collecting { .. }))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn is_collecting(&self, key: &ColumnKey) -> bool {
        matches!(self.columns.get(key), Some(ColumnState::Collecting { .. }))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(kind: QueryKind, entity: &str, period: &str, filters: &FilterSet) -> GridCandidate {
        let req = ValueRequest::parse(kind, entity, period, filters.clone()).unwrap();
        GridCandidate::from_request(&req.key(), &req).unwrap()
    }

    fn grid(entities: &[&str], periods: &[&str], filters: &FilterSet) -> Vec<GridCandidate> {
        let mut out = Vec::new();
        for e in entities {
            for p in periods {
                out.push(cand(QueryKind::Balance, e, p, filters));
            }
        }
        out
    }

    fn parent() -> FilterSet {
        FilterSet::new().with_subsidiary("Parent Co")
    }

    #[test]
    fn three_by_three_is_primary() {
        let c = grid(&["4000", "4010", "4020"], &["Jan 2025", "Feb 2025", "Mar 2025"], &parent());
        let r = detect(&c, &GridConfig::default());
        assert!(r.eligible);
        assert_eq!(r.mode, Some(GridMode::Primary));
        assert_eq!(r.entities.len(), 3);
        assert_eq!(r.columns.len(), 3);
        assert_eq!(r.anchor, Period::new(2025, 1));
        assert!(c.iter().all(|x| r.covers(x)));
    }

    #[test]
    fn three_by_one_is_secondary() {
        let c = grid(&["4000", "4010", "4020"], &["Jan 2025"], &parent());
        let r = detect(&c, &GridConfig::default());
        assert!(r.eligible);
        assert_eq!(r.mode, Some(GridMode::Secondary));

        let cfg = GridConfig {
            secondary_enabled: false,
            ..Default::default()
        };
        let r = detect(&c, &cfg);
        assert!(!r.eligible);
        assert!(matches!(r.rejection, Some(GridRejection::TooSparse { .. })));
    }

    #[test]
    fn one_by_three_is_ineligible() {
        let c = grid(&["4000"], &["Jan 2025", "Feb 2025", "Mar 2025"], &parent());
        let r = detect(&c, &GridConfig::default());
        assert!(!r.eligible);
        assert_eq!(
            r.rejection,
            Some(GridRejection::TooSparse {
                entities: 1,
                columns: 3
            })
        );
    }

    #[test]
    fn one_odd_filter_set_rejects_the_grid() {
        let mut c = grid(&["4000", "4010", "4020"], &["Jan 2025", "Feb 2025", "Mar 2025"], &parent());
        c[4] = cand(
            QueryKind::Balance,
            "4010",
            "Feb 2025",
            &FilterSet::new().with_subsidiary("Other Co"),
        );
        let r = detect(&c, &GridConfig::default());
        assert!(!r.eligible);
        assert_eq!(r.rejection, Some(GridRejection::MixedFilters));
    }

    #[test]
    fn limits_are_checked_before_anything_else() {
        let entities: Vec<String> = (0..6).map(|i| format!("{}", 4000 + i)).collect();
        let refs: Vec<&str> = entities.iter().map(String::as_str).collect();
        let mut c = grid(&refs, &["Jan 2025", "Feb 2025"], &parent());
        // Mixed filters too; the size limit must win.
        c.push(cand(QueryKind::Balance, "9999", "Jan 2025", &FilterSet::new()));
        let cfg = GridConfig {
            max_entities: 5,
            ..Default::default()
        };
        let r = detect(&c, &cfg);
        assert!(!r.eligible);
        assert_eq!(
            r.rejection,
            Some(GridRejection::TooLarge {
                entities: 7,
                columns: 2
            })
        );
        assert_eq!(r.anchor, None);
    }

    #[test]
    fn minority_kind_is_ignored() {
        let mut c = grid(&["4000", "4010"], &["Jan 2025", "Feb 2025"], &parent());
        c.push(cand(QueryKind::Budget, "4000", "Jan 2025", &FilterSet::new()));
        let r = detect(&c, &GridConfig::default());
        assert!(r.eligible);
        assert_eq!(r.kind, Some(QueryKind::Balance));
        assert!(!r.covers(c.last().unwrap()));
    }

    #[test]
    fn range_requests_are_not_candidates() {
        let req = ValueRequest::parse(QueryKind::Balance, "4000", "Jan 2025 to Mar 2025", parent())
            .unwrap();
        assert!(GridCandidate::from_request(&req.key(), &req).is_none());
        assert_eq!(detect(&[], &GridConfig::default()).rejection, Some(GridRejection::Empty));
    }

    #[tokio::test]
    async fn column_lifecycle() {
        let f = parent();
        let mut b = ColumnBatcher::new(Duration::from_millis(50));
        let a = cand(QueryKind::Balance, "4000", "Jan 2025", &f);
        let c = cand(QueryKind::Balance, "4010", "Jan 2025", &f);
        let late = cand(QueryKind::Balance, "4020", "Jan 2025", &f);
        let key = a.column();

        assert_eq!(b.admit(&a), ColumnAdmission::Opened);
        assert!(b.arm(&key, || {}));
        assert_eq!(b.admit(&c), ColumnAdmission::Merged);

        let sealed = b.seal(&key).unwrap();
        assert_eq!(sealed.entities.len(), 2);
        assert_eq!(sealed.flight_key, key.flight_key());
        assert!(b.seal(&key).is_none());

        assert_eq!(b.admit(&a), ColumnAdmission::Covered);
        assert_eq!(b.admit(&late), ColumnAdmission::Supplemental);
        let sup = b.supplement(&key, vec![late.entity.clone()], f.clone()).unwrap();
        assert!(sup.flight_key.ends_with("#sup1"));

        b.complete(&key);
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn cancel_collecting_returns_held_keys() {
        let f = parent();
        let mut b = ColumnBatcher::new(Duration::from_millis(50));
        let a = cand(QueryKind::Balance, "4000", "Jan 2025", &f);
        let c = cand(QueryKind::Balance, "4010", "Feb 2025", &f);
        b.admit(&a);
        b.admit(&c);
        b.seal(&c.column());
        let keys = b.cancel_collecting();
        assert_eq!(keys, vec![a.key.clone()]);
        assert_eq!(b.len(), 1);
    }
}
