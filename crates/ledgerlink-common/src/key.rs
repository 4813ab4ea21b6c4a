//! Request and cache key types.
//!
//! Every request is normalized into one of these before it touches a cache,
//! a queue, or the network. Keys are plain values; the caches and queues own
//! whatever is attached to them.

use std::fmt::{self, Display};

use crate::{FetchError, FilterKey, FilterSet, Period, PeriodExpr, PeriodKey};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Ledger entity identifier (an account number).
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
    /// Normalize a caller-supplied identifier.
    ///
    /// `"4000 - Revenue"`, `"4000 Revenue"` and `" 4000 "` all become `4000`.
    /// Alphanumeric identifiers are upper-cased.
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        let trimmed = raw.trim();
        let head = match trimmed.split_once(" - ") {
            Some((head, _)) => head.trim(),
            None => {
                let mut tokens = trimmed.split_whitespace();
                match tokens.next() {
                    Some(first) if first.chars().any(|c| c.is_ascii_digit()) => first,
                    _ => trimmed,
                }
            }
        };
        if head.is_empty() {
            return Err(FetchError::invalid("empty entity id"));
        }
        Ok(EntityId(head.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Query shape. Grid detection only groups requests of the same kind.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKind {
    Balance,
    Budget,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::Balance => "balance",
            QueryKind::Budget => "budget",
        }
    }
}

impl Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized value request.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueRequest {
    pub kind: QueryKind,
    pub entity: EntityId,
    pub period: PeriodExpr,
    pub filters: FilterSet,
}

impl ValueRequest {
    /// Normalize raw formula arguments.
    pub fn parse(
        kind: QueryKind,
        entity: &str,
        period: &str,
        filters: FilterSet,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            kind,
            entity: EntityId::parse(entity)?,
            period: PeriodExpr::parse(period)?,
            filters,
        })
    }

    pub fn new(kind: QueryKind, entity: EntityId, period: PeriodExpr, filters: FilterSet) -> Self {
        Self {
            kind,
            entity,
            period,
            filters,
        }
    }

    pub fn key(&self) -> ValueKey {
        ValueKey {
            kind: self.kind,
            entity: self.entity.clone(),
            period: self.period.key(),
            filters: self.filters.key(),
        }
    }
}

/// Composite cache key: kind, entity, period expression and filter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueKey {
    pub kind: QueryKind,
    pub entity: EntityId,
    pub period: PeriodKey,
    pub filters: FilterKey,
}

impl Display for ValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{}#{}",
            self.kind,
            self.entity,
            self.period,
            self.filters.short()
        )
    }
}

/// Expensive computations that must never run concurrently on the remote side.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExclusiveKind {
    /// Cumulative balance of every period before an anchor.
    PriorPeriodRollup,
    /// Net change over a period range.
    NetChange,
    /// Multi-currency consolidation adjustment.
    ConsolidationAdjustment,
}

impl ExclusiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExclusiveKind::PriorPeriodRollup => "prior_period_rollup",
            ExclusiveKind::NetChange => "net_change",
            ExclusiveKind::ConsolidationAdjustment => "consolidation_adjustment",
        }
    }
}

impl Display for ExclusiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single-entity exclusive computation anchored at a period.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExclusiveRequest {
    pub kind: ExclusiveKind,
    pub entity: EntityId,
    pub anchor: Period,
    /// End of the range for `NetChange`; ignored by the other kinds.
    pub through: Option<Period>,
    pub filters: FilterSet,
}

impl ExclusiveRequest {
    pub fn new(kind: ExclusiveKind, entity: EntityId, anchor: Period, filters: FilterSet) -> Self {
        Self {
            kind,
            entity,
            anchor,
            through: None,
            filters,
        }
    }

    pub fn through(mut self, end: Period) -> Self {
        self.through = Some(end);
        self
    }

    pub fn key(&self) -> ExclusiveKey {
        let through = match (self.kind, self.through) {
            (ExclusiveKind::NetChange, Some(end)) if end != self.anchor => format!("..{}", end.key()),
            _ => String::new(),
        };
        ExclusiveKey(format!(
            "{}:{}@{}{}#{}",
            self.kind,
            self.entity,
            self.anchor.key(),
            through,
            self.filters.key().short()
        ))
    }
}

/// Canonical key for an exclusive computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExclusiveKey(String);

impl ExclusiveKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ExclusiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
