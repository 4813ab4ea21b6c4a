//! Contract of the remote data service the engine consumes.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::{
    EntityId, ExclusiveKind, FetchError, FetchErrorKind, FilterSet, MetadataKind, Period,
    PeriodExpr, PeriodKey, QueryKind,
};

/// One bulk call: entities × period expressions under one filter set.
///
/// An empty `entities` list asks for every entity the service knows about;
/// preloads use this to warm a whole slice at once.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRequest {
    pub kind: QueryKind,
    pub entities: Vec<EntityId>,
    pub periods: Vec<PeriodExpr>,
    pub filters: FilterSet,
}

impl BulkRequest {
    pub fn cell_count(&self) -> usize {
        self.entities.len().max(1) * self.periods.len()
    }
}

/// Nested entity → period → value mapping.
///
/// Per-entity failures are reported in `errors`, never by omission; a
/// well-behaved service returns an explicit zero for a requested cell with no
/// postings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResponse {
    pub values: HashMap<EntityId, HashMap<PeriodKey, f64>>,
    pub errors: HashMap<EntityId, String>,
}

impl BulkResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: EntityId, period: PeriodKey, value: f64) {
        self.values.entry(entity).or_default().insert(period, value);
    }

    pub fn with_value(mut self, entity: EntityId, period: PeriodKey, value: f64) -> Self {
        self.insert(entity, period, value);
        self
    }

    pub fn with_error(mut self, entity: EntityId, message: impl Into<String>) -> Self {
        self.errors.insert(entity, message.into());
        self
    }

    pub fn value(&self, entity: &EntityId, period: &PeriodKey) -> Option<f64> {
        self.values.get(entity).and_then(|row| row.get(period)).copied()
    }

    pub fn error_for(&self, entity: &EntityId) -> Option<&str> {
        self.errors.get(entity).map(String::as_str)
    }

    /// Total number of cells carried.
    pub fn len(&self) -> usize {
        self.values.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-entity anchored computation.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorRequest {
    pub kind: ExclusiveKind,
    pub entity: EntityId,
    pub anchor: Period,
    pub through: Option<Period>,
    pub filters: FilterSet,
}

/// Whole-call failure reported by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteFailure {
    pub message: String,
    /// Whether the service considers an identical retry safe.
    pub retryable: bool,
}

impl RemoteFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

impl From<RemoteFailure> for FetchError {
    fn from(failure: RemoteFailure) -> Self {
        FetchError::new(FetchErrorKind::Remote).with_message(failure.message)
    }
}

#[async_trait]
pub trait RemoteDataService: Send + Sync {
    async fn fetch_bulk(&self, request: BulkRequest) -> Result<BulkResponse, RemoteFailure>;

    async fn fetch_anchor(&self, request: AnchorRequest) -> Result<f64, RemoteFailure>;

    /// Raw, undecoded metadata payload for one entity.
    async fn fetch_metadata(
        &self,
        kind: MetadataKind,
        entity: &EntityId,
    ) -> Result<String, RemoteFailure>;
}
