//! Meta crate that re-exports the ledgerlink building blocks. Depend on this
//! crate and opt into layers with feature flags; the underlying crates stay
//! reachable for deeper integration.

#[cfg(feature = "common")]
pub use ledgerlink_common as common;

#[cfg(feature = "engine")]
pub use ledgerlink_engine as engine;

#[cfg(feature = "common")]
pub use ledgerlink_common::{
    EntityId, ExclusiveKind, ExclusiveRequest, FetchError, FetchErrorKind, FilterSet,
    MemoryStore, MetadataPayload, Period, PeriodExpr, PersistedStore, QueryKind,
    RemoteDataService, ValueKey, ValueRequest,
};

#[cfg(feature = "engine")]
pub use ledgerlink_engine::{BatchEngine, EngineConfig, StatsSnapshot, new_engine};

/// The types most hosts need, in one import.
pub mod prelude {
    #[cfg(feature = "common")]
    pub use ledgerlink_common::{
        EntityId, FetchError, FilterSet, MemoryStore, PersistedStore, QueryKind,
        RemoteDataService, ValueRequest,
    };

    #[cfg(feature = "engine")]
    pub use ledgerlink_engine::{BatchEngine, EngineConfig, InvalidateScope, PreloadSlot};
}
