use futures::FutureExt;
use ledgerlink_common::{EntityId, FetchError, MetadataKind, MetadataPayload};

use super::BatchEngine;
use crate::stats::bump;

impl BatchEngine {
    /// Display label of an entity.
    pub async fn label(&self, entity: &EntityId) -> Result<MetadataPayload, FetchError> {
        self.metadata(MetadataKind::Label, entity).await
    }

    /// Classification metadata of an entity.
    pub async fn classification(&self, entity: &EntityId) -> Result<MetadataPayload, FetchError> {
        self.metadata(MetadataKind::Classification, entity).await
    }

    async fn metadata(
        &self,
        kind: MetadataKind,
        entity: &EntityId,
    ) -> Result<MetadataPayload, FetchError> {
        {
            let mut caches = self.inner.caches.lock();
            let cache = match kind {
                MetadataKind::Label => &mut caches.labels,
                MetadataKind::Classification => &mut caches.classifications,
            };
            if let Some(hit) = cache.get(entity) {
                return Ok(hit);
            }
        }

        let engine = self.clone();
        let owned = entity.clone();
        self.inner
            .metadata_flights
            .run((kind, entity.clone()), move || {
                async move {
                    let inner = &engine.inner;
                    let _permit = inner.gate.acquire().await?;
                    bump(&inner.stats.metadata_fetches);
                    let raw = inner.remote.fetch_metadata(kind, &owned).await?;
                    let payload = MetadataPayload::decode(&raw);
                    let mut caches = inner.caches.lock();
                    match kind {
                        MetadataKind::Label => caches.labels.set(owned, payload.clone()),
                        MetadataKind::Classification => {
                            caches.classifications.set(owned, payload.clone())
                        }
                    }
                    Ok::<MetadataPayload, FetchError>(payload)
                }
                .boxed()
            })
            .await
            .result
    }
}
