use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::asset_store::AssetStore;
use crate::error::{MediaError, MediaResult};
use crate::model::{Asset, AssetStatus, OwnerLink, Rendition};

#[derive(Default)]
struct Inner {
    assets: HashMap<i64, Asset>,
    renditions: Vec<Rendition>,
    links: Vec<OwnerLink>,
    next_asset_id: i64,
    next_rendition_id: i64,
    next_link_id: i64,
}

/// In-memory `AssetStore` with the same uniqueness and cascade semantics as
/// the SQL schema. Backs the test suite and embedded single-process use.
#[derive(Default)]
pub struct MemoryAssetStore {
    inner: Mutex<Inner>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asset_count(&self) -> usize {
        self.inner.lock().unwrap().assets.len()
    }

    pub fn link_count(&self) -> usize {
        self.inner.lock().unwrap().links.len()
    }

    pub fn links_for(&self, asset_id: i64) -> Vec<OwnerLink> {
        self.inner
            .lock()
            .unwrap()
            .links
            .iter()
            .filter(|l| l.asset_id == asset_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn insert_asset(&self, asset: &Asset) -> MediaResult<Asset> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_asset_id += 1;
        let mut stored = asset.clone();
        stored.id = inner.next_asset_id;
        inner.assets.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update_asset(&self, asset: &Asset) -> MediaResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.assets.contains_key(&asset.id) {
            return Err(MediaError::PersistenceFailed {
                reason: format!("asset {} does not exist", asset.id),
            });
        }
        let mut updated = asset.clone();
        updated.updated_at = Utc::now();
        inner.assets.insert(asset.id, updated);
        Ok(())
    }

    async fn find_asset(&self, id: i64) -> MediaResult<Option<Asset>> {
        Ok(self.inner.lock().unwrap().assets.get(&id).cloned())
    }

    async fn delete_asset(&self, id: i64) -> MediaResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.assets.remove(&id);
        inner.renditions.retain(|r| r.asset_id != id);
        inner.links.retain(|l| l.asset_id != id);
        Ok(())
    }

    async fn claim(&self, id: i64) -> MediaResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        match inner.assets.get_mut(&id) {
            Some(asset)
                if asset.status == AssetStatus::Queued || asset.status == AssetStatus::Failed =>
            {
                asset.status = AssetStatus::Processing;
                asset.updated_at = Utc::now();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn insert_rendition(&self, rendition: &Rendition) -> MediaResult<Rendition> {
        let mut inner = self.inner.lock().unwrap();
        let duplicate = inner.renditions.iter().any(|r| {
            r.asset_id == rendition.asset_id
                && r.variant == rendition.variant
                && r.codec == rendition.codec
        });
        if duplicate {
            return Err(MediaError::PersistenceFailed {
                reason: format!(
                    "duplicate rendition ({}, {}, {})",
                    rendition.asset_id, rendition.variant, rendition.codec
                ),
            });
        }
        inner.next_rendition_id += 1;
        let mut stored = rendition.clone();
        stored.id = inner.next_rendition_id;
        inner.renditions.push(stored.clone());
        Ok(stored)
    }

    async fn list_renditions(&self, asset_id: i64) -> MediaResult<Vec<Rendition>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .renditions
            .iter()
            .filter(|r| r.asset_id == asset_id)
            .cloned()
            .collect())
    }

    async fn count_renditions(&self, asset_id: i64) -> MediaResult<u64> {
        Ok(self.list_renditions(asset_id).await?.len() as u64)
    }

    async fn insert_owner_link(&self, link: &OwnerLink) -> MediaResult<OwnerLink> {
        let mut inner = self.inner.lock().unwrap();
        let duplicate = inner.links.iter().any(|l| {
            l.owner_type == link.owner_type
                && l.owner_id == link.owner_id
                && l.role == link.role
                && l.asset_id == link.asset_id
        });
        if duplicate {
            return Err(MediaError::PersistenceFailed {
                reason: format!(
                    "duplicate owner link ({}, {}, {}, {})",
                    link.owner_type, link.owner_id, link.role, link.asset_id
                ),
            });
        }
        inner.next_link_id += 1;
        let mut stored = link.clone();
        stored.id = inner.next_link_id;
        inner.links.push(stored.clone());
        Ok(stored)
    }

    async fn first_owner_link(&self, asset_id: i64) -> MediaResult<Option<OwnerLink>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .links
            .iter()
            .filter(|l| l.asset_id == asset_id)
            .min_by_key(|l| l.id)
            .cloned())
    }

    async fn find_ready_by_checksum(&self, sha1: &str) -> MediaResult<Option<Asset>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .assets
            .values()
            .filter(|a| a.status == AssetStatus::Ready && a.checksum_sha1.as_deref() == Some(sha1))
            .min_by_key(|a| a.id)
            .cloned())
    }

    async fn find_failed_older_than(&self, cutoff: DateTime<Utc>) -> MediaResult<Vec<Asset>> {
        let mut failed: Vec<Asset> = self
            .inner
            .lock()
            .unwrap()
            .assets
            .values()
            .filter(|a| a.status == AssetStatus::Failed && a.updated_at < cutoff)
            .cloned()
            .collect();
        failed.sort_by_key(|a| a.id);
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceKind;
    use crate::profiles::Codec;

    fn rendition(asset_id: i64, variant: &str, codec: Codec) -> Rendition {
        Rendition {
            id: 0,
            asset_id,
            variant: variant.to_string(),
            codec,
            key: format!("k/{variant}.{}", codec.ext()),
            width: 10,
            height: 10,
            bytes: 100,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn claim_transitions_only_from_queued_or_failed() {
        let store = MemoryAssetStore::new();
        let asset = store
            .insert_asset(&Asset::new("p", SourceKind::Remote, Some("http://e/".into()), AssetStatus::Queued))
            .await
            .unwrap();

        assert_eq!(store.claim(asset.id).await.unwrap(), 1);
        // Second claim loses: the row is already processing.
        assert_eq!(store.claim(asset.id).await.unwrap(), 0);

        let mut processing = store.find_asset(asset.id).await.unwrap().unwrap();
        processing.status = AssetStatus::Failed;
        store.update_asset(&processing).await.unwrap();
        assert_eq!(store.claim(asset.id).await.unwrap(), 1);

        let mut ready = store.find_asset(asset.id).await.unwrap().unwrap();
        ready.status = AssetStatus::Ready;
        store.update_asset(&ready).await.unwrap();
        assert_eq!(store.claim(asset.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rendition_uniqueness_is_enforced() {
        let store = MemoryAssetStore::new();
        let asset = store
            .insert_asset(&Asset::new("p", SourceKind::Upload, None, AssetStatus::Processing))
            .await
            .unwrap();

        store
            .insert_rendition(&rendition(asset.id, "thumb", Codec::Jpeg))
            .await
            .unwrap();
        // Same variant, different codec is fine.
        store
            .insert_rendition(&rendition(asset.id, "thumb", Codec::Webp))
            .await
            .unwrap();
        assert!(store
            .insert_rendition(&rendition(asset.id, "thumb", Codec::Jpeg))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn delete_cascades_renditions_and_links() {
        let store = MemoryAssetStore::new();
        let asset = store
            .insert_asset(&Asset::new("p", SourceKind::Upload, None, AssetStatus::Ready))
            .await
            .unwrap();
        store
            .insert_rendition(&rendition(asset.id, "thumb", Codec::Jpeg))
            .await
            .unwrap();
        store
            .insert_owner_link(&OwnerLink {
                id: 0,
                owner_type: "Product".into(),
                owner_id: 1,
                asset_id: asset.id,
                role: "main".into(),
                sort: 0,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        store.delete_asset(asset.id).await.unwrap();
        assert_eq!(store.asset_count(), 0);
        assert_eq!(store.link_count(), 0);
        assert_eq!(store.count_renditions(asset.id).await.unwrap(), 0);
    }
}
