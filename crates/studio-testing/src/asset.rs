use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use studio_core::{object_key, Asset, AssetKind, AssetStore, StudioError, StudioResult};
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryAssetStore {
    records: Mutex<HashMap<Uuid, Asset>>,
    bytes: Mutex<HashMap<Uuid, Vec<u8>>>,
    base_path: String,
}

impl InMemoryAssetStore {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            bytes: Mutex::new(HashMap::new()),
            base_path: base_path.into(),
        }
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn put(&self, owner_id: &str, kind: AssetKind, bytes: Vec<u8>, content_type: &str, ext: &str) -> StudioResult<Asset> {
        let id = Uuid::new_v4();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let etag = hex::encode(hasher.finalize());

        let asset = Asset {
            id,
            owner_id: owner_id.to_string(),
            kind,
            object_key: object_key(&self.base_path, kind, owner_id, id, ext),
            bytes: bytes.len() as u64,
            content_type: content_type.to_string(),
            etag,
            created_at: Utc::now(),
            retain_until: None,
        };

        self.records.lock().unwrap().insert(id, asset.clone());
        self.bytes.lock().unwrap().insert(id, bytes);
        Ok(asset)
    }

    async fn get(&self, asset_id: Uuid) -> StudioResult<Option<Asset>> {
        Ok(self.records.lock().unwrap().get(&asset_id).cloned())
    }

    async fn read_bytes(&self, asset_id: Uuid) -> StudioResult<Vec<u8>> {
        self.bytes
            .lock()
            .unwrap()
            .get(&asset_id)
            .cloned()
            .ok_or_else(|| StudioError::AssetUnavailable(asset_id.to_string()))
    }

    async fn set_retain_until(&self, asset_id: Uuid, retain_until: DateTime<Utc>) -> StudioResult<()> {
        let mut records = self.records.lock().unwrap();
        let asset = records
            .get_mut(&asset_id)
            .ok_or_else(|| StudioError::AssetUnavailable(asset_id.to_string()))?;
        asset.retain_until = Some(retain_until);
        Ok(())
    }

    async fn scan_expired(&self, now: DateTime<Utc>, limit: usize) -> StudioResult<Vec<Asset>> {
        let records = self.records.lock().unwrap();
        let mut expired: Vec<Asset> = records
            .values()
            .filter(|a| a.retain_until.map(|r| r <= now).unwrap_or(false))
            .cloned()
            .collect();
        expired.sort_by_key(|a| a.created_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn delete(&self, asset_id: Uuid) -> StudioResult<()> {
        self.records.lock().unwrap().remove(&asset_id);
        self.bytes.lock().unwrap().remove(&asset_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_read_bytes_round_trips() {
        let store = InMemoryAssetStore::new("/data/assets");
        let asset = store.put("user-1", AssetKind::Video, vec![1, 2, 3], "video/mp4", ".mp4").await.unwrap();
        let bytes = store.read_bytes(asset.id).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn scan_expired_only_returns_assets_past_retention() {
        let store = InMemoryAssetStore::new("/data/assets");
        let asset = store.put("user-1", AssetKind::Video, vec![1], "video/mp4", ".mp4").await.unwrap();
        let now = Utc::now();
        store.set_retain_until(asset.id, now - chrono::Duration::seconds(1)).await.unwrap();
        let expired = store.scan_expired(now, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
    }
}
