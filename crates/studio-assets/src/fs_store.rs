use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use studio_core::{object_key, Asset, AssetKind, AssetStore, StudioError, StudioResult};
use tokio::fs;
use uuid::Uuid;

/// Asset bytes on local disk under `base_path`, metadata in an
/// in-process index. A real deployment would back the index with
/// Postgres the way `studio-store-postgres` backs jobs and reservations;
/// this crate focuses on the object layout and the HMAC signer, the two
/// pieces spec §4.8 actually specifies.
pub struct FsAssetStore {
    base_path: PathBuf,
    index: Mutex<HashMap<Uuid, Asset>>,
}

impl FsAssetStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            index: Mutex::new(HashMap::new()),
        }
    }

    fn disk_path(&self, object_key: &str) -> PathBuf {
        // `object_key` is rooted at base_path already; strip it so joining
        // doesn't duplicate the prefix.
        let relative = object_key.trim_start_matches(&*self.base_path.to_string_lossy()).trim_start_matches('/');
        self.base_path.join(relative)
    }
}

#[async_trait]
impl AssetStore for FsAssetStore {
    async fn put(&self, owner_id: &str, kind: AssetKind, bytes: Vec<u8>, content_type: &str, ext: &str) -> StudioResult<Asset> {
        let id = Uuid::new_v4();
        let base = self.base_path.to_string_lossy().to_string();
        let key = object_key(&base, kind, owner_id, id, ext);
        let path = self.disk_path(&key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| StudioError::Other(e.into()))?;
        }
        fs::write(&path, &bytes).await.map_err(|e| StudioError::Other(e.into()))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let etag = hex::encode(hasher.finalize());

        let asset = Asset {
            id,
            owner_id: owner_id.to_string(),
            kind,
            object_key: key,
            bytes: bytes.len() as u64,
            content_type: content_type.to_string(),
            etag,
            created_at: Utc::now(),
            retain_until: None,
        };
        self.index.lock().unwrap().insert(id, asset.clone());
        Ok(asset)
    }

    async fn get(&self, asset_id: Uuid) -> StudioResult<Option<Asset>> {
        Ok(self.index.lock().unwrap().get(&asset_id).cloned())
    }

    async fn read_bytes(&self, asset_id: Uuid) -> StudioResult<Vec<u8>> {
        let asset = self
            .index
            .lock()
            .unwrap()
            .get(&asset_id)
            .cloned()
            .ok_or_else(|| StudioError::AssetUnavailable(asset_id.to_string()))?;
        let path = self.disk_path(&asset.object_key);
        fs::read(&path).await.map_err(|e| StudioError::Other(e.into()))
    }

    async fn set_retain_until(&self, asset_id: Uuid, retain_until: DateTime<Utc>) -> StudioResult<()> {
        let mut index = self.index.lock().unwrap();
        let asset = index
            .get_mut(&asset_id)
            .ok_or_else(|| StudioError::AssetUnavailable(asset_id.to_string()))?;
        asset.retain_until = Some(retain_until);
        Ok(())
    }

    async fn scan_expired(&self, now: DateTime<Utc>, limit: usize) -> StudioResult<Vec<Asset>> {
        let index = self.index.lock().unwrap();
        let mut expired: Vec<Asset> = index
            .values()
            .filter(|a| a.retain_until.map(|r| r <= now).unwrap_or(false))
            .cloned()
            .collect();
        expired.sort_by_key(|a| a.created_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn delete(&self, asset_id: Uuid) -> StudioResult<()> {
        let removed = self.index.lock().unwrap().remove(&asset_id);
        if let Some(asset) = removed {
            let path = self.disk_path(&asset.object_key);
            let _ = fs::remove_file(&path).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_like::TempDir;

    mod tempfile_like {
        use std::path::PathBuf;

        /// Minimal scoped-temp-dir helper so tests don't pull in
        /// `tempfile` for a single directory under the OS temp root.
        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new(label: &str) -> Self {
                let path = std::env::temp_dir().join(format!("studio-assets-test-{label}-{}", uuid::Uuid::new_v4()));
                std::fs::create_dir_all(&path).unwrap();
                Self(path)
            }

            pub fn path(&self) -> &std::path::Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[tokio::test]
    async fn put_then_read_bytes_round_trips_through_disk() {
        let dir = TempDir::new("roundtrip");
        let store = FsAssetStore::new(dir.path());
        let asset = store.put("user-1", AssetKind::Video, vec![9, 8, 7], "video/mp4", ".mp4").await.unwrap();
        let bytes = store.read_bytes(asset.id).await.unwrap();
        assert_eq!(bytes, vec![9, 8, 7]);
    }

    #[tokio::test]
    async fn delete_removes_both_index_and_file() {
        let dir = TempDir::new("delete");
        let store = FsAssetStore::new(dir.path());
        let asset = store.put("user-1", AssetKind::Image, vec![1], "image/png", ".png").await.unwrap();
        store.delete(asset.id).await.unwrap();
        assert!(store.get(asset.id).await.unwrap().is_none());
        assert!(store.read_bytes(asset.id).await.is_err());
    }
}
