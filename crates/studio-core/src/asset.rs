//! Persisted media and the two access paths spec §4.8 describes:
//! provider-fronted signed URLs and HMAC-bearer content tokens. This
//! module carries the contract and data model; `studio-assets` carries
//! the filesystem-backed store and the HMAC signer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StudioResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Video,
    Image,
    Frame,
}

impl AssetKind {
    pub fn as_path_segment(self) -> &'static str {
        match self {
            AssetKind::Video => "video",
            AssetKind::Image => "image",
            AssetKind::Frame => "frame",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub owner_id: String,
    pub kind: AssetKind,
    pub object_key: String,
    pub bytes: u64,
    pub content_type: String,
    pub etag: String,
    pub created_at: DateTime<Utc>,
    pub retain_until: Option<DateTime<Utc>>,
}

/// `{basePath}/{kind}/{ownerId}/{assetId}{ext}` — stable, used by
/// external collaborators to prefetch (spec §6).
pub fn object_key(base_path: &str, kind: AssetKind, owner_id: &str, asset_id: Uuid, ext: &str) -> String {
    format!(
        "{}/{}/{}/{}{}",
        base_path.trim_end_matches('/'),
        kind.as_path_segment(),
        owner_id,
        asset_id,
        ext
    )
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn put(
        &self,
        owner_id: &str,
        kind: AssetKind,
        bytes: Vec<u8>,
        content_type: &str,
        ext: &str,
    ) -> StudioResult<Asset>;

    async fn get(&self, asset_id: Uuid) -> StudioResult<Option<Asset>>;

    async fn read_bytes(&self, asset_id: Uuid) -> StudioResult<Vec<u8>>;

    /// Mark an asset for deletion no earlier than `retain_until`.
    async fn set_retain_until(&self, asset_id: Uuid, retain_until: DateTime<Utc>) -> StudioResult<()>;

    /// Assets whose retention has lapsed, for the retention sweep.
    async fn scan_expired(&self, now: DateTime<Utc>, limit: usize) -> StudioResult<Vec<Asset>>;

    /// Delete both the object and its record.
    async fn delete(&self, asset_id: Uuid) -> StudioResult<()>;
}

/// Payload embedded in a [`ContentToken`] — field names and types are
/// bit-exact per spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentTokenPayload {
    pub asset_id: Uuid,
    pub owner_id: String,
    pub exp: i64, // Unix seconds
    pub nonce: String, // base64url, no padding, 16 bytes decoded
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub asset_id: Uuid,
    pub owner_id: String,
}

pub trait ContentAccess: Send + Sync {
    fn issue_token(&self, asset_id: Uuid, owner_id: &str, ttl: chrono::Duration, now: DateTime<Utc>) -> String;

    fn verify(&self, token: &str, now: DateTime<Utc>) -> StudioResult<VerifiedToken>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_matches_layout() {
        let id = Uuid::nil();
        let key = object_key("/data/assets/", AssetKind::Video, "user-1", id, ".mp4");
        assert_eq!(key, format!("/data/assets/video/user-1/{}.mp4", id));
    }
}
