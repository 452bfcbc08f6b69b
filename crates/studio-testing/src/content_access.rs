use chrono::{DateTime, Utc};
use studio_core::{ContentAccess, StudioError, StudioResult, VerifiedToken};
use uuid::Uuid;

/// An unsigned stand-in for `HmacContentAccess` — opaque-looking token,
/// no real MAC. Good enough for exercising `Orchestrator::result` without
/// pulling in `studio-assets`' key-management surface.
pub struct InlineContentAccess;

impl ContentAccess for InlineContentAccess {
    fn issue_token(&self, asset_id: Uuid, owner_id: &str, ttl: chrono::Duration, now: DateTime<Utc>) -> String {
        format!("fake-token.{asset_id}.{owner_id}.{}", (now + ttl).timestamp())
    }

    fn verify(&self, token: &str, now: DateTime<Utc>) -> StudioResult<VerifiedToken> {
        let mut parts = token.split('.');
        let (marker, asset_id, owner_id, exp) = (parts.next(), parts.next(), parts.next(), parts.next());
        let (asset_id, owner_id, exp) = match (marker, asset_id, owner_id, exp) {
            (Some("fake-token"), Some(a), Some(o), Some(e)) => (a, o, e),
            _ => return Err(StudioError::SignatureInvalid),
        };
        let asset_id: Uuid = asset_id.parse().map_err(|_| StudioError::SignatureInvalid)?;
        let exp: i64 = exp.parse().map_err(|_| StudioError::SignatureInvalid)?;
        if exp < now.timestamp() {
            return Err(StudioError::SignatureInvalid);
        }
        Ok(VerifiedToken {
            asset_id,
            owner_id: owner_id.to_string(),
        })
    }
}
