//! Request-idempotency: pending-lock + response-replay keyed on
//! `(userId, requestHash)` (spec §4.7). Guards the queue's entry
//! invariant (spec §8 property 7) without requiring client-supplied
//! idempotency keys.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StudioResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdempotencyState {
    Pending,
    Committed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub state: IdempotencyState,
    pub response: Option<serde_json::Value>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of [`RequestIdempotency::acquire`].
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    /// First call — caller proceeds and must eventually call `commit` or
    /// `abort`.
    Pending,
    /// A prior call is still inside its pending-lock TTL.
    Busy,
    /// A prior call already committed; here is its stored response.
    Replay(serde_json::Value),
}

/// `hash(userId, canonical(request))` — canonicalization is the caller's
/// job (typically `serde_json::to_string` of a value with sorted keys);
/// this just mixes in the user id so two users issuing byte-identical
/// requests don't collide.
pub fn derive_key(user_id: &str, canonical_request: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical_request.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)
}

#[async_trait]
pub trait RequestIdempotency: Send + Sync {
    /// CAS-insert a `Pending` row with `pending_lock_ttl`; on repeat calls
    /// while pending, returns `Busy`; once committed, returns `Replay`.
    async fn acquire(&self, key: &str, pending_lock_ttl: chrono::Duration) -> StudioResult<AcquireOutcome>;

    /// Transition to `Committed`, store the response, extend TTL to
    /// `replay_ttl`.
    async fn commit(&self, key: &str, response: serde_json::Value, replay_ttl: chrono::Duration) -> StudioResult<()>;

    /// Delete the pending row (submit failed before a result existed).
    async fn abort(&self, key: &str) -> StudioResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_is_deterministic_and_user_scoped() {
        let a = derive_key("u1", r#"{"prompt":"a cat"}"#);
        let b = derive_key("u1", r#"{"prompt":"a cat"}"#);
        let c = derive_key("u2", r#"{"prompt":"a cat"}"#);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
