use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use studio_core::{AcquireOutcome, IdempotencyRecord, IdempotencyState, RequestIdempotency, StudioResult};

#[derive(Default)]
pub struct InMemoryIdempotency {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotency {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestIdempotency for InMemoryIdempotency {
    async fn acquire(&self, key: &str, pending_lock_ttl: chrono::Duration) -> StudioResult<AcquireOutcome> {
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();

        if let Some(existing) = records.get(key) {
            if existing.expires_at > now {
                return match existing.state {
                    IdempotencyState::Pending => Ok(AcquireOutcome::Busy),
                    IdempotencyState::Committed => {
                        Ok(AcquireOutcome::Replay(existing.response.clone().unwrap_or(serde_json::Value::Null)))
                    }
                };
            }
        }

        records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                state: IdempotencyState::Pending,
                response: None,
                acquired_at: now,
                expires_at: now + pending_lock_ttl,
            },
        );
        Ok(AcquireOutcome::Pending)
    }

    async fn commit(&self, key: &str, response: serde_json::Value, replay_ttl: chrono::Duration) -> StudioResult<()> {
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                state: IdempotencyState::Committed,
                response: Some(response),
                acquired_at: now,
                expires_at: now + replay_ttl,
            },
        );
        Ok(())
    }

    async fn abort(&self, key: &str) -> StudioResult<()> {
        self.records.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_while_pending_is_busy() {
        let idem = InMemoryIdempotency::new();
        let first = idem.acquire("k1", chrono::Duration::seconds(10)).await.unwrap();
        assert!(matches!(first, AcquireOutcome::Pending));
        let second = idem.acquire("k1", chrono::Duration::seconds(10)).await.unwrap();
        assert!(matches!(second, AcquireOutcome::Busy));
    }

    #[tokio::test]
    async fn acquire_after_commit_replays() {
        let idem = InMemoryIdempotency::new();
        idem.acquire("k1", chrono::Duration::seconds(10)).await.unwrap();
        idem.commit("k1", serde_json::json!({"jobId": "abc"}), chrono::Duration::seconds(60)).await.unwrap();
        let replay = idem.acquire("k1", chrono::Duration::seconds(10)).await.unwrap();
        match replay {
            AcquireOutcome::Replay(v) => assert_eq!(v["jobId"], "abc"),
            other => panic!("expected replay, got {other:?}"),
        }
    }
}
