//! Atomic credit reservation, commit, and refund (spec §4.3).
//!
//! `BalanceRow` + `ReservationEntry` are the two documents this trait's
//! implementations must keep consistent under optimistic concurrency —
//! see spec §3 for the conservation invariant and §8 property 2/3.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StudioResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRow {
    pub available: i64,
    pub reserved: i64,
    pub version: i64,
}

impl BalanceRow {
    pub fn zero() -> Self {
        Self {
            available: 0,
            reserved: 0,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReservationStatus {
    Held,
    Committed,
    Refunded,
    FailedRefund,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationEntry {
    pub id: Uuid,
    pub user_id: String,
    pub amount: i64,
    pub job_id: Option<Uuid>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// An entry in the refund-failure queue: a reservation whose refund's
/// conditional write failed for a transient reason, awaiting the
/// [`crate::error::BatchOutcome`]-returning sweep in `studio-reprocessor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundFailure {
    pub reservation_id: Uuid,
    pub reason: String,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Reserve `amount` against `user_id`, idempotent on `request_key` —
    /// repeat calls with the same key return the same reservation id
    /// without re-debiting (spec §8 property 7).
    async fn reserve(&self, user_id: &str, amount: i64, request_key: &str) -> StudioResult<Uuid>;

    /// Idempotent commit: no-op if already committed; conditional on
    /// `status == Held`.
    async fn commit(&self, reservation_id: Uuid) -> StudioResult<()>;

    /// Idempotent refund: no-op if already refunded. On a transient
    /// conditional-write failure the caller should enqueue a
    /// [`RefundFailure`] rather than propagate the error (spec §4.3).
    async fn refund(&self, reservation_id: Uuid, reason: &str) -> StudioResult<()>;

    /// Idempotent on `payment_event_id` — safe to call multiple times for
    /// the same webhook delivery.
    async fn apply_payment(&self, payment_event_id: &str, user_id: &str, delta: i64) -> StudioResult<()>;

    async fn balance(&self, user_id: &str) -> StudioResult<BalanceRow>;

    async fn get_reservation(&self, reservation_id: Uuid) -> StudioResult<Option<ReservationEntry>>;

    /// Reservations modified since `cursor`, for incremental
    /// reconciliation (spec §4.3).
    async fn scan_reservations_since(&self, cursor: DateTime<Utc>, limit: usize) -> StudioResult<Vec<ReservationEntry>>;

    /// Full paginated scan, for full reconciliation.
    async fn scan_all_reservations(&self, page_token: Option<Uuid>, page_size: usize) -> StudioResult<Vec<ReservationEntry>>;

    /// Drain up to `max` entries from the refund-failure queue.
    async fn pending_refund_failures(&self, max: usize) -> StudioResult<Vec<RefundFailure>>;

    /// Push a reservation whose refund failed for a transient reason.
    async fn enqueue_refund_failure(&self, reservation_id: Uuid, reason: &str) -> StudioResult<()>;

    /// Remove a refund-failure entry (it was retried successfully, or
    /// gave up after `max_attempts` and was marked `FailedRefund`).
    async fn remove_refund_failure(&self, reservation_id: Uuid) -> StudioResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_row_zero_is_conserved() {
        let b = BalanceRow::zero();
        assert_eq!(b.available + b.reserved, 0);
    }
}
