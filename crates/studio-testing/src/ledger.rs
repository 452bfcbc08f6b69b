use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use studio_core::{BalanceRow, CreditLedger, RefundFailure, ReservationEntry, ReservationStatus, StudioError, StudioResult};
use uuid::Uuid;

/// In-memory [`CreditLedger`] mirroring the conditional-update semantics
/// `studio-store-postgres::PgCreditLedger` implements against Postgres.
#[derive(Default)]
pub struct InMemoryCreditLedger {
    balances: Mutex<HashMap<String, BalanceRow>>,
    reservations: Mutex<HashMap<Uuid, ReservationEntry>>,
    by_request_key: Mutex<HashMap<String, Uuid>>,
    refund_failures: Mutex<HashMap<Uuid, RefundFailure>>,
    applied_payments: Mutex<std::collections::HashSet<String>>,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/demo helper: grant starting funds without going through
    /// `apply_payment`'s idempotency bookkeeping.
    pub fn grant(&self, user_id: &str, amount: i64) {
        let mut balances = self.balances.lock().unwrap();
        let row = balances.entry(user_id.to_string()).or_insert_with(BalanceRow::zero);
        row.available += amount;
        row.version += 1;
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn reserve(&self, user_id: &str, amount: i64, request_key: &str) -> StudioResult<Uuid> {
        let mut by_key = self.by_request_key.lock().unwrap();
        if let Some(existing) = by_key.get(request_key) {
            return Ok(*existing);
        }

        let mut balances = self.balances.lock().unwrap();
        let row = balances.entry(user_id.to_string()).or_insert_with(BalanceRow::zero);
        if row.available < amount {
            return Err(StudioError::InsufficientFunds {
                available: row.available,
                requested: amount,
            });
        }
        row.available -= amount;
        row.reserved += amount;
        row.version += 1;

        let id = Uuid::new_v4();
        self.reservations.lock().unwrap().insert(
            id,
            ReservationEntry {
                id,
                user_id: user_id.to_string(),
                amount,
                job_id: None,
                status: ReservationStatus::Held,
                created_at: Utc::now(),
                settled_at: None,
                reason: None,
            },
        );
        by_key.insert(request_key.to_string(), id);
        Ok(id)
    }

    async fn commit(&self, reservation_id: Uuid) -> StudioResult<()> {
        let mut reservations = self.reservations.lock().unwrap();
        let entry = reservations
            .get_mut(&reservation_id)
            .ok_or_else(|| StudioError::NotFound(reservation_id.to_string()))?;
        if entry.status != ReservationStatus::Held {
            return Ok(());
        }

        let mut balances = self.balances.lock().unwrap();
        let row = balances.entry(entry.user_id.clone()).or_insert_with(BalanceRow::zero);
        row.reserved -= entry.amount;
        row.version += 1;

        entry.status = ReservationStatus::Committed;
        entry.settled_at = Some(Utc::now());
        Ok(())
    }

    async fn refund(&self, reservation_id: Uuid, reason: &str) -> StudioResult<()> {
        let mut reservations = self.reservations.lock().unwrap();
        let entry = reservations
            .get_mut(&reservation_id)
            .ok_or_else(|| StudioError::NotFound(reservation_id.to_string()))?;
        if entry.status == ReservationStatus::Refunded {
            return Ok(());
        }
        if entry.status == ReservationStatus::Committed {
            return Err(StudioError::InvalidRequest("cannot refund a committed reservation".into()));
        }

        let mut balances = self.balances.lock().unwrap();
        let row = balances.entry(entry.user_id.clone()).or_insert_with(BalanceRow::zero);
        row.available += entry.amount;
        row.reserved -= entry.amount;
        row.version += 1;

        entry.status = ReservationStatus::Refunded;
        entry.settled_at = Some(Utc::now());
        entry.reason = Some(reason.to_string());
        Ok(())
    }

    async fn apply_payment(&self, payment_event_id: &str, user_id: &str, delta: i64) -> StudioResult<()> {
        let mut applied = self.applied_payments.lock().unwrap();
        if !applied.insert(payment_event_id.to_string()) {
            return Ok(());
        }
        let mut balances = self.balances.lock().unwrap();
        let row = balances.entry(user_id.to_string()).or_insert_with(BalanceRow::zero);
        row.available += delta;
        row.version += 1;
        Ok(())
    }

    async fn balance(&self, user_id: &str) -> StudioResult<BalanceRow> {
        Ok(self.balances.lock().unwrap().get(user_id).copied().unwrap_or_else(BalanceRow::zero))
    }

    async fn get_reservation(&self, reservation_id: Uuid) -> StudioResult<Option<ReservationEntry>> {
        Ok(self.reservations.lock().unwrap().get(&reservation_id).cloned())
    }

    async fn scan_reservations_since(&self, cursor: DateTime<Utc>, limit: usize) -> StudioResult<Vec<ReservationEntry>> {
        let reservations = self.reservations.lock().unwrap();
        let mut matched: Vec<ReservationEntry> = reservations.values().filter(|r| r.created_at >= cursor).cloned().collect();
        matched.sort_by_key(|r| r.created_at);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn scan_all_reservations(&self, page_token: Option<Uuid>, page_size: usize) -> StudioResult<Vec<ReservationEntry>> {
        let reservations = self.reservations.lock().unwrap();
        let mut all: Vec<ReservationEntry> = reservations.values().cloned().collect();
        all.sort_by_key(|r| r.id);
        let start = match page_token {
            Some(after) => all.iter().position(|r| r.id > after).unwrap_or(all.len()),
            None => 0,
        };
        Ok(all.into_iter().skip(start).take(page_size).collect())
    }

    async fn pending_refund_failures(&self, max: usize) -> StudioResult<Vec<RefundFailure>> {
        let failures = self.refund_failures.lock().unwrap();
        let mut entries: Vec<RefundFailure> = failures.values().cloned().collect();
        entries.sort_by_key(|f| f.attempts);
        entries.truncate(max);
        Ok(entries)
    }

    async fn enqueue_refund_failure(&self, reservation_id: Uuid, reason: &str) -> StudioResult<()> {
        let mut failures = self.refund_failures.lock().unwrap();
        let entry = failures.entry(reservation_id).or_insert(RefundFailure {
            reservation_id,
            reason: reason.to_string(),
            attempts: 0,
            last_attempt_at: None,
        });
        entry.reason = reason.to_string();
        entry.attempts += 1;
        entry.last_attempt_at = Some(Utc::now());
        Ok(())
    }

    async fn remove_refund_failure(&self, reservation_id: Uuid) -> StudioResult<()> {
        self.refund_failures.lock().unwrap().remove(&reservation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_is_idempotent_on_request_key() {
        let ledger = InMemoryCreditLedger::new();
        ledger.grant("u1", 100);
        let r1 = ledger.reserve("u1", 40, "req-1").await.unwrap();
        let r2 = ledger.reserve("u1", 40, "req-1").await.unwrap();
        assert_eq!(r1, r2);
        assert_eq!(ledger.balance("u1").await.unwrap().available, 60);
    }

    #[tokio::test]
    async fn refund_after_commit_is_rejected() {
        let ledger = InMemoryCreditLedger::new();
        ledger.grant("u1", 100);
        let r = ledger.reserve("u1", 40, "req-1").await.unwrap();
        ledger.commit(r).await.unwrap();
        assert!(ledger.refund(r, "too late").await.is_err());
    }

    #[tokio::test]
    async fn double_refund_is_a_no_op() {
        let ledger = InMemoryCreditLedger::new();
        ledger.grant("u1", 100);
        let r = ledger.reserve("u1", 40, "req-1").await.unwrap();
        ledger.refund(r, "failed").await.unwrap();
        ledger.refund(r, "failed again").await.unwrap();
        assert_eq!(ledger.balance("u1").await.unwrap().available, 100);
    }
}
