use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use studio_core::{BalanceRow, CreditLedger, RefundFailure, ReservationEntry, ReservationStatus, StudioError, StudioResult};
use uuid::Uuid;

/// PostgreSQL-backed [`CreditLedger`] (spec §4.3).
///
/// `reserve` is idempotent on `request_key` via a unique index on
/// `reservations.request_key`; a duplicate insert is detected and the
/// existing reservation id returned instead of re-debiting the balance.
#[derive(Clone)]
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_as_str(s: ReservationStatus) -> &'static str {
    match s {
        ReservationStatus::Held => "held",
        ReservationStatus::Committed => "committed",
        ReservationStatus::Refunded => "refunded",
        ReservationStatus::FailedRefund => "failed-refund",
    }
}

fn status_from_str(s: &str) -> ReservationStatus {
    match s {
        "held" => ReservationStatus::Held,
        "committed" => ReservationStatus::Committed,
        "refunded" => ReservationStatus::Refunded,
        "failed-refund" => ReservationStatus::FailedRefund,
        other => panic!("unknown reservation_status {other}"),
    }
}

fn row_to_reservation(row: &sqlx::postgres::PgRow) -> ReservationEntry {
    ReservationEntry {
        id: row.get("id"),
        user_id: row.get("user_id"),
        amount: row.get("amount"),
        job_id: row.get("job_id"),
        status: status_from_str(row.get("status")),
        created_at: row.get("created_at"),
        settled_at: row.get("settled_at"),
        reason: row.get("reason"),
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn reserve(&self, user_id: &str, amount: i64, request_key: &str) -> StudioResult<Uuid> {
        let mut tx = self.pool.begin().await.map_err(|e| StudioError::Other(e.into()))?;

        if let Some(row) = sqlx::query("SELECT id FROM reservations WHERE request_key = $1")
            .bind(request_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StudioError::Other(e.into()))?
        {
            return Ok(row.get("id"));
        }

        sqlx::query(
            r#"
            INSERT INTO balances (user_id, available, reserved, version)
            VALUES ($1, 0, 0, 0)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;

        let balance = sqlx::query("SELECT available FROM balances WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;
        let available: i64 = balance.get("available");

        if available < amount {
            return Err(StudioError::InsufficientFunds {
                available,
                requested: amount,
            });
        }

        sqlx::query(
            r#"
            UPDATE balances
            SET available = available - $1, reserved = reserved + $1, version = version + 1
            WHERE user_id = $2
            "#,
        )
        .bind(amount)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;

        let reservation_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO reservations (id, user_id, amount, status, request_key)
            VALUES ($1, $2, $3, 'held', $4)
            "#,
        )
        .bind(reservation_id)
        .bind(user_id)
        .bind(amount)
        .bind(request_key)
        .execute(&mut *tx)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;

        tx.commit().await.map_err(|e| StudioError::Other(e.into()))?;
        Ok(reservation_id)
    }

    async fn commit(&self, reservation_id: Uuid) -> StudioResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| StudioError::Other(e.into()))?;

        let row = sqlx::query("SELECT user_id, amount, status FROM reservations WHERE id = $1 FOR UPDATE")
            .bind(reservation_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StudioError::Other(e.into()))?
            .ok_or_else(|| StudioError::NotFound(reservation_id.to_string()))?;

        let status: String = row.get("status");
        if status != "held" {
            return Ok(()); // already committed/refunded — idempotent no-op
        }

        let user_id: String = row.get("user_id");
        let amount: i64 = row.get("amount");

        sqlx::query("UPDATE balances SET reserved = reserved - $1, version = version + 1 WHERE user_id = $2")
            .bind(amount)
            .bind(&user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;

        sqlx::query("UPDATE reservations SET status = 'committed', settled_at = NOW() WHERE id = $1 AND status = 'held'")
            .bind(reservation_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;

        tx.commit().await.map_err(|e| StudioError::Other(e.into()))?;
        Ok(())
    }

    async fn refund(&self, reservation_id: Uuid, reason: &str) -> StudioResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| StudioError::Other(e.into()))?;

        let row = sqlx::query("SELECT user_id, amount, status FROM reservations WHERE id = $1 FOR UPDATE")
            .bind(reservation_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StudioError::Other(e.into()))?
            .ok_or_else(|| StudioError::NotFound(reservation_id.to_string()))?;

        let status: String = row.get("status");
        if status == "refunded" {
            return Ok(());
        }
        if status == "committed" {
            return Err(StudioError::InvalidRequest("cannot refund a committed reservation".into()));
        }

        let user_id: String = row.get("user_id");
        let amount: i64 = row.get("amount");

        sqlx::query(
            "UPDATE balances SET available = available + $1, reserved = reserved - $1, version = version + 1 WHERE user_id = $2",
        )
        .bind(amount)
        .bind(&user_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;

        sqlx::query(
            "UPDATE reservations SET status = 'refunded', settled_at = NOW(), reason = $1 WHERE id = $2 AND status = 'held'",
        )
        .bind(reason)
        .bind(reservation_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;

        tx.commit().await.map_err(|e| StudioError::Other(e.into()))?;
        Ok(())
    }

    async fn apply_payment(&self, payment_event_id: &str, user_id: &str, delta: i64) -> StudioResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| StudioError::Other(e.into()))?;

        let existing = sqlx::query("SELECT 1 FROM applied_payments WHERE payment_event_id = $1")
            .bind(payment_event_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;
        if existing.is_some() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO balances (user_id, available, reserved, version)
            VALUES ($1, 0, 0, 0)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;

        sqlx::query("UPDATE balances SET available = available + $1, version = version + 1 WHERE user_id = $2")
            .bind(delta)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;

        sqlx::query("INSERT INTO applied_payments (payment_event_id, user_id, delta) VALUES ($1, $2, $3)")
            .bind(payment_event_id)
            .bind(user_id)
            .bind(delta)
            .execute(&mut *tx)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;

        tx.commit().await.map_err(|e| StudioError::Other(e.into()))?;
        Ok(())
    }

    async fn balance(&self, user_id: &str) -> StudioResult<BalanceRow> {
        let row = sqlx::query("SELECT available, reserved, version FROM balances WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;

        Ok(match row {
            Some(row) => BalanceRow {
                available: row.get("available"),
                reserved: row.get("reserved"),
                version: row.get("version"),
            },
            None => BalanceRow::zero(),
        })
    }

    async fn get_reservation(&self, reservation_id: Uuid) -> StudioResult<Option<ReservationEntry>> {
        let row = sqlx::query("SELECT * FROM reservations WHERE id = $1")
            .bind(reservation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;
        Ok(row.as_ref().map(row_to_reservation))
    }

    async fn scan_reservations_since(&self, cursor: DateTime<Utc>, limit: usize) -> StudioResult<Vec<ReservationEntry>> {
        let rows = sqlx::query("SELECT * FROM reservations WHERE created_at >= $1 ORDER BY created_at ASC LIMIT $2")
            .bind(cursor)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;
        Ok(rows.iter().map(row_to_reservation).collect())
    }

    async fn scan_all_reservations(&self, page_token: Option<Uuid>, page_size: usize) -> StudioResult<Vec<ReservationEntry>> {
        let rows = match page_token {
            Some(after) => {
                sqlx::query("SELECT * FROM reservations WHERE id > $1 ORDER BY id ASC LIMIT $2")
                    .bind(after)
                    .bind(page_size as i64)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM reservations ORDER BY id ASC LIMIT $1")
                    .bind(page_size as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| StudioError::Other(e.into()))?;
        Ok(rows.iter().map(row_to_reservation).collect())
    }

    async fn pending_refund_failures(&self, max: usize) -> StudioResult<Vec<RefundFailure>> {
        let rows = sqlx::query("SELECT * FROM refund_failures ORDER BY last_attempt_at ASC NULLS FIRST LIMIT $1")
            .bind(max as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;

        Ok(rows
            .into_iter()
            .map(|row| RefundFailure {
                reservation_id: row.get("reservation_id"),
                reason: row.get("reason"),
                attempts: row.get::<i32, _>("attempts") as u32,
                last_attempt_at: row.get("last_attempt_at"),
            })
            .collect())
    }

    async fn enqueue_refund_failure(&self, reservation_id: Uuid, reason: &str) -> StudioResult<()> {
        sqlx::query(
            r#"
            INSERT INTO refund_failures (reservation_id, reason, attempts, last_attempt_at)
            VALUES ($1, $2, 1, NOW())
            ON CONFLICT (reservation_id)
            DO UPDATE SET reason = $2, attempts = refund_failures.attempts + 1, last_attempt_at = NOW()
            "#,
        )
        .bind(reservation_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;
        Ok(())
    }

    async fn remove_refund_failure(&self, reservation_id: Uuid) -> StudioResult<()> {
        sqlx::query("DELETE FROM refund_failures WHERE reservation_id = $1")
            .bind(reservation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_status_round_trips_through_its_sql_representation() {
        for status in [
            ReservationStatus::Held,
            ReservationStatus::Committed,
            ReservationStatus::Refunded,
            ReservationStatus::FailedRefund,
        ] {
            assert_eq!(status_from_str(status_as_str(status)), status);
        }
    }
}
