use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use studio_core::{
    backoff_duration, BatchOutcome, DlqEntry, FailureKind, Job, JobState, JobStore, Lease, LeaseFilter, StudioError,
    StudioResult,
};
use uuid::Uuid;

/// PostgreSQL-backed [`JobStore`].
///
/// `lease_next`'s filter is an in-process predicate (providers whose
/// semaphore or circuit is saturated), so the claim is split into a
/// `SELECT ... FOR UPDATE SKIP LOCKED` over a batch of candidates
/// followed by the filter running in Rust and a conditional `UPDATE`
/// of the single row chosen, all inside one transaction.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    candidate_batch: i64,
    backoff_base_seconds: u64,
    backoff_cap_seconds: u64,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            candidate_batch: 50,
            backoff_base_seconds: 2,
            backoff_cap_seconds: 300,
        }
    }

    pub fn with_backoff(mut self, base_seconds: u64, cap_seconds: u64) -> Self {
        self.backoff_base_seconds = base_seconds;
        self.backoff_cap_seconds = cap_seconds;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Job {
    let lease_holder: Option<String> = row.get("lease_holder");
    let lease_expires_at: Option<DateTime<Utc>> = row.get("lease_expires_at");
    let lease = match (lease_holder, lease_expires_at) {
        (Some(holder), Some(expires_at)) => Some(Lease { holder, expires_at }),
        _ => None,
    };

    Job {
        id: row.get("id"),
        user_id: row.get("user_id"),
        provider_key: row.get("provider_key"),
        model_key: row.get("model_key"),
        input_fingerprint: row.get("input_fingerprint"),
        input_ref: row.get("input_ref"),
        reservation_id: row.get("reservation_id"),
        attempts: row.get::<i32, _>("attempts") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        state: state_from_str(row.get("state")),
        lease,
        last_heartbeat_at: row.get("last_heartbeat_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        visible_after: row.get("visible_after"),
        provider_job_id: row.get("provider_job_id"),
        result_asset_id: row.get("result_asset_id"),
        error: row.get("error"),
        cancel_requested: row.get("cancel_requested"),
    }
}

fn state_from_str(s: &str) -> JobState {
    match s {
        "queued" => JobState::Queued,
        "leased" => JobState::Leased,
        "running" => JobState::Running,
        "succeeded" => JobState::Succeeded,
        "failed" => JobState::Failed,
        "dead" => JobState::Dead,
        other => panic!("unknown job_state {other}"),
    }
}

fn state_as_str(s: JobState) -> &'static str {
    match s {
        JobState::Queued => "queued",
        JobState::Leased => "leased",
        JobState::Running => "running",
        JobState::Succeeded => "succeeded",
        JobState::Failed => "failed",
        JobState::Dead => "dead",
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: Job) -> StudioResult<Job> {
        let existing = sqlx::query("SELECT id FROM jobs WHERE id = $1")
            .bind(job.id)
            .fetch_optional(&self.pool)
            .await
            .context("enqueue: check existing")
            .map_err(StudioError::Other)?;
        if existing.is_some() {
            return Err(StudioError::Conflict);
        }

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, user_id, provider_key, model_key, input_fingerprint, input_ref,
                reservation_id, attempts, max_attempts, state, created_at, updated_at,
                cancel_requested
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'queued', $10, $10, FALSE)
            "#,
        )
        .bind(job.id)
        .bind(&job.user_id)
        .bind(&job.provider_key)
        .bind(&job.model_key)
        .bind(&job.input_fingerprint)
        .bind(&job.input_ref)
        .bind(job.reservation_id)
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .context("enqueue: insert")
        .map_err(StudioError::Other)?;

        Ok(job)
    }

    async fn lease_next(
        &self,
        worker_id: &str,
        lease_duration: chrono::Duration,
        filter: LeaseFilter<'_>,
    ) -> StudioResult<Option<Job>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| StudioError::Other(e.into()))?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE (state = 'queued' AND (visible_after IS NULL OR visible_after <= $1))
               OR (state = 'leased' AND lease_expires_at < $1)
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(self.candidate_batch)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;

        let chosen = rows.iter().map(row_to_job).find(|job| filter(job));

        let Some(mut job) = chosen else {
            tx.commit().await.map_err(|e| StudioError::Other(e.into()))?;
            return Ok(None);
        };

        let expires_at = now + lease_duration;
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'leased', lease_holder = $1, lease_expires_at = $2,
                last_heartbeat_at = $3, updated_at = $3
            WHERE id = $4
            "#,
        )
        .bind(worker_id)
        .bind(expires_at)
        .bind(now)
        .bind(job.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;

        tx.commit().await.map_err(|e| StudioError::Other(e.into()))?;

        job.state = JobState::Leased;
        job.lease = Some(Lease {
            holder: worker_id.to_string(),
            expires_at,
        });
        job.last_heartbeat_at = Some(now);
        job.updated_at = now;
        Ok(Some(job))
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str, lease_duration: chrono::Duration) -> StudioResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = $1, last_heartbeat_at = $2, updated_at = $2
            WHERE id = $3 AND lease_holder = $4 AND state IN ('leased', 'running')
            "#,
        )
        .bind(now + lease_duration)
        .bind(now)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_running(&self, job_id: Uuid, worker_id: &str, provider_job_id: &str) -> StudioResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'running', provider_job_id = $1, updated_at = NOW()
            WHERE id = $2 AND lease_holder = $3 AND state = 'leased'
            "#,
        )
        .bind(provider_job_id)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;

        if result.rows_affected() != 1 {
            return Err(StudioError::LeaseLost { job_id });
        }
        Ok(())
    }

    async fn succeed(&self, job_id: Uuid, worker_id: &str, asset_id: Uuid) -> StudioResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'succeeded', result_asset_id = $1, updated_at = NOW()
            WHERE id = $2 AND lease_holder = $3 AND state IN ('leased', 'running')
            "#,
        )
        .bind(asset_id)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;

        if result.rows_affected() != 1 {
            return Err(StudioError::LeaseLost { job_id });
        }
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, worker_id: &str, error: &str, kind: FailureKind) -> StudioResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| StudioError::Other(e.into()))?;

        let row = sqlx::query(
            r#"
            SELECT attempts, max_attempts, provider_key, lease_holder, state
            FROM jobs WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StudioError::Other(e.into()))?
        .ok_or_else(|| StudioError::NotFound(job_id.to_string()))?;

        let lease_holder: Option<String> = row.get("lease_holder");
        if lease_holder.as_deref() != Some(worker_id) {
            return Err(StudioError::LeaseLost { job_id });
        }

        let attempts: i32 = row.get("attempts");
        let max_attempts: i32 = row.get("max_attempts");
        let provider_key: String = row.get("provider_key");
        let next_attempts = attempts + 1;

        if matches!(kind, FailureKind::Retryable) && next_attempts < max_attempts {
            let backoff = backoff_duration(next_attempts as u32, self.backoff_base_seconds, self.backoff_cap_seconds);
            let visible_after = Utc::now() + backoff;
            sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'queued', attempts = $1, visible_after = $2, error = $3,
                    lease_holder = NULL, lease_expires_at = NULL, updated_at = NOW()
                WHERE id = $4
                "#,
            )
            .bind(next_attempts)
            .bind(visible_after)
            .bind(error)
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;
        } else {
            let dead = matches!(kind, FailureKind::NonRetryable) || next_attempts >= max_attempts;
            let state = if dead { "dead" } else { "failed" };
            sqlx::query(
                r#"
                UPDATE jobs
                SET state = $1, attempts = $2, error = $3,
                    lease_holder = NULL, lease_expires_at = NULL, updated_at = NOW()
                WHERE id = $4
                "#,
            )
            .bind(state)
            .bind(next_attempts)
            .bind(error)
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;

            sqlx::query(
                r#"
                INSERT INTO dlq_entries (job_id, provider_key, reason, attempts, last_error)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (job_id) DO UPDATE SET reason = $3, attempts = $4, last_error = $5
                "#,
            )
            .bind(job_id)
            .bind(&provider_key)
            .bind(format!("{kind:?}"))
            .bind(next_attempts)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;
        }

        tx.commit().await.map_err(|e| StudioError::Other(e.into()))?;
        Ok(())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>, max: usize) -> StudioResult<BatchOutcome> {
        let rows = sqlx::query(
            r#"
            SELECT id, attempts, max_attempts FROM jobs
            WHERE state = 'leased' AND lease_expires_at < $1
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;

        let mut outcome = BatchOutcome::default();
        for row in rows {
            let id: Uuid = row.get("id");
            let attempts: i32 = row.get("attempts");
            let max_attempts: i32 = row.get("max_attempts");
            let result = if attempts < max_attempts {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'queued', lease_holder = NULL, lease_expires_at = NULL, updated_at = NOW()
                    WHERE id = $1 AND state = 'leased'
                    "#,
                )
                .bind(id)
                .execute(&self.pool)
                .await
            } else {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'dead', lease_holder = NULL, lease_expires_at = NULL,
                        error = 'lease expired and retries exhausted', updated_at = NOW()
                    WHERE id = $1 AND state = 'leased'
                    "#,
                )
                .bind(id)
                .execute(&self.pool)
                .await
            };

            match result {
                Ok(r) if r.rows_affected() == 1 => outcome.record_success(),
                _ => outcome.record_failure(),
            }
        }

        Ok(outcome)
    }

    async fn scan_created_since(&self, cursor: DateTime<Utc>, limit: usize) -> StudioResult<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE created_at >= $1 ORDER BY created_at ASC LIMIT $2")
            .bind(cursor)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    async fn scan_all(&self, page_token: Option<Uuid>, page_size: usize) -> StudioResult<Vec<Job>> {
        let rows = match page_token {
            Some(after) => {
                sqlx::query("SELECT * FROM jobs WHERE id > $1 ORDER BY id ASC LIMIT $2")
                    .bind(after)
                    .bind(page_size as i64)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY id ASC LIMIT $1")
                    .bind(page_size as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| StudioError::Other(e.into()))?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    async fn request_cancel(&self, job_id: Uuid) -> StudioResult<()> {
        sqlx::query("UPDATE jobs SET cancel_requested = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> StudioResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;
        Ok(row.as_ref().map(row_to_job))
    }

    async fn dlq_entries(&self, max_entries: usize) -> StudioResult<Vec<DlqEntry>> {
        let rows = sqlx::query("SELECT * FROM dlq_entries ORDER BY enqueued_at ASC LIMIT $1")
            .bind(max_entries as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;

        Ok(rows
            .into_iter()
            .map(|row| DlqEntry {
                job_id: row.get("job_id"),
                provider_key: row.get("provider_key"),
                reason: row.get("reason"),
                enqueued_at: row.get("enqueued_at"),
                attempts: row.get::<i32, _>("attempts") as u32,
                last_error: row.get("last_error"),
            })
            .collect())
    }

    async fn requeue_from_dlq(&self, job_id: Uuid) -> StudioResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| StudioError::Other(e.into()))?;

        sqlx::query("DELETE FROM dlq_entries WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StudioError::Other(e.into()))?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'queued', attempts = 0, error = NULL, visible_after = NULL,
                lease_holder = NULL, lease_expires_at = NULL, cancel_requested = FALSE,
                updated_at = NOW()
            WHERE id = $1 AND state IN ('failed', 'dead')
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StudioError::Other(e.into()))?;

        if result.rows_affected() != 1 {
            return Err(StudioError::NotFound(job_id.to_string()));
        }

        tx.commit().await.map_err(|e| StudioError::Other(e.into()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_round_trips_through_its_sql_representation() {
        for state in [
            JobState::Queued,
            JobState::Leased,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Dead,
        ] {
            assert_eq!(state_from_str(state_as_str(state)), state);
        }
    }
}
