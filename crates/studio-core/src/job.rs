//! Durable job records and the [`JobStore`] contract.
//!
//! This is the policy-light interface the rest of the crate is built on:
//! it says nothing about *how* conditional writes are implemented (that's
//! `studio-store-postgres`), only what the semantics must be. See spec
//! §4.1 for the full contract; this module carries the types and the
//! trait, `studio-store-postgres::PgJobStore` carries the SQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StudioResult;

/// Lifecycle state of a [`Job`]. Terminal states (`Succeeded`, `Failed`,
/// `Dead`) are absorbing — no further mutation except DLQ bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Leased,
    Running,
    Succeeded,
    Failed,
    Dead,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Dead)
    }
}

/// An exclusive, time-bounded claim on a job by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Why a job failed — drives the worker's retry-vs-refund decision (spec
/// §4.2) and the store's retry-vs-dead-letter decision (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    NonRetryable,
}

/// A single unit of generation work bound to one user, one provider, one
/// cost (spec §3 `Job`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: String,
    pub provider_key: String,
    pub model_key: String,
    pub input_fingerprint: String,
    pub input_ref: String,
    pub reservation_id: Uuid,
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub lease: Option<Lease>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub visible_after: Option<DateTime<Utc>>,
    pub provider_job_id: Option<String>,
    pub result_asset_id: Option<Uuid>,
    pub error: Option<String>,
    pub cancel_requested: bool,
}

impl Job {
    /// Construct a fresh, unqueued job. Callers pass this to
    /// [`JobStore::enqueue`].
    pub fn new(
        id: Uuid,
        user_id: impl Into<String>,
        provider_key: impl Into<String>,
        model_key: impl Into<String>,
        input_fingerprint: impl Into<String>,
        input_ref: impl Into<String>,
        reservation_id: Uuid,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            provider_key: provider_key.into(),
            model_key: model_key.into(),
            input_fingerprint: input_fingerprint.into(),
            input_ref: input_ref.into(),
            reservation_id,
            attempts: 0,
            max_attempts,
            state: JobState::Queued,
            lease: None,
            last_heartbeat_at: None,
            created_at: now,
            updated_at: now,
            visible_after: None,
            provider_job_id: None,
            result_asset_id: None,
            error: None,
            cancel_requested: false,
        }
    }
}

/// Relation (not ownership — spec §3) back to a job that exhausted
/// retries or whose provider circuit was exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub job_id: Uuid,
    pub provider_key: String,
    pub reason: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: String,
}

/// A predicate the store applies while selecting the next job to lease —
/// used by the worker to exclude providers whose in-process concurrency
/// semaphore is saturated or whose circuit is open (spec §4.2, §4.4).
/// Object-safe so a `JobStore` impl can hold it as `&dyn Fn(&Job) -> bool`
/// without generics leaking into the trait.
pub type LeaseFilter<'a> = &'a (dyn Fn(&Job) -> bool + Send + Sync);

/// Exponential backoff with jitter, capped (spec §4.1).
///
/// `base` and `cap` are whole seconds; `attempts` is the attempt number
/// the job is about to make (i.e. called with the post-increment value).
pub fn backoff_duration(attempts: u32, base_secs: u64, cap_secs: u64) -> chrono::Duration {
    let exp = base_secs.saturating_mul(1u64 << attempts.saturating_sub(1).min(32));
    let capped = exp.min(cap_secs);
    let jitter = 0.5 + fastrand::f64(); // uniform(0.5, 1.5)
    let millis = (capped as f64 * 1000.0 * jitter) as i64;
    chrono::Duration::milliseconds(millis)
}

/// Durable job store contract (spec §4.1). Every operation here is atomic
/// with respect to a single job document; implementations use conditional
/// writes (e.g. `UPDATE ... WHERE status = $expected`) rather than
/// external locking.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job with `state = Queued`. Fails with
    /// [`crate::error::StudioError::Conflict`]-shaped error if the id
    /// already exists — callers should treat that as `Duplicate`.
    async fn enqueue(&self, job: Job) -> StudioResult<Job>;

    /// Select one job that is `Queued`, or `Leased` with an expired
    /// lease, for which `filter` returns true; atomically claim it.
    /// Returns `None` on no eligible job or on lost conditional-write race
    /// (caller retries or moves on — never treat `None` as an error).
    async fn lease_next(
        &self,
        worker_id: &str,
        lease_duration: chrono::Duration,
        filter: LeaseFilter<'_>,
    ) -> StudioResult<Option<Job>>;

    /// Extend `lease.expires_at`. Returns `Ok(false)` (the `stale`
    /// outcome) if `lease.holder != worker_id` — the caller MUST abandon.
    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_duration: chrono::Duration,
    ) -> StudioResult<bool>;

    /// Transition `Leased -> Running`, recording the provider's own job
    /// id and refreshing the lease.
    async fn mark_running(&self, job_id: Uuid, worker_id: &str, provider_job_id: &str) -> StudioResult<()>;

    /// Transition to `Succeeded`. Requires `lease.holder == worker_id`.
    async fn succeed(&self, job_id: Uuid, worker_id: &str, asset_id: Uuid) -> StudioResult<()>;

    /// Record a failure. If `retryable` and `attempts < max_attempts`,
    /// returns the job to `Queued` with `visible_after` set by
    /// [`backoff_duration`]; otherwise moves to `Failed`/`Dead` and
    /// inserts a [`DlqEntry`].
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        kind: FailureKind,
    ) -> StudioResult<()>;

    /// Find up to `max` jobs whose lease has expired; requeue
    /// (`attempts < max_attempts`) or dead-letter them. Called by the
    /// sweeper; returns counts for observability.
    async fn reclaim_expired(&self, now: DateTime<Utc>, max: usize) -> StudioResult<crate::error::BatchOutcome>;

    /// Incremental scan for reconciliation: jobs touched since `cursor`.
    async fn scan_created_since(&self, cursor: DateTime<Utc>, limit: usize) -> StudioResult<Vec<Job>>;

    /// Full paginated scan for reconciliation.
    async fn scan_all(&self, page_token: Option<Uuid>, page_size: usize) -> StudioResult<Vec<Job>>;

    /// Set the cooperative cancellation flag observed on the next
    /// heartbeat/poll iteration (spec §4.2 Cancellation).
    async fn request_cancel(&self, job_id: Uuid) -> StudioResult<()>;

    /// Fetch a single job by id (used by `Orchestrator::status`).
    async fn get(&self, job_id: Uuid) -> StudioResult<Option<Job>>;

    /// DLQ entries ready for reprocessing (spec §4.5), bounded by
    /// `max_entries`.
    async fn dlq_entries(&self, max_entries: usize) -> StudioResult<Vec<DlqEntry>>;

    /// Re-queue a DLQ entry: clears the DLQ row, resets the job to
    /// `Queued`. Whether `attempts` resets or a separate `reattempts`
    /// counter is used is an Open Question — see DESIGN.md.
    async fn requeue_from_dlq(&self, job_id: Uuid) -> StudioResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing_by_definition() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Dead.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Leased.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn lease_expiry_is_inclusive_of_now() {
        let now = Utc::now();
        let lease = Lease {
            holder: "w1".into(),
            expires_at: now,
        };
        assert!(lease.is_expired(now));
    }

    #[test]
    fn backoff_is_capped_and_monotonic_before_cap() {
        let d1 = backoff_duration(1, 2, 300);
        let d2 = backoff_duration(2, 2, 300);
        // attempt 1 -> ~2s * jitter(0.5..1.5) => up to 3s
        // attempt 2 -> ~4s * jitter(0.5..1.5) => up to 6s
        assert!(d1.num_milliseconds() <= 3_000);
        assert!(d2.num_milliseconds() <= 6_000);

        let capped = backoff_duration(20, 2, 300);
        assert!(capped.num_milliseconds() <= 450_000); // 300s * 1.5 jitter ceiling
    }

    #[test]
    fn job_new_starts_queued_with_zero_attempts() {
        let job = Job::new(
            Uuid::new_v4(),
            "user-1",
            "fast-draft",
            "model-a",
            "fp",
            "ref",
            Uuid::new_v4(),
            3,
            Utc::now(),
        );
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.lease.is_none());
    }
}
