use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use studio_core::{backoff_duration, BatchOutcome, DlqEntry, FailureKind, Job, JobState, JobStore, Lease, LeaseFilter, StudioError, StudioResult};
use uuid::Uuid;

/// In-memory [`JobStore`]. Not a toy: it implements the same
/// conditional-write and backoff semantics `studio-store-postgres`
/// does, just over a `Mutex<HashMap>` instead of a connection pool, so
/// tests exercise real state-machine behavior without a database.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    dlq: Mutex<HashMap<Uuid, DlqEntry>>,
    backoff_base_seconds: u64,
    backoff_cap_seconds: u64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            dlq: Mutex::new(HashMap::new()),
            backoff_base_seconds: 2,
            backoff_cap_seconds: 300,
        }
    }

    pub fn with_backoff(mut self, base_seconds: u64, cap_seconds: u64) -> Self {
        self.backoff_base_seconds = base_seconds;
        self.backoff_cap_seconds = cap_seconds;
        self
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> StudioResult<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(StudioError::Conflict);
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn lease_next(
        &self,
        worker_id: &str,
        lease_duration: chrono::Duration,
        filter: LeaseFilter<'_>,
    ) -> StudioResult<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();

        let candidate_id = jobs
            .values()
            .filter(|job| {
                let eligible = (job.state == JobState::Queued && job.visible_after.map(|v| v <= now).unwrap_or(true))
                    || (job.state == JobState::Leased && job.lease.as_ref().is_some_and(|l| l.is_expired(now)));
                eligible && filter(job)
            })
            .min_by_key(|job| job.created_at)
            .map(|job| job.id);

        let Some(id) = candidate_id else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).unwrap();
        job.state = JobState::Leased;
        job.lease = Some(Lease {
            holder: worker_id.to_string(),
            expires_at: now + lease_duration,
        });
        job.last_heartbeat_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str, lease_duration: chrono::Duration) -> StudioResult<bool> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.lease.as_ref().map(|l| l.holder.as_str()) != Some(worker_id) {
            return Ok(false);
        }
        job.lease = Some(Lease {
            holder: worker_id.to_string(),
            expires_at: now + lease_duration,
        });
        job.last_heartbeat_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn mark_running(&self, job_id: Uuid, worker_id: &str, provider_job_id: &str) -> StudioResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or_else(|| StudioError::NotFound(job_id.to_string()))?;
        if job.lease.as_ref().map(|l| l.holder.as_str()) != Some(worker_id) {
            return Err(StudioError::LeaseLost { job_id });
        }
        job.state = JobState::Running;
        job.provider_job_id = Some(provider_job_id.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn succeed(&self, job_id: Uuid, worker_id: &str, asset_id: Uuid) -> StudioResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or_else(|| StudioError::NotFound(job_id.to_string()))?;
        if job.lease.as_ref().map(|l| l.holder.as_str()) != Some(worker_id) {
            return Err(StudioError::LeaseLost { job_id });
        }
        job.state = JobState::Succeeded;
        job.result_asset_id = Some(asset_id);
        job.lease = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, worker_id: &str, error: &str, kind: FailureKind) -> StudioResult<()> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or_else(|| StudioError::NotFound(job_id.to_string()))?;
        if job.lease.as_ref().map(|l| l.holder.as_str()) != Some(worker_id) {
            return Err(StudioError::LeaseLost { job_id });
        }

        job.attempts += 1;
        job.error = Some(error.to_string());
        job.lease = None;
        job.updated_at = now;

        if matches!(kind, FailureKind::Retryable) && job.attempts < job.max_attempts {
            let backoff = backoff_duration(job.attempts, self.backoff_base_seconds, self.backoff_cap_seconds);
            job.state = JobState::Queued;
            job.visible_after = Some(now + backoff);
        } else {
            let dead = matches!(kind, FailureKind::NonRetryable) || job.attempts >= job.max_attempts;
            job.state = if dead { JobState::Dead } else { JobState::Failed };
            let entry = DlqEntry {
                job_id,
                provider_key: job.provider_key.clone(),
                reason: format!("{kind:?}"),
                enqueued_at: now,
                attempts: job.attempts,
                last_error: error.to_string(),
            };
            drop(jobs);
            self.dlq.lock().unwrap().insert(job_id, entry);
        }
        Ok(())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>, max: usize) -> StudioResult<BatchOutcome> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut outcome = BatchOutcome::default();
        let expired_ids: Vec<Uuid> = jobs
            .values()
            .filter(|job| job.state == JobState::Leased && job.lease.as_ref().is_some_and(|l| l.is_expired(now)))
            .take(max)
            .map(|job| job.id)
            .collect();

        for id in expired_ids {
            let job = jobs.get_mut(&id).unwrap();
            job.lease = None;
            job.updated_at = now;
            if job.attempts < job.max_attempts {
                job.state = JobState::Queued;
            } else {
                job.state = JobState::Dead;
                job.error = Some("lease expired and retries exhausted".to_string());
            }
            outcome.record_success();
        }
        Ok(outcome)
    }

    async fn scan_created_since(&self, cursor: DateTime<Utc>, limit: usize) -> StudioResult<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap();
        let mut matched: Vec<Job> = jobs.values().filter(|j| j.created_at >= cursor).cloned().collect();
        matched.sort_by_key(|j| j.created_at);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn scan_all(&self, page_token: Option<Uuid>, page_size: usize) -> StudioResult<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap();
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by_key(|j| j.id);
        let start = match page_token {
            Some(after) => all.iter().position(|j| j.id > after).unwrap_or(all.len()),
            None => 0,
        };
        Ok(all.into_iter().skip(start).take(page_size).collect())
    }

    async fn request_cancel(&self, job_id: Uuid) -> StudioResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or_else(|| StudioError::NotFound(job_id.to_string()))?;
        job.cancel_requested = true;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> StudioResult<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(&job_id).cloned())
    }

    async fn dlq_entries(&self, max_entries: usize) -> StudioResult<Vec<DlqEntry>> {
        let dlq = self.dlq.lock().unwrap();
        let mut entries: Vec<DlqEntry> = dlq.values().cloned().collect();
        entries.sort_by_key(|e| e.enqueued_at);
        entries.truncate(max_entries);
        Ok(entries)
    }

    async fn requeue_from_dlq(&self, job_id: Uuid) -> StudioResult<()> {
        let mut dlq = self.dlq.lock().unwrap();
        if dlq.remove(&job_id).is_none() {
            return Err(StudioError::NotFound(job_id.to_string()));
        }
        drop(dlq);

        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or_else(|| StudioError::NotFound(job_id.to_string()))?;
        if !job.state.is_terminal() {
            return Err(StudioError::InvalidRequest("job is not in a terminal state".into()));
        }
        job.state = JobState::Queued;
        job.attempts = 0;
        job.error = None;
        job.visible_after = None;
        job.lease = None;
        job.cancel_requested = false;
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::new(
            Uuid::new_v4(),
            "user-1",
            "fast-draft",
            "model-a",
            "fp",
            "ref",
            Uuid::new_v4(),
            3,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn lease_next_skips_providers_the_filter_rejects() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(sample_job()).await.unwrap();

        let none = store
            .lease_next("w1", chrono::Duration::seconds(60), &|j| j.provider_key != "fast-draft")
            .await
            .unwrap();
        assert!(none.is_none());

        let leased = store
            .lease_next("w1", chrono::Duration::seconds(60), &|_| true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, job.id);
        assert_eq!(leased.state, JobState::Leased);
    }

    #[tokio::test]
    async fn fail_retryable_requeues_with_backoff_until_attempts_exhausted() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(sample_job()).await.unwrap();
        store.lease_next("w1", chrono::Duration::seconds(60), &|_| true).await.unwrap();

        store.fail(job.id, "w1", "timeout", FailureKind::Retryable).await.unwrap();
        let reloaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, JobState::Queued);
        assert_eq!(reloaded.attempts, 1);
        assert!(reloaded.visible_after.is_some());
    }

    #[tokio::test]
    async fn fail_non_retryable_moves_to_dead_and_dlq() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(sample_job()).await.unwrap();
        store.lease_next("w1", chrono::Duration::seconds(60), &|_| true).await.unwrap();

        store.fail(job.id, "w1", "policy violation", FailureKind::NonRetryable).await.unwrap();
        let reloaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, JobState::Dead);

        let dlq = store.dlq_entries(10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].job_id, job.id);
    }

    #[tokio::test]
    async fn heartbeat_from_wrong_worker_reports_stale() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(sample_job()).await.unwrap();
        store.lease_next("w1", chrono::Duration::seconds(60), &|_| true).await.unwrap();

        let ok = store.heartbeat(job.id, "w2", chrono::Duration::seconds(60)).await.unwrap();
        assert!(!ok);
    }
}
