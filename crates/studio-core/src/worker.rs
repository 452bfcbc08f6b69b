//! Bounded-concurrency lease loop with strict settlement semantics
//! (spec §4.2). State machine per worker slot:
//!
//! ```text
//! idle ── lease_next ─▶ leased ── mark_running ─▶ running ── provider done
//!   ▲                     │                           │           │
//!   │                     └── lease error ───────────▶│           ▼
//!   │                                                 │     succeeded / failed
//!   └───────────── slot released ◀──── settlement ◀───┘
//! ```
//!
//! Concurrency is gated two ways: a global `max_concurrent` semaphore per
//! worker process, and a `per_provider_max_concurrent` semaphore per
//! provider key, both counting semaphores held for the duration of a
//! slot (spec §5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::asset::AssetStore;
use crate::circuit::{Allow, CircuitState, Outcome, ProviderCircuitRegistry};
use crate::clock::Clock;
use crate::config::{JobConfig, WorkerConfig};
use crate::error::{BatchOutcome, Categorizable, StudioError};
use crate::job::{FailureKind, Job, JobStore};
use crate::ledger::CreditLedger;
use crate::provider::{ProviderOutcome, ProviderRegistry};

/// How long the poll loop sleeps between `lease_next` calls that found no
/// eligible job, so idle workers don't busy-spin the store.
const IDLE_POLL_INTERVAL_MS: u64 = 500;

pub struct Worker {
    worker_id: String,
    job_store: Arc<dyn JobStore>,
    ledger: Arc<dyn CreditLedger>,
    assets: Arc<dyn AssetStore>,
    circuits: Arc<ProviderCircuitRegistry>,
    providers: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
    job_cfg: JobConfig,
    worker_cfg: WorkerConfig,
    global_slots: Arc<Semaphore>,
    provider_slots: Arc<DashMap<String, Arc<Semaphore>>>,
    shutdown_rx: watch::Receiver<bool>,
}

pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<BatchOutcome>,
}

impl WorkerHandle {
    /// Stop accepting new leases and wait up to `drain_timeout` for
    /// in-flight slots to finalize (spec §4.2 Graceful drain). Returns
    /// settlement counts for the slots that were in flight at shutdown.
    pub async fn drain(self, drain_timeout: std::time::Duration) -> BatchOutcome {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(drain_timeout, self.join).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "worker task panicked during drain");
                BatchOutcome::default()
            }
            Err(_) => {
                warn!("drain timeout elapsed with slots still in flight; leases will expire and be reclaimed");
                BatchOutcome::default()
            }
        }
    }
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: impl Into<String>,
        job_store: Arc<dyn JobStore>,
        ledger: Arc<dyn CreditLedger>,
        assets: Arc<dyn AssetStore>,
        circuits: Arc<ProviderCircuitRegistry>,
        providers: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
        job_cfg: JobConfig,
        worker_cfg: WorkerConfig,
    ) -> Self {
        let (_tx, rx) = watch::channel(false);
        let global_slots = Arc::new(Semaphore::new(worker_cfg.max_concurrent));
        Self {
            worker_id: worker_id.into(),
            job_store,
            ledger,
            assets,
            circuits,
            providers,
            clock,
            job_cfg,
            worker_cfg,
            global_slots,
            provider_slots: Arc::new(DashMap::new()),
            shutdown_rx: rx,
        }
    }

    fn provider_semaphore(&self, provider_key: &str) -> Arc<Semaphore> {
        self.provider_slots
            .entry(provider_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.worker_cfg.per_provider_max_concurrent)))
            .clone()
    }

    /// Spawn the lease loop on the current tokio runtime and return a
    /// handle used to request graceful drain.
    pub fn spawn(mut self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_rx = shutdown_rx;
        let join = tokio::spawn(async move { self.run().await });
        WorkerHandle { shutdown_tx, join }
    }

    async fn run(self) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut inflight = tokio::task::JoinSet::new();

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let lease_duration = chrono::Duration::seconds(self.job_cfg.lease_seconds as i64);
            let circuits = Arc::clone(&self.circuits);
            let provider_slots = Arc::clone(&self.provider_slots);
            let per_provider_cap = self.worker_cfg.per_provider_max_concurrent;
            let filter = move |job: &Job| -> bool {
                // Non-mutating pre-filter: excludes providers we already
                // recorded as Open. The authoritative (and possibly
                // state-mutating, half-open-trial-acquiring) admission
                // check happens once in `JobSlot::drive`, right before the
                // provider call — never here, where evaluating a losing
                // candidate must not consume the one half-open trial.
                if circuits.status(&job.provider_key).state == CircuitState::Open {
                    return false;
                }
                match provider_slots.get(&job.provider_key) {
                    Some(sem) => sem.available_permits() > 0,
                    None => per_provider_cap > 0,
                }
            };

            let leased = self
                .job_store
                .lease_next(&self.worker_id, lease_duration, &filter)
                .await;

            let job = match leased {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tokio::select! {
                        _ = sleep(std::time::Duration::from_millis(IDLE_POLL_INTERVAL_MS)) => {}
                        _ = self.shutdown_rx_changed() => {}
                    }
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "lease_next failed; backing off");
                    sleep(std::time::Duration::from_millis(IDLE_POLL_INTERVAL_MS)).await;
                    continue;
                }
            };

            let global_permit = match Arc::clone(&self.global_slots).try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    // All slots busy despite the filter's optimistic check;
                    // the job stays leased and will be picked up again once
                    // its lease is extended/expired. This is a lost race,
                    // not a correctness issue (spec §5).
                    continue;
                }
            };
            let provider_sem = self.provider_semaphore(&job.provider_key);
            let provider_permit = match provider_sem.try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    drop(global_permit);
                    continue;
                }
            };

            let slot = JobSlot {
                worker_id: self.worker_id.clone(),
                job_store: Arc::clone(&self.job_store),
                ledger: Arc::clone(&self.ledger),
                assets: Arc::clone(&self.assets),
                circuits: Arc::clone(&self.circuits),
                providers: Arc::clone(&self.providers),
                clock: Arc::clone(&self.clock),
                job_cfg: self.job_cfg.clone(),
            };
            inflight.spawn(async move {
                let _global = global_permit;
                let _provider = provider_permit;
                slot.run(job).await
            });

            // Reap completed slots without blocking the lease loop.
            while let Some(result) = inflight.try_join_next() {
                match result {
                    Ok(true) => outcome.record_success(),
                    Ok(false) => outcome.record_failure(),
                    Err(join_err) => {
                        warn!(error = %join_err, "job slot task panicked");
                        outcome.record_failure();
                    }
                }
            }
        }

        // Drain: let in-flight slots finish, but do not lease anything new.
        while let Some(result) = inflight.join_next().await {
            match result {
                Ok(true) => outcome.record_success(),
                Ok(false) => outcome.record_failure(),
                Err(join_err) => {
                    warn!(error = %join_err, "job slot task panicked during drain");
                    outcome.record_failure();
                }
            }
        }
        outcome
    }

    async fn shutdown_rx_changed(&self) {
        let mut rx = self.shutdown_rx.clone();
        let _ = rx.changed().await;
    }
}

/// The work of a single claimed job: heartbeat ticker + provider drive +
/// settlement. Returns `true` on a settled success, `false` otherwise
/// (retry, refund, or abandoned lease) — used only for the coarse
/// [`BatchOutcome`] the worker reports.
struct JobSlot {
    worker_id: String,
    job_store: Arc<dyn JobStore>,
    ledger: Arc<dyn CreditLedger>,
    assets: Arc<dyn AssetStore>,
    circuits: Arc<ProviderCircuitRegistry>,
    providers: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
    job_cfg: JobConfig,
}

impl JobSlot {
    #[instrument(skip(self, job), fields(job_id = %job.id, provider_key = %job.provider_key))]
    async fn run(self, job: Job) -> bool {
        let lease_lost = Arc::new(AtomicBool::new(false));
        let heartbeat_flag = Arc::clone(&lease_lost);
        let heartbeat_store = Arc::clone(&self.job_store);
        let heartbeat_worker_id = self.worker_id.clone();
        let heartbeat_job_id = job.id;
        let heartbeat_interval = std::time::Duration::from_millis(self.job_cfg.heartbeat_interval_ms);
        let lease_duration = chrono::Duration::seconds(self.job_cfg.lease_seconds as i64);

        let heartbeat_task = tokio::spawn(async move {
            loop {
                sleep(heartbeat_interval).await;
                if heartbeat_flag.load(Ordering::SeqCst) {
                    return;
                }
                match heartbeat_store
                    .heartbeat(heartbeat_job_id, &heartbeat_worker_id, lease_duration)
                    .await
                {
                    Ok(true) => continue,
                    Ok(false) => {
                        warn!(job_id = %heartbeat_job_id, "lease stale; worker must abandon");
                        heartbeat_flag.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(err) => {
                        warn!(job_id = %heartbeat_job_id, error = %err, "heartbeat call failed");
                    }
                }
            }
        });

        let settled = self.drive(&job, Arc::clone(&lease_lost)).await;

        lease_lost.store(true, Ordering::SeqCst); // stop the heartbeat ticker
        heartbeat_task.abort();

        settled
    }

    async fn drive(&self, job: &Job, lease_lost: Arc<AtomicBool>) -> bool {
        let provider = match self.providers.get(&job.provider_key) {
            Some(p) => p,
            None => {
                warn!(provider_key = %job.provider_key, "no adapter registered for provider");
                let _ = self
                    .job_store
                    .fail(job.id, &self.worker_id, "no provider adapter registered", FailureKind::NonRetryable)
                    .await;
                return false;
            }
        };

        // Authoritative admission check: the only call site that may
        // acquire the single half-open trial for this provider.
        if self.circuits.gate(&job.provider_key, self.clock.now()) == Allow::Deny {
            return self.settle_retry(job, "provider circuit open").await;
        }

        let provider_job_id = match provider.start(&job.input_ref, &job.model_key).await {
            Ok(id) => id,
            Err(err) => return self.settle_start_failure(job, &err).await,
        };

        if self
            .job_store
            .mark_running(job.id, &self.worker_id, &provider_job_id)
            .await
            .is_err()
        {
            return false;
        }

        loop {
            if lease_lost.load(Ordering::SeqCst) {
                info!(job_id = %job.id, "abandoning job: lease lost");
                let _ = provider.cancel(&provider_job_id).await;
                return false;
            }

            if self.job_cancel_requested(job.id).await {
                info!(job_id = %job.id, "cancellation observed; cancelling provider and refunding");
                let _ = provider.cancel(&provider_job_id).await;
                return self.settle_refund(job, "cancelled").await;
            }

            match provider.poll(&provider_job_id).await {
                Ok(ProviderOutcome::Pending) => {
                    sleep(std::time::Duration::from_millis(1000)).await;
                    continue;
                }
                Ok(ProviderOutcome::Done { output_ref }) => {
                    self.circuits.record(&job.provider_key, Outcome::Success, self.clock.now());
                    return self.settle_success(job, &output_ref).await;
                }
                Ok(ProviderOutcome::Failed { error, retryable }) => {
                    self.circuits.record(&job.provider_key, Outcome::Failure, self.clock.now());
                    return if retryable {
                        self.settle_retry(job, &error).await
                    } else {
                        self.settle_refund(job, &error).await
                    };
                }
                Err(err) => {
                    self.circuits.record(&job.provider_key, Outcome::Failure, self.clock.now());
                    return self.settle_start_failure(job, &err).await;
                }
            }
        }
    }

    async fn job_cancel_requested(&self, job_id: Uuid) -> bool {
        matches!(self.job_store.get(job_id).await, Ok(Some(j)) if j.cancel_requested)
    }

    /// Success path: asset persisted before commit (a post-commit crash
    /// leaves a recoverable asset), commit before `succeed` (a crash in
    /// that window leaves a `held` reservation that reconciliation will
    /// commit again idempotently) — spec §4.2 ordering requirement.
    async fn settle_success(&self, job: &Job, output_ref: &str) -> bool {
        let bytes = output_ref.as_bytes().to_vec();
        let asset = match self
            .assets
            .put(&job.user_id, crate::asset::AssetKind::Video, bytes, "video/mp4", ".mp4")
            .await
        {
            Ok(a) => a,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "asset upload failed after provider success");
                return self.settle_retry(job, "asset upload failed").await;
            }
        };

        if let Err(err) = self.ledger.commit(job.reservation_id).await {
            warn!(job_id = %job.id, error = %err, "commit failed after asset persisted; reconciliation will retry");
        }

        match self.job_store.succeed(job.id, &self.worker_id, asset.id).await {
            Ok(()) => true,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "succeed transition failed after settlement");
                false
            }
        }
    }

    /// Retryable failure — unless this was the job's last attempt, in
    /// which case it is terminal (spec §4.2) and must refund before
    /// finalizing, the same as a non-retryable failure.
    async fn settle_retry(&self, job: &Job, error: &str) -> bool {
        if job.attempts + 1 >= job.max_attempts {
            return self.settle_refund(job, error).await;
        }
        let _ = self
            .job_store
            .fail(job.id, &self.worker_id, error, FailureKind::Retryable)
            .await;
        false
    }

    /// Terminal failure or cancellation: refund precedes the fail/dead
    /// transition; a refund failure is queued, not propagated (spec
    /// §4.2, §4.3).
    async fn settle_refund(&self, job: &Job, reason: &str) -> bool {
        if let Err(err) = self.ledger.refund(job.reservation_id, reason).await {
            warn!(job_id = %job.id, error = %err, "refund failed; queueing for refund sweeper");
            let _ = self
                .ledger
                .enqueue_refund_failure(job.reservation_id, &err.to_string())
                .await;
        }
        let _ = self
            .job_store
            .fail(job.id, &self.worker_id, reason, FailureKind::NonRetryable)
            .await;
        false
    }

    async fn settle_start_failure(&self, job: &Job, err: &StudioError) -> bool {
        if err.is_retryable() {
            self.settle_retry(job, &err.to_string()).await
        } else {
            self.settle_refund(job, &err.to_string()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_poll_interval_is_sub_second() {
        assert!(IDLE_POLL_INTERVAL_MS < 1000);
    }
}
