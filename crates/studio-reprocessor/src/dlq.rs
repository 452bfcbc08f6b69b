use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use studio_core::{BatchOutcome, CircuitState, JobStore, ProviderCircuitRegistry};
use tokio::sync::watch;
use tracing::{info, warn};

/// Re-queues DLQ entries once their provider's circuit is `closed` or
/// `half-open` and the entry has aged past `min_dlq_age` — giving a
/// recovering provider a moment to stabilize before the backlog lands
/// on it (spec §4.5).
pub struct DlqReprocessor {
    job_store: Arc<dyn JobStore>,
    circuits: Arc<ProviderCircuitRegistry>,
    max_entries_per_run: usize,
    min_dlq_age: chrono::Duration,
    poll_interval: Duration,
}

impl DlqReprocessor {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        circuits: Arc<ProviderCircuitRegistry>,
        max_entries_per_run: usize,
        min_dlq_age: chrono::Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            job_store,
            circuits,
            max_entries_per_run,
            min_dlq_age,
            poll_interval,
        }
    }

    pub async fn run_once(&self) -> BatchOutcome {
        let now = Utc::now();
        let mut outcome = BatchOutcome::default();

        let entries = match self.job_store.dlq_entries(self.max_entries_per_run).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "dlq reprocessor: failed to list entries");
                return outcome;
            }
        };

        for entry in entries {
            if now - entry.enqueued_at < self.min_dlq_age {
                continue;
            }

            let state = self.circuits.status(&entry.provider_key).state;
            if !matches!(state, CircuitState::Closed | CircuitState::HalfOpen) {
                continue;
            }

            match self.job_store.requeue_from_dlq(entry.job_id).await {
                Ok(()) => {
                    info!(job_id = %entry.job_id, provider_key = %entry.provider_key, "requeued dlq entry");
                    outcome.record_success();
                }
                Err(err) => {
                    warn!(job_id = %entry.job_id, error = %err, "failed to requeue dlq entry");
                    outcome.record_failure();
                }
            }
        }

        outcome
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studio_core::{CircuitConfig, Outcome};
    use studio_testing::InMemoryJobStore;

    #[tokio::test]
    async fn requeues_only_entries_whose_circuit_has_recovered_and_aged_enough() {
        let job_store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let circuits = Arc::new(ProviderCircuitRegistry::new(CircuitConfig::default()));

        let reservation_id = uuid::Uuid::new_v4();
        let job = studio_core::Job::new(
            uuid::Uuid::new_v4(),
            "user-1",
            "flaky-provider",
            "model-a",
            "fp",
            "ref",
            reservation_id,
            3,
            Utc::now(),
        );
        let job = job_store.enqueue(job).await.unwrap();
        let _ = job_store
            .lease_next("w1", chrono::Duration::seconds(1), &|_| true)
            .await
            .unwrap();
        job_store.fail(job.id, "w1", "boom", studio_core::FailureKind::NonRetryable).await.unwrap();

        // Circuit never recorded anything: status defaults to closed.
        let reprocessor = DlqReprocessor::new(
            job_store.clone(),
            circuits.clone(),
            10,
            chrono::Duration::zero(),
            Duration::from_secs(1),
        );
        let outcome = reprocessor.run_once().await;
        assert_eq!(outcome.succeeded, 1);

        // A still-open circuit should keep the next DLQ entry parked.
        for _ in 0..25 {
            circuits.record("dead-provider", Outcome::Failure, Utc::now());
        }
        let job2 = studio_core::Job::new(
            uuid::Uuid::new_v4(),
            "user-1",
            "dead-provider",
            "model-a",
            "fp",
            "ref",
            uuid::Uuid::new_v4(),
            1,
            Utc::now(),
        );
        let job2 = job_store.enqueue(job2).await.unwrap();
        let _ = job_store
            .lease_next("w1", chrono::Duration::seconds(1), &|_| true)
            .await
            .unwrap();
        job_store.fail(job2.id, "w1", "boom", studio_core::FailureKind::NonRetryable).await.unwrap();

        let outcome2 = reprocessor.run_once().await;
        assert_eq!(outcome2.attempted, 0);
    }
}
