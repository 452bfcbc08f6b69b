//! Regression coverage for the worker's settlement rules (spec §4.2):
//! a retryable provider failure on a job's last attempt is terminal and
//! must refund, the same as a non-retryable one. Lives here rather than
//! in `studio-core` because it drives a real `Worker` end-to-end against
//! the in-memory fakes this crate provides.

use std::sync::Arc;
use std::time::Duration;

use studio_core::config::JobConfig;
use studio_core::{
    CircuitConfig, GenerationRequest, Job, JobStore, Orchestrator, ProviderCircuitRegistry, ProviderRegistry,
    ReservationStatus, SystemClock, UuidGen, VisibleState, Worker,
};

use crate::{
    InMemoryAssetStore, InMemoryCreditLedger, InMemoryIdempotency, InMemoryJobStore, InlineContentAccess,
    InlineFakeProvider,
};

#[tokio::test]
async fn retryable_failure_on_last_attempt_refunds_instead_of_requeuing() {
    let job_store = Arc::new(InMemoryJobStore::new());
    let ledger = Arc::new(InMemoryCreditLedger::new());
    ledger.grant("user-1", 100);
    let idempotency = Arc::new(InMemoryIdempotency::new());
    let assets = Arc::new(InMemoryAssetStore::new("/data/assets"));

    let mut providers = ProviderRegistry::new();
    providers.register("flaky", Arc::new(InlineFakeProvider::failing_after(1, true)));
    let providers = Arc::new(providers);
    let circuits = Arc::new(ProviderCircuitRegistry::new(CircuitConfig::default()));

    let orchestrator = Orchestrator::new(
        job_store.clone(),
        ledger.clone(),
        idempotency,
        Arc::new(UuidGen),
        Arc::new(SystemClock),
        assets.clone(),
        Arc::new(InlineContentAccess),
        chrono::Duration::seconds(30),
        chrono::Duration::seconds(300),
        chrono::Duration::seconds(60),
    );

    let request = GenerationRequest {
        user_id: "user-1".to_string(),
        provider_key: "flaky".to_string(),
        model_key: "model-a".to_string(),
        input_ref: "input://clip".to_string(),
        input_fingerprint: "fp-clip".to_string(),
        cost: 40,
        max_attempts: 1,
    };
    let submitted = orchestrator.submit(request).await.unwrap();

    let mut job_cfg = JobConfig::default();
    job_cfg.lease_seconds = 5;
    job_cfg.heartbeat_interval_ms = 1_000;

    let worker = Worker::new(
        "worker-1",
        job_store.clone(),
        ledger.clone(),
        assets,
        circuits,
        providers,
        Arc::new(SystemClock),
        job_cfg,
        studio_core::config::WorkerConfig::default(),
    );
    let handle = worker.spawn();

    let job = wait_for_terminal(&job_store, submitted.job_id).await;
    handle.drain(Duration::from_secs(2)).await;

    assert_eq!(job.state, studio_core::JobState::Dead);
    assert_eq!(job.attempts, 1);

    let reservation = ledger.get_reservation(job.reservation_id).await.unwrap().unwrap();
    assert_eq!(reservation.status, ReservationStatus::Refunded);

    let status = orchestrator.status(submitted.job_id).await.unwrap();
    assert_eq!(status.state, VisibleState::Failed);
}

async fn wait_for_terminal(job_store: &Arc<InMemoryJobStore>, job_id: uuid::Uuid) -> Job {
    for _ in 0..100 {
        let job = job_store.get(job_id).await.unwrap().unwrap();
        if job.state.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job never reached a terminal state");
}
