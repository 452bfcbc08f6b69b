//! End-to-end submit/poll/result walkthrough wired entirely from
//! in-memory fakes (`studio-testing`) plus the real [`Orchestrator`] and
//! [`Worker`] — no database, no network. Shows the intended construction
//! graph from spec §9: explicit `Arc`s assembled once at process start,
//! no service locator.

use std::sync::Arc;
use std::time::Duration;

use studio_assets::HmacContentAccess;
use studio_core::config::{JobConfig, WorkerConfig};
use studio_core::{
    CircuitConfig, GenerationRequest, Orchestrator, ProviderCircuitRegistry, ProviderRegistry, SystemClock, UuidGen,
    VisibleState, Worker,
};
use studio_testing::{InMemoryAssetStore, InMemoryCreditLedger, InMemoryIdempotency, InMemoryJobStore, InlineFakeProvider};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let job_store = Arc::new(InMemoryJobStore::new());
    let ledger = Arc::new(InMemoryCreditLedger::new());
    ledger.grant("demo-user", 1_000);
    let idempotency = Arc::new(InMemoryIdempotency::new());
    let assets = Arc::new(InMemoryAssetStore::new("/data/assets"));

    let mut providers = ProviderRegistry::new();
    providers.register("fast-draft", Arc::new(InlineFakeProvider::succeeding_after(2)));
    let providers = Arc::new(providers);
    let circuits = Arc::new(ProviderCircuitRegistry::new(CircuitConfig::default()));
    let content_access = Arc::new(HmacContentAccess::new(b"demo-signing-key".to_vec()));

    let orchestrator = Orchestrator::new(
        job_store.clone(),
        ledger.clone(),
        idempotency.clone(),
        Arc::new(UuidGen),
        Arc::new(SystemClock),
        assets.clone(),
        content_access,
        chrono::Duration::seconds(30),
        chrono::Duration::seconds(300),
        chrono::Duration::seconds(60),
    );

    let worker = Worker::new(
        "demo-worker-1",
        job_store.clone(),
        ledger.clone(),
        assets.clone(),
        circuits.clone(),
        providers.clone(),
        Arc::new(SystemClock),
        JobConfig::default(),
        WorkerConfig::default(),
    );
    let worker_handle = worker.spawn();

    let request = GenerationRequest {
        user_id: "demo-user".to_string(),
        provider_key: "fast-draft".to_string(),
        model_key: "model-a".to_string(),
        input_ref: "input://demo-clip".to_string(),
        input_fingerprint: "fp-demo-clip".to_string(),
        cost: 50,
        max_attempts: 3,
    };

    let submitted = orchestrator.submit(request).await?;
    info!(job_id = %submitted.job_id, "submitted generation request");

    let final_status = loop {
        let status = orchestrator.status(submitted.job_id).await?;
        info!(state = ?status.state, attempts = status.attempts, "polling job status");
        if matches!(
            status.state,
            VisibleState::Succeeded | VisibleState::Failed | VisibleState::Cancelled
        ) {
            break status;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    println!("final state: {:?}", final_status.state);
    if final_status.state == VisibleState::Succeeded {
        let result = orchestrator.result(submitted.job_id).await?;
        println!("result asset: {}", result.asset_id);
        println!("content token: {}", result.content_token);
        println!("token expires at: {}", result.expires_at);
    }

    worker_handle.drain(Duration::from_secs(5)).await;
    Ok(())
}
