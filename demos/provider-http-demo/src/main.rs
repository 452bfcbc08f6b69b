//! Shows a [`ProviderAdapter`] backed directly by `reqwest`, no framework
//! ceremony beyond the trait itself — a provider that speaks a REST job
//! API: `POST /jobs` to start, `GET /jobs/{id}` to poll.
//!
//! Run against any mock HTTP server that accepts that shape; without one,
//! `start` will fail and the demo prints the resulting error.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use studio_core::{ProviderAdapter, ProviderOutcome, StudioError, StudioResult};
use tracing::info;

struct RemoteHttpProvider {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteHttpProvider {
    fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with a static config"),
            base_url: base_url.into(),
        }
    }
}

#[derive(Deserialize)]
struct StartResponse {
    job_id: String,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum PollResponse {
    Pending,
    Done { output_ref: String },
    Failed { error: String, retryable: bool },
}

#[async_trait]
impl ProviderAdapter for RemoteHttpProvider {
    async fn start(&self, input_ref: &str, model_key: &str) -> StudioResult<String> {
        let resp = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .json(&serde_json::json!({ "input_ref": input_ref, "model_key": model_key }))
            .send()
            .await
            .map_err(|e| StudioError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(StudioError::Transient(format!("start returned HTTP {}", resp.status())));
        }
        let parsed: StartResponse = resp.json().await.map_err(|e| StudioError::Transient(e.to_string()))?;
        Ok(parsed.job_id)
    }

    async fn poll(&self, provider_job_id: &str) -> StudioResult<ProviderOutcome> {
        let resp = self
            .client
            .get(format!("{}/jobs/{}", self.base_url, provider_job_id))
            .send()
            .await
            .map_err(|e| StudioError::Transient(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StudioError::Terminal(format!("provider forgot job {provider_job_id}")));
        }
        if !resp.status().is_success() {
            return Err(StudioError::Transient(format!("poll returned HTTP {}", resp.status())));
        }

        let parsed: PollResponse = resp.json().await.map_err(|e| StudioError::Transient(e.to_string()))?;
        Ok(match parsed {
            PollResponse::Pending => ProviderOutcome::Pending,
            PollResponse::Done { output_ref } => ProviderOutcome::Done { output_ref },
            PollResponse::Failed { error, retryable } => ProviderOutcome::Failed { error, retryable },
        })
    }

    async fn cancel(&self, provider_job_id: &str) -> StudioResult<()> {
        let _ = self
            .client
            .delete(format!("{}/jobs/{}", self.base_url, provider_job_id))
            .send()
            .await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let base_url = std::env::var("PROVIDER_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8089".to_string());
    let provider = RemoteHttpProvider::new(base_url);

    info!("starting generation against remote provider");
    match provider.start("input://demo-clip", "fast-draft").await {
        Ok(provider_job_id) => {
            info!(provider_job_id = %provider_job_id, "provider accepted job, polling once");
            match provider.poll(&provider_job_id).await {
                Ok(outcome) => println!("poll outcome: {outcome:?}"),
                Err(err) => println!("poll failed: {err}"),
            }
        }
        Err(err) => println!("start failed (expected without a live provider endpoint): {err}"),
    }

    Ok(())
}
