use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use studio_core::{ProviderAdapter, ProviderOutcome, StudioResult};
use uuid::Uuid;

#[derive(Debug, Clone)]
enum Script {
    Succeed { after_polls: u32 },
    Fail { after_polls: u32, retryable: bool },
}

/// A scriptable [`ProviderAdapter`] fake (spec §9 `InlineFake`): runs
/// entirely in-process, no network calls, deterministic outcomes driven
/// by a per-provider-job poll counter.
pub struct InlineFakeProvider {
    script: Script,
    polls: Mutex<HashMap<String, u32>>,
}

impl InlineFakeProvider {
    pub fn succeeding_after(polls: u32) -> Self {
        Self {
            script: Script::Succeed { after_polls: polls },
            polls: Mutex::new(HashMap::new()),
        }
    }

    pub fn failing_after(polls: u32, retryable: bool) -> Self {
        Self {
            script: Script::Fail {
                after_polls: polls,
                retryable,
            },
            polls: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ProviderAdapter for InlineFakeProvider {
    async fn start(&self, _input_ref: &str, _model_key: &str) -> StudioResult<String> {
        Ok(Uuid::new_v4().to_string())
    }

    async fn poll(&self, provider_job_id: &str) -> StudioResult<ProviderOutcome> {
        let mut polls = self.polls.lock().unwrap();
        let count = polls.entry(provider_job_id.to_string()).or_insert(0);
        *count += 1;

        match self.script {
            Script::Succeed { after_polls } => {
                if *count >= after_polls {
                    Ok(ProviderOutcome::Done {
                        output_ref: format!("output://{provider_job_id}"),
                    })
                } else {
                    Ok(ProviderOutcome::Pending)
                }
            }
            Script::Fail { after_polls, retryable } => {
                if *count >= after_polls {
                    Ok(ProviderOutcome::Failed {
                        error: "fake provider failure".to_string(),
                        retryable,
                    })
                } else {
                    Ok(ProviderOutcome::Pending)
                }
            }
        }
    }

    async fn cancel(&self, _provider_job_id: &str) -> StudioResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn succeeds_after_scripted_poll_count() {
        let provider = InlineFakeProvider::succeeding_after(2);
        let id = provider.start("ref", "model").await.unwrap();
        assert!(matches!(provider.poll(&id).await.unwrap(), ProviderOutcome::Pending));
        match provider.poll(&id).await.unwrap() {
            ProviderOutcome::Done { .. } => {}
            other => panic!("expected done, got {other:?}"),
        }
    }
}
