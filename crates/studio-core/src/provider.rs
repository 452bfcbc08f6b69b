//! Unified contract across heterogeneous provider backends (spec §9):
//! `start(input) -> providerJobId`, `poll(providerJobId) -> outcome`,
//! `cancel(providerJobId)`. Variants in the spec's re-architecture
//! guidance — `RemoteHttp`, `RemoteSdk`, `InlineFake` — are concrete
//! implementors of [`ProviderAdapter`]; `InlineFake` lives in
//! `studio-testing`, `RemoteHttp` is sketched in `demos/provider-http-demo`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StudioResult;

/// Outcome of a single [`ProviderAdapter::poll`] call.
#[derive(Debug, Clone)]
pub enum ProviderOutcome {
    Pending,
    Done { output_ref: String },
    Failed { error: String, retryable: bool },
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Start generation; returns the provider's own job identifier.
    async fn start(&self, input_ref: &str, model_key: &str) -> StudioResult<String>;

    /// Poll for completion. Implementations must be safe to call
    /// repeatedly and must not block past a short per-call timeout — the
    /// worker bounds the overall wait by the lease remainder, not by this
    /// call.
    async fn poll(&self, provider_job_id: &str) -> StudioResult<ProviderOutcome>;

    /// Best-effort cancel; providers that don't support cancellation
    /// should treat this as a no-op rather than erroring.
    async fn cancel(&self, provider_job_id: &str) -> StudioResult<()>;
}

/// Registry keyed by `providerKey`, assembled once at process start
/// (spec §9: "explicit construction graph assembled at process start").
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider_key: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(provider_key.into(), adapter);
    }

    pub fn get(&self, provider_key: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_key).cloned()
    }

    pub fn provider_keys(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopAdapter;

    #[async_trait]
    impl ProviderAdapter for NoopAdapter {
        async fn start(&self, _input_ref: &str, _model_key: &str) -> StudioResult<String> {
            Ok("provider-job-1".to_string())
        }
        async fn poll(&self, _provider_job_id: &str) -> StudioResult<ProviderOutcome> {
            Ok(ProviderOutcome::Pending)
        }
        async fn cancel(&self, _provider_job_id: &str) -> StudioResult<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_looks_up_by_key() {
        let mut registry = ProviderRegistry::new();
        registry.register("fast-draft", Arc::new(NoopAdapter));
        assert!(registry.get("fast-draft").is_some());
        assert!(registry.get("premium").is_none());
    }
}
