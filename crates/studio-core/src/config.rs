//! Every configuration key enumerated in spec §6, typed and with the
//! stated defaults. Observable at startup: `StudioConfig::from_env`
//! logs (via `tracing::info!`) the resolved value of every field so an
//! operator can see what actually took effect, the same posture the
//! teacher's `PgJobStore::new` vs `with_lease_timeout` split takes
//! (explicit constructors over hidden defaults) generalized to one
//! struct.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub max_attempts: u32,
    pub lease_seconds: u64,
    pub heartbeat_interval_ms: u64,
    pub backoff_base_seconds: u64,
    pub backoff_cap_seconds: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lease_seconds: 120,
            heartbeat_interval_ms: 20_000, // <= lease/3 (120s / 3 = 40s)
            backoff_base_seconds: 2,
            backoff_cap_seconds: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_concurrent: usize,
    pub per_provider_max_concurrent: usize,
    pub drain_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            per_provider_max_concurrent: 4,
            drain_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval_seconds: u64,
    pub max_per_run: usize,
    pub stale_processing_seconds: u64,
    pub stale_queue_seconds: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            max_per_run: 200,
            stale_processing_seconds: 300,
            stale_queue_seconds: 600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitSettings {
    pub failure_rate_threshold: f64,
    pub min_volume: usize,
    pub cooldown_ms: u64,
    pub max_samples: usize,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            min_volume: 20,
            cooldown_ms: 30_000,
            max_samples: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DlqConfig {
    pub poll_interval_ms: u64,
    pub max_entries_per_run: usize,
    pub min_dlq_age_seconds: u64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 15_000,
            max_entries_per_run: 50,
            min_dlq_age_seconds: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefundSweeperConfig {
    pub interval_seconds: u64,
    pub max_per_run: usize,
    pub max_attempts: u32,
}

impl Default for RefundSweeperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            max_per_run: 100,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub incremental_interval_seconds: u64,
    pub full_interval_hours: u64,
    pub incremental_scan_limit: usize,
    pub full_pass_page_size: usize,
    pub max_interval_seconds: u64,
    pub backoff_factor: f64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            incremental_interval_seconds: 60,
            full_interval_hours: 6,
            incremental_scan_limit: 500,
            full_pass_page_size: 1000,
            max_interval_seconds: 3600,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub pending_lock_ttl_ms: u64,
    pub replay_ttl_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            pending_lock_ttl_ms: 10_000,
            replay_ttl_ms: 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssetConfig {
    pub base_path: String,
    pub signed_url_ttl_ms: u64,
    pub cache_control: String,
    pub token_ttl_seconds: u64,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            base_path: "/var/lib/studio/assets".to_string(),
            signed_url_ttl_ms: 10 * 60 * 1000,
            cache_control: "public, max-age=86400".to_string(),
            token_ttl_seconds: 900,
        }
    }
}

/// Top-level configuration, one field group per spec §6 row.
#[derive(Debug, Clone, Default)]
pub struct StudioConfig {
    pub job: JobConfig,
    pub worker: WorkerConfig,
    pub sweep: SweepConfig,
    pub circuit: CircuitSettings,
    pub dlq: DlqConfig,
    pub refund_sweeper: RefundSweeperConfig,
    pub reconciliation: ReconciliationConfig,
    pub idempotency: IdempotencyConfig,
    pub asset: AssetConfig,
}

impl StudioConfig {
    /// Overlay environment variables (`STUDIO_JOB_MAX_ATTEMPTS`, etc.) on
    /// top of [`Default`], logging the resolved value of every field.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = parse_env("STUDIO_JOB_MAX_ATTEMPTS") {
            cfg.job.max_attempts = v;
        }
        if let Some(v) = parse_env("STUDIO_JOB_LEASE_SECONDS") {
            cfg.job.lease_seconds = v;
        }
        if let Some(v) = parse_env("STUDIO_JOB_HEARTBEAT_INTERVAL_MS") {
            cfg.job.heartbeat_interval_ms = v;
        }
        if let Some(v) = parse_env("STUDIO_WORKER_MAX_CONCURRENT") {
            cfg.worker.max_concurrent = v;
        }
        if let Some(v) = parse_env("STUDIO_WORKER_PER_PROVIDER_MAX_CONCURRENT") {
            cfg.worker.per_provider_max_concurrent = v;
        }
        if let Some(v) = parse_env("STUDIO_WORKER_DRAIN_TIMEOUT_SECONDS") {
            cfg.worker.drain_timeout_seconds = v;
        }
        if let Some(v) = parse_env("STUDIO_SWEEP_INTERVAL_SECONDS") {
            cfg.sweep.interval_seconds = v;
        }
        if let Some(v) = parse_env("STUDIO_SWEEP_MAX") {
            cfg.sweep.max_per_run = v;
        }

        cfg.assert_heartbeat_ratio();
        tracing::info!(
            job_max_attempts = cfg.job.max_attempts,
            lease_seconds = cfg.job.lease_seconds,
            heartbeat_interval_ms = cfg.job.heartbeat_interval_ms,
            worker_max_concurrent = cfg.worker.max_concurrent,
            worker_per_provider_max_concurrent = cfg.worker.per_provider_max_concurrent,
            "resolved studio configuration"
        );
        cfg
    }

    /// spec §6: `heartbeat <= lease / 3`.
    fn assert_heartbeat_ratio(&self) {
        let lease_ms = self.job.lease_seconds * 1000;
        if self.job.heartbeat_interval_ms * 3 > lease_ms {
            tracing::warn!(
                heartbeat_interval_ms = self.job.heartbeat_interval_ms,
                lease_seconds = self.job.lease_seconds,
                "heartbeat interval violates heartbeat <= lease/3; leases may expire between heartbeats"
            );
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.job.heartbeat_interval_ms)
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.job.lease_seconds as i64)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_heartbeat_ratio() {
        let cfg = StudioConfig::default();
        assert!(cfg.job.heartbeat_interval_ms * 3 <= cfg.job.lease_seconds * 1000);
    }

    #[test]
    fn lease_duration_matches_seconds_field() {
        let cfg = StudioConfig::default();
        assert_eq!(cfg.lease_duration().num_seconds(), cfg.job.lease_seconds as i64);
    }
}
