//! Per-provider failure-rate circuit breaker (spec §4.4).
//!
//! Process-local by design (see spec §5: "multi-process coordination is
//! eventually-consistent — each process decides `gate()` on its own
//! window to avoid a hot-path store read"). A `dashmap` keyes per
//! provider so many workers in one process can record/gate concurrently
//! without a global lock, the same concurrency posture the teacher uses
//! for its event bus subscriber map.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allow {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    pub failure_rate_threshold: f64,
    pub min_volume: usize,
    pub cooldown: chrono::Duration,
    pub max_samples: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            min_volume: 20,
            cooldown: chrono::Duration::seconds(30),
            max_samples: 100,
        }
    }
}

/// A single provider's sliding window and state machine. Not `Clone` —
/// owned by the registry behind a lock per provider key.
struct ProviderCircuitInner {
    samples: VecDeque<Outcome>,
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
    half_open_trial_in_flight: AtomicBool,
    config: CircuitConfig,
}

impl ProviderCircuitInner {
    fn new(config: CircuitConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.max_samples),
            state: CircuitState::Closed,
            opened_at: None,
            half_open_trial_in_flight: AtomicBool::new(false),
            config,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|o| **o == Outcome::Failure).count();
        failures as f64 / self.samples.len() as f64
    }

    fn record(&mut self, outcome: Outcome, now: DateTime<Utc>) {
        match self.state {
            CircuitState::Closed => {
                self.samples.push_back(outcome);
                if self.samples.len() > self.config.max_samples {
                    self.samples.pop_front();
                }
                if self.samples.len() >= self.config.min_volume
                    && self.failure_rate() >= self.config.failure_rate_threshold
                {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                self.half_open_trial_in_flight.store(false, Ordering::SeqCst);
                match outcome {
                    Outcome::Success => {
                        self.state = CircuitState::Closed;
                        self.samples.clear();
                        self.opened_at = None;
                    }
                    Outcome::Failure => {
                        self.state = CircuitState::Open;
                        self.opened_at = Some(now);
                    }
                }
            }
            CircuitState::Open => {
                // A settlement arriving after the circuit already reopened
                // (e.g. a straggling trial) is ignored; the next gate()
                // call re-derives half-open eligibility from `opened_at`.
            }
        }
    }

    fn gate(&mut self, now: DateTime<Utc>) -> Allow {
        match self.state {
            CircuitState::Closed => Allow::Allow,
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                if now >= opened_at + self.config.cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_trial_in_flight.store(false, Ordering::SeqCst);
                    self.try_acquire_half_open_trial()
                } else {
                    Allow::Deny
                }
            }
            CircuitState::HalfOpen => self.try_acquire_half_open_trial(),
        }
    }

    fn try_acquire_half_open_trial(&self) -> Allow {
        match self
            .half_open_trial_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Allow::Allow,
            Err(_) => Allow::Deny,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub samples: usize,
    pub failure_rate: f64,
}

/// Registry of per-provider circuits, the process-wide state the spec's
/// design notes call out (§9: "Process-wide state: ... the `ProviderCircuit`
/// map (init at startup, torn down on drain)").
pub struct ProviderCircuitRegistry {
    circuits: DashMap<String, ProviderCircuitInner>,
    default_config: CircuitConfig,
}

impl ProviderCircuitRegistry {
    pub fn new(default_config: CircuitConfig) -> Self {
        Self {
            circuits: DashMap::new(),
            default_config,
        }
    }

    fn entry(&self, provider_key: &str) -> dashmap::mapref::one::RefMut<'_, String, ProviderCircuitInner> {
        self.circuits
            .entry(provider_key.to_string())
            .or_insert_with(|| ProviderCircuitInner::new(self.default_config))
    }

    pub fn gate(&self, provider_key: &str, now: DateTime<Utc>) -> Allow {
        self.entry(provider_key).gate(now)
    }

    pub fn record(&self, provider_key: &str, outcome: Outcome, now: DateTime<Utc>) {
        self.entry(provider_key).record(outcome, now);
    }

    pub fn status(&self, provider_key: &str) -> CircuitStatus {
        let circuit = self.entry(provider_key);
        CircuitStatus {
            state: circuit.state,
            samples: circuit.samples.len(),
            failure_rate: circuit.failure_rate(),
        }
    }

    /// Snapshot of every provider this registry has seen, for operator
    /// visibility (supplemented feature — see SPEC_FULL.md §2).
    pub fn snapshot(&self) -> Vec<(String, CircuitStatus)> {
        self.circuits
            .iter()
            .map(|entry| {
                let status = CircuitStatus {
                    state: entry.state,
                    samples: entry.samples.len(),
                    failure_rate: entry.failure_rate(),
                };
                (entry.key().clone(), status)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitConfig {
        CircuitConfig {
            failure_rate_threshold: 0.6,
            min_volume: 20,
            cooldown: chrono::Duration::milliseconds(50),
            max_samples: 100,
        }
    }

    #[test]
    fn trips_open_after_threshold_failure_rate_reached() {
        let registry = ProviderCircuitRegistry::new(cfg());
        let now = Utc::now();
        for i in 0..20 {
            let outcome = if i < 15 { Outcome::Failure } else { Outcome::Success };
            registry.record("p1", outcome, now);
        }
        assert_eq!(registry.gate("p1", now), Allow::Deny);
        assert_eq!(registry.status("p1").state, CircuitState::Open);
    }

    #[test]
    fn half_open_allows_single_trial() {
        let registry = ProviderCircuitRegistry::new(cfg());
        let now = Utc::now();
        for _ in 0..20 {
            registry.record("p1", Outcome::Failure, now);
        }
        assert_eq!(registry.gate("p1", now), Allow::Deny);

        let after_cooldown = now + chrono::Duration::milliseconds(100);
        assert_eq!(registry.gate("p1", after_cooldown), Allow::Allow);
        // Second concurrent attempt is denied — only one trial in flight.
        assert_eq!(registry.gate("p1", after_cooldown), Allow::Deny);
    }

    #[test]
    fn half_open_success_closes_and_clears_window() {
        let registry = ProviderCircuitRegistry::new(cfg());
        let now = Utc::now();
        for _ in 0..20 {
            registry.record("p1", Outcome::Failure, now);
        }
        let after_cooldown = now + chrono::Duration::milliseconds(100);
        assert_eq!(registry.gate("p1", after_cooldown), Allow::Allow);
        registry.record("p1", Outcome::Success, after_cooldown);
        assert_eq!(registry.status("p1").state, CircuitState::Closed);
        assert_eq!(registry.status("p1").samples, 0);
        assert_eq!(registry.gate("p1", after_cooldown), Allow::Allow);
    }

    #[test]
    fn half_open_failure_reopens() {
        let registry = ProviderCircuitRegistry::new(cfg());
        let now = Utc::now();
        for _ in 0..20 {
            registry.record("p1", Outcome::Failure, now);
        }
        let after_cooldown = now + chrono::Duration::milliseconds(100);
        assert_eq!(registry.gate("p1", after_cooldown), Allow::Allow);
        registry.record("p1", Outcome::Failure, after_cooldown);
        assert_eq!(registry.status("p1").state, CircuitState::Open);
        assert_eq!(registry.gate("p1", after_cooldown), Allow::Deny);
    }

    #[test]
    fn closed_below_min_volume_never_trips() {
        let registry = ProviderCircuitRegistry::new(cfg());
        let now = Utc::now();
        for _ in 0..10 {
            registry.record("p1", Outcome::Failure, now);
        }
        assert_eq!(registry.status("p1").state, CircuitState::Closed);
        assert_eq!(registry.gate("p1", now), Allow::Allow);
    }
}
