//! Error taxonomy shared by every subsystem in this crate.
//!
//! Mirrors the split the rest of the workspace uses: a single
//! [`thiserror`]-derived enum carries the *kind* of failure (per spec §7),
//! and [`Categorizable`] lets callers decide retry/refund/surface policy
//! without matching on every variant at every call site.

use std::fmt;

use thiserror::Error;

/// The error kinds named in the spec's error taxonomy (§7).
#[derive(Debug, Error)]
pub enum StudioError {
    #[error("insufficient funds: user has {available}, needs {requested}")]
    InsufficientFunds { available: i64, requested: i64 },

    #[error("duplicate in-flight request for key {0}")]
    DuplicateInFlight(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("terminal failure: {0}")]
    Terminal(String),

    #[error("lease lost for job {job_id}")]
    LeaseLost { job_id: uuid::Uuid },

    #[error("provider circuit open for {provider_key}")]
    CircuitOpen { provider_key: String },

    #[error("asset unavailable: {0}")]
    AssetUnavailable(String),

    #[error("content token signature invalid")]
    SignatureInvalid,

    #[error("conflict: conditional write lost the race")]
    Conflict,

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A coarse, PII-free bucket for metrics/alerting — never log the full
/// [`StudioError::Display`] to a cardinality-sensitive sink, log this instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafeErrorCategory {
    InsufficientFunds,
    DuplicateInFlight,
    InvalidRequest,
    Transient,
    Terminal,
    LeaseLost,
    CircuitOpen,
    AssetUnavailable,
    SignatureInvalid,
    Conflict,
    NotFound,
    Other,
}

impl fmt::Display for SafeErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InsufficientFunds => "insufficient_funds",
            Self::DuplicateInFlight => "duplicate_in_flight",
            Self::InvalidRequest => "invalid_request",
            Self::Transient => "transient",
            Self::Terminal => "terminal",
            Self::LeaseLost => "lease_lost",
            Self::CircuitOpen => "circuit_open",
            Self::AssetUnavailable => "asset_unavailable",
            Self::SignatureInvalid => "signature_invalid",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Policy questions every caller needs answered about a failure, without
/// matching on the concrete variant.
pub trait Categorizable {
    /// True if the worker should retry the underlying job (stays `held`,
    /// no refund) rather than refund and finalize.
    fn is_retryable(&self) -> bool;

    /// True if this error should surface directly to the calling client
    /// (spec §7: `InsufficientFunds`, `DuplicateInFlight`, `InvalidRequest`,
    /// `SignatureInvalid`, `AssetUnavailable`).
    fn is_client_visible(&self) -> bool;

    fn safe_category(&self) -> SafeErrorCategory;
}

impl Categorizable for StudioError {
    fn is_retryable(&self) -> bool {
        matches!(self, StudioError::Transient(_) | StudioError::Conflict)
    }

    fn is_client_visible(&self) -> bool {
        matches!(
            self,
            StudioError::InsufficientFunds { .. }
                | StudioError::DuplicateInFlight(_)
                | StudioError::InvalidRequest(_)
                | StudioError::SignatureInvalid
                | StudioError::AssetUnavailable(_)
                | StudioError::NotFound(_)
        )
    }

    fn safe_category(&self) -> SafeErrorCategory {
        match self {
            StudioError::InsufficientFunds { .. } => SafeErrorCategory::InsufficientFunds,
            StudioError::DuplicateInFlight(_) => SafeErrorCategory::DuplicateInFlight,
            StudioError::InvalidRequest(_) => SafeErrorCategory::InvalidRequest,
            StudioError::Transient(_) => SafeErrorCategory::Transient,
            StudioError::Terminal(_) => SafeErrorCategory::Terminal,
            StudioError::LeaseLost { .. } => SafeErrorCategory::LeaseLost,
            StudioError::CircuitOpen { .. } => SafeErrorCategory::CircuitOpen,
            StudioError::AssetUnavailable(_) => SafeErrorCategory::AssetUnavailable,
            StudioError::SignatureInvalid => SafeErrorCategory::SignatureInvalid,
            StudioError::Conflict => SafeErrorCategory::Conflict,
            StudioError::NotFound(_) => SafeErrorCategory::NotFound,
            StudioError::Other(_) => SafeErrorCategory::Other,
        }
    }
}

pub type StudioResult<T> = Result<T, StudioError>;

/// Outcome of a batch/sweep-style operation (reclaim, DLQ reprocess, refund
/// retry, reconciliation pass) — every background loop in this crate returns
/// one of these so callers have something concrete to log or export as a
/// metric, instead of a bare unit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn record_success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self) {
        self.attempted += 1;
        self.failed += 1;
    }

    pub fn merge(mut self, other: BatchOutcome) -> Self {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable_terminal_is_not() {
        assert!(StudioError::Transient("timeout".into()).is_retryable());
        assert!(!StudioError::Terminal("policy violation".into()).is_retryable());
    }

    #[test]
    fn client_visible_kinds_match_spec() {
        assert!(StudioError::InsufficientFunds {
            available: 0,
            requested: 1
        }
        .is_client_visible());
        assert!(!StudioError::LeaseLost {
            job_id: uuid::Uuid::nil()
        }
        .is_client_visible());
        assert!(!StudioError::CircuitOpen {
            provider_key: "p".into()
        }
        .is_client_visible());
    }

    #[test]
    fn batch_outcome_merges() {
        let mut a = BatchOutcome::default();
        a.record_success();
        a.record_failure();
        let mut b = BatchOutcome::default();
        b.record_success();
        let merged = a.merge(b);
        assert_eq!(merged.attempted, 3);
        assert_eq!(merged.succeeded, 2);
        assert_eq!(merged.failed, 1);
    }
}
