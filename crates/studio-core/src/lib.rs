//! # Studio Core
//!
//! Coordination layer for the video-generation orchestration service: a
//! leased job queue, a credit ledger with reservation/commit/refund
//! semantics, a per-provider circuit breaker, and the orchestrator that
//! sequences them behind submit/status/cancel/result.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator.submit()
//!     │
//!     ├─► RequestIdempotency.acquire()   (dedupe on user + canonical request)
//!     ├─► CreditLedger.reserve()          (hold funds before work starts)
//!     └─► JobStore.enqueue()              (durable, queued)
//!
//! Worker.run() loop
//!     │
//!     ├─► JobStore.lease_next(filter)     (skip providers with an open circuit)
//!     ├─► ProviderCircuitRegistry.gate()  (closed / open / single half-open trial)
//!     ├─► ProviderAdapter.start/poll/cancel
//!     ├─► AssetStore.put()  ─► CreditLedger.commit()  ─► JobStore.succeed()
//!     └─► CreditLedger.refund()  ─► JobStore.fail(NonRetryable)
//!
//! Sweeper.run()       reclaims expired leases on its own interval
//! studio-reprocessor  drains the DLQ, retries failed refunds, reconciles ledger totals
//! ```
//!
//! ## Key invariants
//!
//! 1. A job is leased by exactly one worker at a time; the lease is a
//!    conditional write keyed on `(state, holder)`.
//! 2. A reservation is held before a job is enqueued and is always
//!    resolved exactly once, by commit or refund.
//! 3. The provider circuit has a single authoritative gate; status reads
//!    used for lease filtering must never themselves acquire the
//!    half-open trial.
//! 4. Asset bytes are durable before the reservation is committed;
//!    the reservation is committed before the job is marked succeeded.
//!
//! ## What This Is Not
//!
//! This crate is **not**:
//! - A general event-sourcing framework
//! - A saga engine or workflow DSL
//! - A payment processor (it ledgers credits; it does not move money)
//!
//! It **is** a policy-light set of interfaces and in-process drivers for
//! job leasing, credit accounting, and provider circuit-breaking, with
//! Postgres-backed and filesystem-backed implementations living in
//! sibling crates.

pub mod asset;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod ids;
pub mod job;
pub mod ledger;
pub mod orchestrator;
pub mod provider;
pub mod sweeper;
pub mod worker;

// Testing utilities (in-memory fakes) live in the separate studio-testing crate.

pub use asset::{Asset, AssetKind, AssetStore, ContentAccess, ContentTokenPayload, VerifiedToken};
pub use circuit::{Allow, CircuitConfig, CircuitState, Outcome, ProviderCircuitRegistry};
pub use clock::{Clock, SystemClock};
pub use config::StudioConfig;
pub use error::{BatchOutcome, Categorizable, SafeErrorCategory, StudioError, StudioResult};
pub use idempotency::{derive_key, AcquireOutcome, IdempotencyRecord, RequestIdempotency};
pub use ids::{IdGen, UuidGen};
pub use job::{backoff_duration, DlqEntry, FailureKind, Job, JobState, JobStore, Lease, LeaseFilter};
pub use ledger::{BalanceRow, CreditLedger, RefundFailure, ReservationEntry, ReservationStatus};
pub use orchestrator::{
    as_client_error, GenerationRequest, Orchestrator, ResultResponse, StatusResponse, SubmitResponse, VisibleState,
};
pub use provider::{ProviderAdapter, ProviderOutcome, ProviderRegistry};
pub use sweeper::Sweeper;
pub use worker::{Worker, WorkerHandle};

pub use async_trait::async_trait;
