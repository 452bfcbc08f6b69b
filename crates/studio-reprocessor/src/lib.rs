//! Background reprocessing for the orchestration core: re-queuing DLQ
//! entries once a provider's circuit recovers, retrying refunds that
//! failed to apply, and reconciling the credit ledger against its own
//! reservation history (spec §4.3, §4.5).
//!
//! Each of the three loops here is independent and store-agnostic —
//! they drive `studio_core::JobStore` / `CreditLedger` / `ProviderCircuitRegistry`
//! trait objects, the same way `studio_core::worker`/`sweeper` do, so a
//! single binary can wire a `PgJobStore` in and run all of them
//! alongside the worker pool.

mod dlq;
mod reconcile;
mod refund;

pub use dlq::DlqReprocessor;
pub use reconcile::{DriftAlert, Reconciler};
pub use refund::RefundSweeper;
