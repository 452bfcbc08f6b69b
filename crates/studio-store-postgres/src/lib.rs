//! PostgreSQL-backed [`JobStore`] and [`CreditLedger`].
//!
//! # Schema
//!
//! ```sql
//! CREATE TYPE job_state AS ENUM ('queued', 'leased', 'running', 'succeeded', 'failed', 'dead');
//! CREATE TYPE reservation_status AS ENUM ('held', 'committed', 'refunded', 'failed-refund');
//!
//! CREATE TABLE jobs (
//!     id UUID PRIMARY KEY,
//!     user_id TEXT NOT NULL,
//!     provider_key TEXT NOT NULL,
//!     model_key TEXT NOT NULL,
//!     input_fingerprint TEXT NOT NULL,
//!     input_ref TEXT NOT NULL,
//!     reservation_id UUID NOT NULL,
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_attempts INTEGER NOT NULL,
//!     state job_state NOT NULL DEFAULT 'queued',
//!     lease_holder TEXT,
//!     lease_expires_at TIMESTAMPTZ,
//!     last_heartbeat_at TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     visible_after TIMESTAMPTZ,
//!     provider_job_id TEXT,
//!     result_asset_id UUID,
//!     error TEXT,
//!     cancel_requested BOOLEAN NOT NULL DEFAULT FALSE
//! );
//!
//! CREATE INDEX idx_jobs_ready ON jobs (provider_key, visible_after)
//!     WHERE state = 'queued';
//! CREATE INDEX idx_jobs_lease ON jobs (lease_expires_at) WHERE state = 'leased';
//!
//! CREATE TABLE dlq_entries (
//!     job_id UUID PRIMARY KEY REFERENCES jobs(id),
//!     provider_key TEXT NOT NULL,
//!     reason TEXT NOT NULL,
//!     enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     attempts INTEGER NOT NULL,
//!     last_error TEXT NOT NULL
//! );
//!
//! CREATE TABLE balances (
//!     user_id TEXT PRIMARY KEY,
//!     available BIGINT NOT NULL DEFAULT 0,
//!     reserved BIGINT NOT NULL DEFAULT 0,
//!     version BIGINT NOT NULL DEFAULT 0
//! );
//!
//! CREATE TABLE reservations (
//!     id UUID PRIMARY KEY,
//!     user_id TEXT NOT NULL,
//!     amount BIGINT NOT NULL,
//!     job_id UUID,
//!     status reservation_status NOT NULL DEFAULT 'held',
//!     request_key TEXT NOT NULL UNIQUE,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     settled_at TIMESTAMPTZ,
//!     reason TEXT
//! );
//!
//! CREATE TABLE refund_failures (
//!     reservation_id UUID PRIMARY KEY REFERENCES reservations(id),
//!     reason TEXT NOT NULL,
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     last_attempt_at TIMESTAMPTZ
//! );
//!
//! CREATE TABLE applied_payments (
//!     payment_event_id TEXT PRIMARY KEY,
//!     user_id TEXT NOT NULL,
//!     delta BIGINT NOT NULL,
//!     applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```

mod ledger;
mod store;

pub use ledger::PgCreditLedger;
pub use store::PgJobStore;
