//! Front-door API binding the subsystems for submit/status/cancel/result
//! (spec §2, §6). This is the only place that sequences
//! `RequestIdempotency -> CreditLedger.reserve -> JobStore.enqueue`;
//! every other subsystem is reachable directly by operators/tests but
//! the submit path's ordering is an invariant worth keeping in one
//! place.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::asset::{AssetStore, ContentAccess};
use crate::clock::Clock;
use crate::error::{Categorizable, StudioError, StudioResult};
use crate::idempotency::{derive_key, AcquireOutcome, RequestIdempotency};
use crate::ids::IdGen;
use crate::job::{Job, JobState, JobStore};
use crate::ledger::CreditLedger;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub user_id: String,
    pub provider_key: String,
    pub model_key: String,
    pub input_ref: String,
    pub input_fingerprint: String,
    pub cost: i64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

/// User-visible state — `Dead` collapses into `Failed` with a
/// distinguishing reason (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibleState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: VisibleState,
    pub attempts: u32,
    pub provider_key: String,
    pub error: Option<String>,
    pub result_asset_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultResponse {
    pub asset_id: Uuid,
    pub content_token: String,
    pub signed_url: Option<String>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

pub struct Orchestrator {
    job_store: Arc<dyn JobStore>,
    ledger: Arc<dyn CreditLedger>,
    idempotency: Arc<dyn RequestIdempotency>,
    ids: Arc<dyn IdGen>,
    clock: Arc<dyn Clock>,
    assets: Arc<dyn AssetStore>,
    content_access: Arc<dyn ContentAccess>,
    pending_lock_ttl: chrono::Duration,
    replay_ttl: chrono::Duration,
    content_token_ttl: chrono::Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_store: Arc<dyn JobStore>,
        ledger: Arc<dyn CreditLedger>,
        idempotency: Arc<dyn RequestIdempotency>,
        ids: Arc<dyn IdGen>,
        clock: Arc<dyn Clock>,
        assets: Arc<dyn AssetStore>,
        content_access: Arc<dyn ContentAccess>,
        pending_lock_ttl: chrono::Duration,
        replay_ttl: chrono::Duration,
        content_token_ttl: chrono::Duration,
    ) -> Self {
        Self {
            job_store,
            ledger,
            idempotency,
            ids,
            clock,
            assets,
            content_access,
            pending_lock_ttl,
            replay_ttl,
            content_token_ttl,
        }
    }

    /// `Submit` (spec §6): `RequestIdempotency.acquire -> CreditLedger.reserve
    /// -> JobStore.enqueue`.
    pub async fn submit(&self, request: GenerationRequest) -> StudioResult<SubmitResponse> {
        if request.cost <= 0 {
            return Err(StudioError::InvalidRequest("cost must be positive".into()));
        }

        let canonical = serde_json::to_string(&request).map_err(|e| StudioError::InvalidRequest(e.to_string()))?;
        let key = derive_key(&request.user_id, &canonical);

        match self.idempotency.acquire(&key, self.pending_lock_ttl).await? {
            AcquireOutcome::Busy => return Err(StudioError::DuplicateInFlight(key)),
            AcquireOutcome::Replay(response) => {
                let parsed: SubmitResponse =
                    serde_json::from_value(response).map_err(|e| StudioError::Other(e.into()))?;
                return Ok(parsed);
            }
            AcquireOutcome::Pending => {}
        }

        let reservation_id = match self.ledger.reserve(&request.user_id, request.cost, &key).await {
            Ok(id) => id,
            Err(err) => {
                let _ = self.idempotency.abort(&key).await;
                return Err(err);
            }
        };

        let job_id = self.ids.new_id();
        let job = Job::new(
            job_id,
            &request.user_id,
            &request.provider_key,
            &request.model_key,
            &request.input_fingerprint,
            &request.input_ref,
            reservation_id,
            request.max_attempts,
            self.clock.now(),
        );

        let enqueued = match self.job_store.enqueue(job).await {
            Ok(j) => j,
            Err(err) => {
                // Reservation stays held; reconciliation/refund sweeper
                // will catch a job that never got enqueued via an
                // operator-triggered refund — the spec does not define
                // an automatic compensating action here (see DESIGN.md).
                let _ = self.idempotency.abort(&key).await;
                return Err(err);
            }
        };

        let response = SubmitResponse { job_id: enqueued.id };
        let response_json = serde_json::to_value(&response).map_err(|e| StudioError::Other(e.into()))?;
        self.idempotency.commit(&key, response_json, self.replay_ttl).await?;

        Ok(response)
    }

    pub async fn status(&self, job_id: Uuid) -> StudioResult<StatusResponse> {
        let job = self
            .job_store
            .get(job_id)
            .await?
            .ok_or_else(|| StudioError::NotFound(job_id.to_string()))?;

        let state = match job.state {
            JobState::Queued => VisibleState::Queued,
            JobState::Leased | JobState::Running => VisibleState::Running,
            JobState::Succeeded => VisibleState::Succeeded,
            JobState::Failed => {
                if job.cancel_requested {
                    VisibleState::Cancelled
                } else {
                    VisibleState::Failed
                }
            }
            JobState::Dead => VisibleState::Failed,
        };

        Ok(StatusResponse {
            state,
            attempts: job.attempts,
            provider_key: job.provider_key,
            error: job.error,
            result_asset_id: job.result_asset_id,
        })
    }

    /// `Cancel` (spec §4.2, §6): sets the cooperative flag; the worker
    /// observes it on its next heartbeat/poll iteration.
    pub async fn cancel(&self, job_id: Uuid) -> StudioResult<()> {
        let job = self
            .job_store
            .get(job_id)
            .await?
            .ok_or_else(|| StudioError::NotFound(job_id.to_string()))?;
        if job.state.is_terminal() {
            return Err(StudioError::InvalidRequest("job already terminal".into()));
        }
        self.job_store.request_cancel(job_id).await
    }

    pub async fn apply_payment(&self, event_id: &str, user_id: &str, delta: i64) -> StudioResult<()> {
        self.ledger.apply_payment(event_id, user_id, delta).await
    }

    /// `Result` (spec §6): requires the job to have succeeded, then issues
    /// a fresh content token for its asset (spec §4.8). No provider in
    /// this workspace fronts a pre-signed URL, so `signed_url` stays
    /// `None` — callers that add one populate it alongside the token.
    pub async fn result(&self, job_id: Uuid) -> StudioResult<ResultResponse> {
        let job = self
            .job_store
            .get(job_id)
            .await?
            .ok_or_else(|| StudioError::NotFound(job_id.to_string()))?;

        if job.state != JobState::Succeeded {
            return Err(StudioError::InvalidRequest("job has not succeeded".into()));
        }
        let asset_id = job
            .result_asset_id
            .ok_or_else(|| StudioError::AssetUnavailable(job_id.to_string()))?;
        let asset = self
            .assets
            .get(asset_id)
            .await?
            .ok_or_else(|| StudioError::AssetUnavailable(asset_id.to_string()))?;

        let now = self.clock.now();
        let content_token = self.content_access.issue_token(asset.id, &asset.owner_id, self.content_token_ttl, now);

        Ok(ResultResponse {
            asset_id: asset.id,
            content_token,
            signed_url: None,
            expires_at: now + self.content_token_ttl,
        })
    }
}

/// Surfacing policy for worker/store errors reaching the orchestrator
/// boundary (spec §7): only the kinds flagged client-visible propagate
/// as-is, everything else collapses to a generic internal error so
/// internal retry/lease semantics never leak to callers.
pub fn as_client_error(err: StudioError) -> StudioError {
    if err.is_client_visible() {
        err
    } else {
        StudioError::Other(anyhow::anyhow!("internal error"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_visible_errors_pass_through() {
        let err = StudioError::InsufficientFunds {
            available: 0,
            requested: 10,
        };
        match as_client_error(err) {
            StudioError::InsufficientFunds { .. } => {}
            other => panic!("expected passthrough, got {other:?}"),
        }
    }

    #[test]
    fn internal_errors_are_masked() {
        let err = StudioError::LeaseLost { job_id: Uuid::nil() };
        match as_client_error(err) {
            StudioError::Other(_) => {}
            other => panic!("expected masked error, got {other:?}"),
        }
    }
}
