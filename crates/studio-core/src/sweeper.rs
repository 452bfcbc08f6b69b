//! Reclaims leased jobs whose heartbeat expired (spec §4.6). The only
//! component, besides a worker's own terminal transitions, allowed to
//! remove stale leases.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::BatchOutcome;
use crate::job::JobStore;

pub struct Sweeper {
    job_store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    max_per_run: usize,
}

impl Sweeper {
    pub fn new(job_store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, interval: Duration, max_per_run: usize) -> Self {
        Self {
            job_store,
            clock,
            interval,
            max_per_run,
        }
    }

    /// Run one reclaim pass immediately, returning counts.
    pub async fn run_once(&self) -> BatchOutcome {
        match self.job_store.reclaim_expired(self.clock.now(), self.max_per_run).await {
            Ok(outcome) => {
                if outcome.attempted > 0 {
                    info!(reclaimed = outcome.attempted, "sweeper reclaimed expired leases");
                }
                outcome
            }
            Err(err) => {
                warn!(error = %err, "sweeper pass failed");
                BatchOutcome::default()
            }
        }
    }

    /// Loop at `interval` until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
