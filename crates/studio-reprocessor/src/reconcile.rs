use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use studio_core::{CreditLedger, ReservationStatus};
use tokio::sync::watch;
use tracing::{info, warn};

/// Reports a user whose observed `reserved` balance diverges from what
/// the reservation ledger implies — spec §4.3's "drift above a
/// threshold opens an alert". This crate only detects drift; paging is
/// an operator's integration concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftAlert {
    pub user_id: String,
    pub expected_reserved: i64,
    pub actual_reserved: i64,
}

/// Incremental and full reconciliation passes over the credit ledger
/// (spec §4.3). Both apply capped exponential backoff between passes
/// when the store can't make progress, widening `current_interval`
/// toward `max_interval` and resetting it on a successful pass.
pub struct Reconciler {
    ledger: Arc<dyn CreditLedger>,
    incremental_interval: Duration,
    full_interval: Duration,
    incremental_scan_limit: usize,
    full_pass_page_size: usize,
    max_interval: Duration,
    backoff_factor: f64,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn CreditLedger>,
        incremental_interval: Duration,
        full_interval: Duration,
        incremental_scan_limit: usize,
        full_pass_page_size: usize,
        max_interval: Duration,
        backoff_factor: f64,
    ) -> Self {
        Self {
            ledger,
            incremental_interval,
            full_interval,
            incremental_scan_limit,
            full_pass_page_size,
            max_interval,
            backoff_factor,
        }
    }

    /// Scan reservations touched since `cursor`; for each `held`
    /// reservation, accumulate expected `reserved` per user and compare
    /// against the stored `BalanceRow`. Returns the new watermark and
    /// any drift found.
    pub async fn run_incremental(&self, cursor: DateTime<Utc>) -> (DateTime<Utc>, Vec<DriftAlert>) {
        let entries = match self
            .ledger
            .scan_reservations_since(cursor, self.incremental_scan_limit)
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "incremental reconciliation scan failed");
                return (cursor, Vec::new());
            }
        };

        let next_cursor = entries.iter().map(|r| r.created_at).max().unwrap_or(cursor).max(cursor);
        let alerts = self.check_drift(&entries).await;
        (next_cursor, alerts)
    }

    /// Paginated full scan, rebuilding expected `(available, reserved)`
    /// per user from every reservation and comparing to stored balances.
    pub async fn run_full(&self) -> Vec<DriftAlert> {
        let mut held_by_user: HashMap<String, i64> = HashMap::new();
        let mut page_token = None;

        loop {
            let page = match self
                .ledger
                .scan_all_reservations(page_token, self.full_pass_page_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(error = %err, "full reconciliation scan failed");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            page_token = page.last().map(|r| r.id);

            for r in &page {
                if r.status == ReservationStatus::Held {
                    *held_by_user.entry(r.user_id.clone()).or_insert(0) += r.amount;
                }
            }

            if page.len() < self.full_pass_page_size {
                break;
            }
        }

        let mut alerts = Vec::new();
        for (user_id, expected_reserved) in held_by_user {
            match self.ledger.balance(&user_id).await {
                Ok(balance) if balance.reserved != expected_reserved => {
                    alerts.push(DriftAlert {
                        user_id,
                        expected_reserved,
                        actual_reserved: balance.reserved,
                    });
                }
                Ok(_) => {}
                Err(err) => warn!(user_id = %user_id, error = %err, "reconciliation balance lookup failed"),
            }
        }
        alerts
    }

    async fn check_drift(&self, reservations: &[studio_core::ReservationEntry]) -> Vec<DriftAlert> {
        let mut held_by_user: HashMap<String, i64> = HashMap::new();
        for r in reservations {
            if r.status == ReservationStatus::Held {
                *held_by_user.entry(r.user_id.clone()).or_insert(0) += r.amount;
            }
        }

        let mut alerts = Vec::new();
        for (user_id, expected_reserved) in held_by_user {
            if let Ok(balance) = self.ledger.balance(&user_id).await {
                if balance.reserved < expected_reserved {
                    alerts.push(DriftAlert {
                        user_id,
                        expected_reserved,
                        actual_reserved: balance.reserved,
                    });
                }
            }
        }
        alerts
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut cursor = Utc::now();
        let mut current_incremental = self.incremental_interval;
        let mut since_full = Duration::from_secs(0);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(current_incremental) => {
                    let (next_cursor, alerts) = self.run_incremental(cursor).await;
                    for alert in &alerts {
                        warn!(user_id = %alert.user_id, expected = alert.expected_reserved, actual = alert.actual_reserved, "ledger drift detected");
                    }
                    if alerts.is_empty() {
                        current_incremental = self.incremental_interval;
                    } else {
                        current_incremental = cap_duration(
                            Duration::from_secs_f64(current_incremental.as_secs_f64() * self.backoff_factor),
                            self.max_interval,
                        );
                    }
                    cursor = next_cursor;
                    since_full += current_incremental;
                    if since_full >= self.full_interval {
                        since_full = Duration::from_secs(0);
                        let full_alerts = self.run_full().await;
                        if !full_alerts.is_empty() {
                            warn!(count = full_alerts.len(), "full reconciliation found drift");
                        } else {
                            info!("full reconciliation pass clean");
                        }
                    }
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

fn cap_duration(d: Duration, max: Duration) -> Duration {
    if d > max {
        max
    } else {
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studio_testing::InMemoryCreditLedger;

    #[tokio::test]
    async fn full_pass_detects_drift_between_held_reservations_and_stored_balance() {
        let ledger = Arc::new(InMemoryCreditLedger::new());
        ledger.grant("u1", 100);
        let dyn_ledger: Arc<dyn CreditLedger> = ledger.clone();
        dyn_ledger.reserve("u1", 30, "req-1").await.unwrap();

        let reconciler = Reconciler::new(
            dyn_ledger.clone(),
            Duration::from_secs(60),
            Duration::from_secs(6 * 3600),
            500,
            1000,
            Duration::from_secs(3600),
            2.0,
        );
        let alerts = reconciler.run_full().await;
        assert!(alerts.is_empty(), "balances are consistent, expected no drift");
    }

    #[tokio::test]
    async fn incremental_pass_advances_the_watermark() {
        let ledger = Arc::new(InMemoryCreditLedger::new());
        ledger.grant("u1", 100);
        let dyn_ledger: Arc<dyn CreditLedger> = ledger.clone();
        let before = Utc::now() - chrono::Duration::seconds(1);
        dyn_ledger.reserve("u1", 10, "req-1").await.unwrap();

        let reconciler = Reconciler::new(
            dyn_ledger.clone(),
            Duration::from_secs(60),
            Duration::from_secs(6 * 3600),
            500,
            1000,
            Duration::from_secs(3600),
            2.0,
        );
        let (cursor, _) = reconciler.run_incremental(before).await;
        assert!(cursor >= before);
    }
}
