//! Accrual sweep.
//!
//! The eager execution mode: a periodic pass that recomputes every active
//! position, settles payouts whose boundary has passed, and completes
//! positions whose term has ended. Per-position failures are logged and
//! retried on the next tick; the settlement idempotency keys make those
//! retries safe.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

use super::accrual;
use super::ledger::PositionLedger;
use super::model::PositionStatus;
use super::settlement::PayoutOutcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub payouts_settled: usize,
    pub completed: usize,
    pub failures: usize,
}

/// One full pass over the active book.
pub async fn run_sweep(ledger: &PositionLedger, as_of: chrono::DateTime<Utc>) -> SweepStats {
    let mut stats = SweepStats::default();

    let ids = match ledger.active_position_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "sweep could not list active positions");
            stats.failures += 1;
            return stats;
        }
    };

    for id in ids {
        stats.scanned += 1;

        let pos = match ledger.recompute_at(&id, as_of).await {
            Ok(pos) => pos,
            Err(e) => {
                warn!(position_id = %id, error = %e, "sweep recompute failed");
                stats.failures += 1;
                continue;
            }
        };
        if !pos.is_active() {
            continue;
        }

        if accrual::completion_due(&pos, as_of) {
            match ledger
                .transition(&id, PositionStatus::Completed, "system:sweep", None)
                .await
            {
                Ok(_) => stats.completed += 1,
                Err(e) => {
                    warn!(position_id = %id, error = %e, "sweep completion failed");
                    stats.failures += 1;
                }
            }
            continue;
        }

        let due = pos.next_payout_at.map(|t| t <= as_of).unwrap_or(false);
        if due {
            match ledger.settle_due_payout(&id, as_of).await {
                Ok(PayoutOutcome::Settled { .. }) => stats.payouts_settled += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(position_id = %id, error = %e, "sweep payout failed");
                    stats.failures += 1;
                }
            }
        }
    }

    stats
}

/// Spawn the sweep loop. The first tick fires after one full period.
pub fn spawn_accrual_sweep(ledger: Arc<PositionLedger>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await; // consume the immediate tick
        loop {
            ticker.tick().await;
            let stats = run_sweep(&ledger, Utc::now()).await;
            if stats != SweepStats::default() {
                info!(
                    scanned = stats.scanned,
                    payouts = stats.payouts_settled,
                    completed = stats.completed,
                    failures = stats.failures,
                    "accrual sweep finished"
                );
            }
        }
    })
}
