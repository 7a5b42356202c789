//! End-to-end engine scenarios over a real SQLite database.

use std::sync::Arc;

use chrono::{Duration, Months, Utc};
use tempfile::TempDir;

use alphavest_backend::audit::AuditNotifier;
use alphavest_backend::catalog::{PlanTerms, SqliteCatalog, TraderPerformance, TraderTerms};
use alphavest_backend::errors::EngineError;
use alphavest_backend::positions::settlement::settle_payout_tx;
use alphavest_backend::positions::{
    run_sweep, AdminOverride, CreatePosition, PayoutOutcome, PositionLedger, PositionStatus,
};
use alphavest_backend::store::Db;
use alphavest_backend::wallet::WalletStore;

const OWNER: &str = "owner-1";
const DEPOSIT: f64 = 5000.0;

struct Harness {
    _tmp: TempDir,
    db: Db,
    catalog: SqliteCatalog,
    ledger: Arc<PositionLedger>,
    wallets: Arc<WalletStore>,
}

async fn harness() -> Harness {
    let tmp = TempDir::new().expect("temp dir");
    let path = tmp.path().join("engine.db");
    let db = Db::new(path.to_str().expect("utf8 path")).expect("open db");

    let catalog = SqliteCatalog::new(db.clone());
    catalog
        .upsert_plan(&PlanTerms {
            id: "plan-starter-12m".into(),
            name: "Starter 12M".into(),
            roi_percent: 12.0,
            duration_months: 12,
            min_amount: 500.0,
            max_amount: 50_000.0,
            currency: "USD".into(),
            active: true,
        })
        .await
        .expect("seed plan");
    catalog
        .upsert_plan(&PlanTerms {
            id: "plan-growth-6m".into(),
            name: "Growth 6M".into(),
            roi_percent: 7.5,
            duration_months: 6,
            min_amount: 1_000.0,
            max_amount: 100_000.0,
            currency: "USD".into(),
            active: true,
        })
        .await
        .expect("seed plan");
    catalog
        .upsert_trader(&TraderTerms {
            id: "trader-orion".into(),
            display_name: "Orion Capital".into(),
            min_amount: 250.0,
            max_amount: 25_000.0,
            default_allocation_percent: 5.0,
            max_allocation_percent: 20.0,
            currency: "USD".into(),
            active: true,
        })
        .await
        .expect("seed trader");

    let ledger = Arc::new(PositionLedger::new(
        db.clone(),
        Arc::new(catalog.clone()),
        AuditNotifier::default(),
    ));
    let wallets = Arc::new(WalletStore::new(db.clone()));
    wallets
        .credit(OWNER, DEPOSIT, "USD", "deposit:seed")
        .await
        .expect("seed deposit");

    Harness {
        _tmp: tmp,
        db,
        catalog,
        ledger,
        wallets,
    }
}

fn plan_request(amount: f64) -> CreatePosition {
    CreatePosition {
        owner_id: OWNER.into(),
        kind: "plan-investment".into(),
        reference_id: "plan-starter-12m".into(),
        amount,
        allocation_percent: None,
    }
}

fn copy_request(amount: f64, allocation: f64) -> CreatePosition {
    CreatePosition {
        owner_id: OWNER.into(),
        kind: "copy-trade".into(),
        reference_id: "trader-orion".into(),
        amount,
        allocation_percent: Some(allocation),
    }
}

// Scenario A: 12% over 12 months on $2000 accrues about $120 halfway in.
#[tokio::test]
async fn test_plan_accrual_at_half_term() {
    let h = harness().await;
    let pos = h.ledger.create(plan_request(2000.0)).await.unwrap();

    let halfway = pos.started_at.checked_add_months(Months::new(6)).unwrap();
    let refreshed = h.ledger.recompute_at(&pos.id, halfway).await.unwrap();
    assert!(
        (refreshed.accrued_profit - 120.0).abs() < 3.0,
        "expected roughly $120 accrued, got {}",
        refreshed.accrued_profit
    );
}

// Scenario B: an amount below the plan minimum is rejected before any debit.
#[tokio::test]
async fn test_below_minimum_leaves_wallet_untouched() {
    let h = harness().await;
    let err = h.ledger.create(plan_request(100.0)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(err.to_string().contains("below the minimum"));

    assert_eq!(h.wallets.get_balance(OWNER).await.unwrap(), DEPOSIT);
    assert_eq!(
        h.wallets.cumulative_position_debits(OWNER).await.unwrap(),
        0.0
    );
}

// Scenario C: concurrent commitments cannot overdraw the wallet.
#[tokio::test]
async fn test_concurrent_creates_cannot_overdraw() {
    let h = harness().await;
    // Two $3000 commitments against a $5000 balance.
    let (a, b) = tokio::join!(
        h.ledger.create(plan_request(3000.0)),
        h.ledger.create(plan_request(3000.0)),
    );

    let outcomes = [a, b];
    let succeeded = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1, "exactly one commitment must win");
    let failed = outcomes
        .iter()
        .filter(|r| matches!(r, Err(EngineError::InsufficientFunds(_))))
        .count();
    assert_eq!(failed, 1, "the loser fails with insufficient funds");

    let balance = h.wallets.get_balance(OWNER).await.unwrap();
    assert!(balance >= 0.0);
    assert_eq!(balance, DEPOSIT - 3000.0);
}

// Scenario D: admin cancellation settles principal plus accrual, writes an
// audit record, and the position is immutable afterwards.
#[tokio::test]
async fn test_admin_cancel_settles_and_is_terminal() {
    let h = harness().await;
    let pos = h.ledger.create(plan_request(2000.0)).await.unwrap();
    let balance_after_create = h.wallets.get_balance(OWNER).await.unwrap();
    assert_eq!(balance_after_create, DEPOSIT - 2000.0);

    let cancelled = h
        .ledger
        .admin_update(
            &pos.id,
            AdminOverride {
                status: Some(PositionStatus::Cancelled),
                ..Default::default()
            },
            "staff-7",
        )
        .await
        .unwrap();
    assert_eq!(cancelled.status, PositionStatus::Cancelled);
    assert_eq!(cancelled.next_payout_at, None);

    // Wallet got committed + accrued back; accrual is near zero this close
    // to creation.
    let balance = h.wallets.get_balance(OWNER).await.unwrap();
    let expected = balance_after_create + 2000.0 + cancelled.accrued_profit;
    assert!((balance - expected).abs() < 1e-9);
    assert!((balance - DEPOSIT).abs() < 1.0);

    let trail = h.ledger.audit_trail(&pos.id).await.unwrap();
    let cancel_rec = trail
        .iter()
        .find(|r| r.action == "cancel")
        .expect("cancel audit record");
    assert_eq!(cancel_rec.actor, "staff-7");
    assert_eq!(cancel_rec.before_state["status"], "active");
    assert_eq!(cancel_rec.after_state["status"], "cancelled");

    // Reverting is an illegal transition.
    let err = h
        .ledger
        .admin_update(
            &pos.id,
            AdminOverride {
                status: Some(PositionStatus::Active),
                ..Default::default()
            },
            "staff-7",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    // And so is any further field edit.
    let err = h
        .ledger
        .admin_update(
            &pos.id,
            AdminOverride {
                accrued_profit: Some(999.0),
                ..Default::default()
            },
            "staff-7",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

// Scenario E: one idempotency key credits the wallet exactly once.
#[tokio::test]
async fn test_payout_idempotency_key_credits_once() {
    let h = harness().await;
    let pos = h.ledger.create(plan_request(2000.0)).await.unwrap();
    let scheduled = pos.next_payout_at.expect("initial schedule");
    let balance_before = h.wallets.get_balance(OWNER).await.unwrap();

    let now = Utc::now();
    let first = {
        let mut conn = h.db.lock().await;
        let tx = conn.transaction().unwrap();
        let (outcome, _) = settle_payout_tx(&tx, &pos.id, 20.0, scheduled, None, now).unwrap();
        tx.commit().unwrap();
        outcome
    };
    assert_eq!(first, PayoutOutcome::Settled { amount: 20.0 });

    let second = {
        let mut conn = h.db.lock().await;
        let tx = conn.transaction().unwrap();
        let (outcome, _) = settle_payout_tx(&tx, &pos.id, 20.0, scheduled, None, now).unwrap();
        tx.commit().unwrap();
        outcome
    };
    assert_eq!(second, PayoutOutcome::AlreadySettled);

    let balance = h.wallets.get_balance(OWNER).await.unwrap();
    assert!((balance - (balance_before + 20.0)).abs() < 1e-9);
}

#[tokio::test]
async fn test_recompute_is_idempotent() {
    let h = harness().await;
    let pos = h.ledger.create(plan_request(2000.0)).await.unwrap();
    let as_of = pos.started_at + Duration::days(100);

    let first = h.ledger.recompute_at(&pos.id, as_of).await.unwrap();
    let second = h.ledger.recompute_at(&pos.id, as_of).await.unwrap();

    assert_eq!(
        first.accrued_profit.to_bits(),
        second.accrued_profit.to_bits()
    );
    assert_eq!(first.next_payout_at, second.next_payout_at);
    assert_eq!(
        first.next_payout_amount.to_bits(),
        second.next_payout_amount.to_bits()
    );
    // The second pass stored nothing new.
    assert_eq!(first.version, second.version);
    assert_eq!(first.updated_at, second.updated_at);
}

#[tokio::test]
async fn test_active_commitments_never_exceed_debits() {
    let h = harness().await;
    let p1 = h.ledger.create(plan_request(2000.0)).await.unwrap();
    let _p2 = h.ledger.create(copy_request(1000.0, 10.0)).await.unwrap();

    let active: f64 = h
        .ledger
        .list(OWNER, Some(PositionStatus::Active))
        .await
        .unwrap()
        .iter()
        .map(|p| p.committed_amount)
        .sum();
    let debits = h.wallets.cumulative_position_debits(OWNER).await.unwrap();
    assert!(active <= debits + 1e-9);

    // Cancelling shrinks the active side only; debits are history.
    h.ledger
        .transition(&p1.id, PositionStatus::Cancelled, "system:risk", None)
        .await
        .unwrap();
    let active: f64 = h
        .ledger
        .list(OWNER, Some(PositionStatus::Active))
        .await
        .unwrap()
        .iter()
        .map(|p| p.committed_amount)
        .sum();
    assert!(active <= debits + 1e-9);
    assert_eq!(active, 1000.0);
}

#[tokio::test]
async fn test_copy_accrual_and_floored_closure() {
    let h = harness().await;
    let pos = h.ledger.create(copy_request(1000.0, 10.0)).await.unwrap();

    // The master books a loss; the mirrored accrual goes negative.
    h.catalog
        .record_performance(&TraderPerformance {
            trader_id: "trader-orion".into(),
            as_of: Utc::now(),
            realized_pnl: -3000.0,
        })
        .await
        .unwrap();

    let refreshed = h.ledger.get(&pos.id).await.unwrap();
    assert!((refreshed.accrued_profit + 300.0).abs() < 1e-9);

    // Closure returns principal plus the (negative) accrual.
    let (_, credit) = h
        .ledger
        .transition(&pos.id, PositionStatus::Cancelled, "staff-7", None)
        .await
        .unwrap();
    assert!((credit - 700.0).abs() < 1e-9);

    let balance = h.wallets.get_balance(OWNER).await.unwrap();
    assert!((balance - (DEPOSIT - 1000.0 + 700.0)).abs() < 1e-9);
}

#[tokio::test]
async fn test_copy_closure_never_settles_negative() {
    let h = harness().await;
    let pos = h.ledger.create(copy_request(1000.0, 10.0)).await.unwrap();

    // A loss deeper than the principal still settles at zero, not below.
    h.catalog
        .record_performance(&TraderPerformance {
            trader_id: "trader-orion".into(),
            as_of: Utc::now(),
            realized_pnl: -20_000.0,
        })
        .await
        .unwrap();

    let (_, credit) = h
        .ledger
        .transition(&pos.id, PositionStatus::Cancelled, "staff-7", None)
        .await
        .unwrap();
    assert_eq!(credit, 0.0);

    let balance = h.wallets.get_balance(OWNER).await.unwrap();
    assert!((balance - (DEPOSIT - 1000.0)).abs() < 1e-9);
}

#[tokio::test]
async fn test_admin_override_updates_fields_with_audit() {
    let h = harness().await;
    let pos = h.ledger.create(plan_request(2000.0)).await.unwrap();

    let updated = h
        .ledger
        .admin_update(
            &pos.id,
            AdminOverride {
                accrued_profit: Some(150.0),
                next_payout_amount: Some(75.0),
                ..Default::default()
            },
            "staff-3",
        )
        .await
        .unwrap();
    assert_eq!(updated.accrued_profit, 150.0);
    assert_eq!(updated.next_payout_amount, 75.0);
    assert_eq!(updated.status, PositionStatus::Active);
    assert!(updated.version > pos.version);

    let trail = h.ledger.audit_trail(&pos.id).await.unwrap();
    let rec = trail
        .iter()
        .find(|r| r.action == "admin-override")
        .expect("override audit record");
    assert_eq!(rec.actor, "staff-3");
    assert_eq!(rec.before_state["accrued_profit"], 0.0);
    assert_eq!(rec.after_state["accrued_profit"], 150.0);
}

#[tokio::test]
async fn test_lazy_recompute_on_read() {
    let h = harness().await;
    let pos = h.ledger.create(plan_request(2000.0)).await.unwrap();
    assert_eq!(pos.accrued_profit, 0.0);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let read = h.ledger.get(&pos.id).await.unwrap();
    assert!(read.accrued_profit > 0.0, "accrual advances with time");
}

#[tokio::test]
async fn test_sweep_settles_due_payout_then_completes_term() {
    let h = harness().await;
    let pos = h
        .ledger
        .create(CreatePosition {
            owner_id: OWNER.into(),
            kind: "plan-investment".into(),
            reference_id: "plan-growth-6m".into(),
            amount: 1000.0,
            allocation_percent: None,
        })
        .await
        .unwrap();

    // First boundary has passed: the sweep settles exactly one payout.
    let stats = run_sweep(&h.ledger, pos.started_at + Duration::days(35)).await;
    assert_eq!(stats.scanned, 1);
    assert_eq!(stats.payouts_settled, 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.failures, 0);

    let mid = h.ledger.get(&pos.id).await.unwrap();
    assert!(mid.paid_out_profit > 0.0);
    assert!(mid.next_payout_at.unwrap() > pos.started_at + Duration::days(35));

    // Past the term end: the sweep completes the position and settles the
    // principal plus unpaid accrual.
    let stats = run_sweep(&h.ledger, pos.started_at + Duration::days(7 * 31)).await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failures, 0);

    let done = h.ledger.get(&pos.id).await.unwrap();
    assert_eq!(done.status, PositionStatus::Completed);
    assert_eq!(done.next_payout_at, None);

    // Settlements net out: deposit - principal + payout + closing credit.
    let balance = h.wallets.get_balance(OWNER).await.unwrap();
    assert!(
        (balance - DEPOSIT).abs() < 1.0,
        "principal and accrual round-trip through the wallet, got {}",
        balance
    );

    let trail = h.ledger.audit_trail(&pos.id).await.unwrap();
    assert!(trail.iter().any(|r| r.action == "payout"));
    assert!(trail.iter().any(|r| r.action == "complete"));
}

#[tokio::test]
async fn test_unknown_references_not_found() {
    let h = harness().await;
    let err = h
        .ledger
        .create(CreatePosition {
            owner_id: OWNER.into(),
            kind: "plan-investment".into(),
            reference_id: "plan-nope".into(),
            amount: 1000.0,
            allocation_percent: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let err = h.ledger.get("position-nope").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}
