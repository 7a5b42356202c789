//! Wallet settlement.
//!
//! Applies payouts and closures to the wallet and the position inside one
//! open rusqlite transaction, so either everything lands (wallet balance,
//! transaction log row, position fields, audit record) or nothing does.
//! Idempotency keys make every settlement at-most-once under retries, and
//! a fencing re-read of the position status right before crediting resolves
//! cancellation racing an in-flight payout.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use crate::catalog::TraderPerformance;
use crate::errors::EngineError;
use crate::store::ts_to_sql;
use crate::wallet::{self, LedgerEffect};

use super::accrual;
use super::lifecycle;
use super::model::{Position, PositionStatus, POSITION_COLUMNS};

/// Outcome of a payout settlement attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PayoutOutcome {
    Settled { amount: f64 },
    /// The idempotency key was already consumed by an earlier settlement.
    AlreadySettled,
    /// The position moved to a terminal state concurrently; the payout was
    /// aborted and the closure path owns the remaining funds.
    Fenced { status: PositionStatus },
    /// No payout boundary is due.
    NothingDue,
}

/// Idempotency key for a scheduled payout: one settlement per position per
/// scheduled date, no matter how many sweeps retry it.
pub fn payout_idempotency_key(position_id: &str, scheduled_at: DateTime<Utc>) -> String {
    format!("payout:{}:{}", position_id, scheduled_at.format("%Y-%m-%d"))
}

/// Idempotency key for the one closure settlement a position can ever have.
pub fn closure_idempotency_key(position_id: &str) -> String {
    format!("closure:{}", position_id)
}

pub fn load_position_tx(tx: &Transaction<'_>, id: &str) -> Result<Position, EngineError> {
    let pos = tx
        .query_row(
            &format!("SELECT {} FROM positions WHERE id = ?1", POSITION_COLUMNS),
            [id],
            Position::from_row,
        )
        .optional()?;
    pos.ok_or_else(|| EngineError::NotFound(format!("position {}", id)))
}

pub fn insert_position_tx(tx: &Transaction<'_>, pos: &Position) -> Result<(), EngineError> {
    let (roi_percent, duration_months, allocation_percent) = match &pos.kind {
        super::model::PositionKind::Plan {
            roi_percent,
            duration_months,
        } => (Some(*roi_percent), Some(*duration_months), None),
        super::model::PositionKind::Copy { allocation_percent } => {
            (None, None, Some(*allocation_percent))
        }
    };

    tx.execute(
        "INSERT INTO positions (id, owner_id, kind, reference_id, committed_amount, currency,
             started_at, ends_at, status, accrued_profit, paid_out_profit,
             next_payout_at, next_payout_amount, roi_percent, duration_months,
             allocation_percent, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 0, ?17, ?18)",
        params![
            &pos.id,
            &pos.owner_id,
            pos.kind.as_str(),
            &pos.reference_id,
            pos.committed_amount,
            &pos.currency,
            ts_to_sql(pos.started_at),
            pos.ends_at.map(ts_to_sql),
            pos.status.as_str(),
            pos.accrued_profit,
            pos.paid_out_profit,
            pos.next_payout_at.map(ts_to_sql),
            pos.next_payout_amount,
            roi_percent,
            duration_months,
            allocation_percent,
            ts_to_sql(pos.created_at),
            ts_to_sql(pos.updated_at),
        ],
    )?;
    Ok(())
}

/// Version-checked write of the mutable lifecycle fields. The committed
/// amount, terms, and dates are immutable after creation and never appear
/// here.
pub fn write_lifecycle_state(
    tx: &Transaction<'_>,
    id: &str,
    expected_version: i64,
    status: PositionStatus,
    accrued_profit: f64,
    paid_out_profit: f64,
    next_payout_at: Option<DateTime<Utc>>,
    next_payout_amount: f64,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let changed = tx.execute(
        "UPDATE positions SET status = ?1, accrued_profit = ?2, paid_out_profit = ?3,
                next_payout_at = ?4, next_payout_amount = ?5,
                version = version + 1, updated_at = ?6
         WHERE id = ?7 AND version = ?8",
        params![
            status.as_str(),
            accrued_profit,
            paid_out_profit,
            next_payout_at.map(ts_to_sql),
            next_payout_amount,
            ts_to_sql(now),
            id,
            expected_version,
        ],
    )?;
    if changed == 0 {
        return Err(EngineError::ConcurrencyConflict(format!(
            "position {} moved past version {}",
            id, expected_version
        )));
    }
    Ok(())
}

/// Settle one scheduled payout. Credits the wallet, rolls the payout
/// schedule forward, and returns the updated position alongside the
/// outcome. Caller commits.
pub fn settle_payout_tx(
    tx: &Transaction<'_>,
    position_id: &str,
    amount: f64,
    scheduled_at: DateTime<Utc>,
    perf: Option<&TraderPerformance>,
    now: DateTime<Utc>,
) -> Result<(PayoutOutcome, Position), EngineError> {
    if amount < 0.0 || !amount.is_finite() {
        return Err(EngineError::Validation(format!(
            "payout amount must be non-negative, got {}",
            amount
        )));
    }

    // Fencing: re-read status transactionally immediately before crediting.
    let pos = load_position_tx(tx, position_id)?;
    match pos.status {
        PositionStatus::Active => {}
        status => {
            return Ok((PayoutOutcome::Fenced { status }, pos));
        }
    }

    let Some(next_boundary) = accrual::schedule_next_payout(&pos, scheduled_at) else {
        // The term ended at this boundary; completion settlement owns the
        // remaining funds.
        return Ok((PayoutOutcome::NothingDue, pos));
    };

    let key = payout_idempotency_key(position_id, scheduled_at);
    let effect = wallet::apply_credit(
        tx,
        &pos.owner_id,
        Some(&pos.id),
        amount,
        &pos.currency,
        &key,
        now,
    )?;
    if effect == LedgerEffect::AlreadyApplied {
        return Ok((PayoutOutcome::AlreadySettled, pos));
    }

    let paid_out = pos.paid_out_profit + amount;
    let accrued = accrual::accrued_profit(&pos, now, perf);
    let next_amount =
        (accrual::accrued_profit(&pos, next_boundary, perf) - paid_out).max(0.0);

    write_lifecycle_state(
        tx,
        &pos.id,
        pos.version,
        PositionStatus::Active,
        accrued,
        paid_out,
        Some(next_boundary),
        next_amount,
        now,
    )?;

    let mut updated = pos;
    updated.accrued_profit = accrued;
    updated.paid_out_profit = paid_out;
    updated.next_payout_at = Some(next_boundary);
    updated.next_payout_amount = next_amount;
    updated.version += 1;
    updated.updated_at = now;

    Ok((PayoutOutcome::Settled { amount }, updated))
}

/// Settle a closure (completion or cancellation). Credits principal plus
/// unpaid accrual and writes the terminal state. Caller appends the audit
/// record and commits.
pub fn settle_closure_tx(
    tx: &Transaction<'_>,
    position_id: &str,
    new_status: PositionStatus,
    accrued_override: Option<f64>,
    perf: Option<&TraderPerformance>,
    now: DateTime<Utc>,
) -> Result<(f64, Position, Position), EngineError> {
    let pos = load_position_tx(tx, position_id)?;
    lifecycle::ensure_transition(pos.status, new_status)?;

    let final_accrued =
        accrued_override.unwrap_or_else(|| accrual::accrued_profit(&pos, now, perf));
    let credit = lifecycle::closing_amount(&pos, final_accrued);

    let key = closure_idempotency_key(position_id);
    let effect = wallet::apply_credit(
        tx,
        &pos.owner_id,
        Some(&pos.id),
        credit,
        &pos.currency,
        &key,
        now,
    )?;
    if effect == LedgerEffect::AlreadyApplied {
        // A closure log row exists but the status is still active. Surface
        // instead of double-crediting.
        return Err(EngineError::ConcurrencyConflict(format!(
            "closure for position {} already recorded",
            position_id
        )));
    }

    // Positive accrual is settled in full by the closing credit.
    let paid_out = pos.paid_out_profit + (credit - pos.committed_amount).max(0.0);

    write_lifecycle_state(
        tx,
        &pos.id,
        pos.version,
        new_status,
        final_accrued,
        paid_out,
        None,
        0.0,
        now,
    )?;

    let before = pos.clone();
    let mut updated = pos;
    updated.status = new_status;
    updated.accrued_profit = final_accrued;
    updated.paid_out_profit = paid_out;
    updated.next_payout_at = None;
    updated.next_payout_amount = 0.0;
    updated.version += 1;
    updated.updated_at = now;

    Ok((credit, before, updated))
}
