//! Lifecycle state machine.
//!
//! `active -> completed` (term reached, final payout settled) and
//! `active -> cancelled` (admin or risk trigger) are the only legal edges;
//! terminal states are absorbing. The transition executor lives in the
//! ledger so it can run inside the settlement transaction; this module
//! owns legality and the closing-amount rule.

use crate::errors::EngineError;

use super::model::{Position, PositionStatus};

pub fn can_transition(from: PositionStatus, to: PositionStatus) -> bool {
    matches!(
        (from, to),
        (PositionStatus::Active, PositionStatus::Completed)
            | (PositionStatus::Active, PositionStatus::Cancelled)
    )
}

pub fn ensure_transition(from: PositionStatus, to: PositionStatus) -> Result<(), EngineError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition(format!(
            "{} -> {}",
            from.as_str(),
            to.as_str()
        )))
    }
}

/// Wallet credit owed when a position leaves `active`.
///
/// Principal plus whatever accrual has not been paid out yet. Negative copy
/// accrual reduces the credit but the net payout never goes below zero:
/// no negative settlement is applied to a wallet.
pub fn closing_amount(pos: &Position, final_accrued: f64) -> f64 {
    (pos.committed_amount + final_accrued - pos.paid_out_profit).max(0.0)
}
