//! Admin override gateway.
//!
//! Support staff may adjust a constrained field set: status, accrued
//! profit, and the payout schedule. Everything else (committed amount,
//! terms, dates, owner) is immutable; unknown fields are rejected at the
//! boundary. Status changes never write status directly: the ledger routes
//! them through the lifecycle state machine so settlement and audit always
//! run.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::errors::EngineError;

use super::model::{Position, PositionKind, PositionStatus};

/// The whitelisted override fields. `deny_unknown_fields` turns any attempt
/// to touch other columns into a validation failure before the engine sees
/// it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminOverride {
    pub status: Option<PositionStatus>,
    pub accrued_profit: Option<f64>,
    pub next_payout_at: Option<DateTime<Utc>>,
    pub next_payout_amount: Option<f64>,
}

impl AdminOverride {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.accrued_profit.is_none()
            && self.next_payout_at.is_none()
            && self.next_payout_amount.is_none()
    }

    pub fn touches_schedule(&self) -> bool {
        self.next_payout_at.is_some() || self.next_payout_amount.is_some()
    }
}

/// Re-validate the override against the position invariants before any
/// commit.
pub fn validate_override(
    pos: &Position,
    update: &AdminOverride,
) -> Result<(), EngineError> {
    if update.is_empty() {
        return Err(EngineError::Validation(
            "override must set at least one field".into(),
        ));
    }

    if let Some(target) = update.status {
        if update.touches_schedule() {
            // Terminal states null the schedule; setting both in one
            // request can only produce a contradictory row.
            return Err(EngineError::Validation(
                "cannot set a payout schedule in the same override as a status change".into(),
            ));
        }
        if target == PositionStatus::Active && pos.status != PositionStatus::Active {
            return Err(EngineError::InvalidTransition(format!(
                "{} -> active",
                pos.status.as_str()
            )));
        }
    } else if !pos.is_active() {
        return Err(EngineError::Validation(format!(
            "position {} is {}; terminal positions are immutable",
            pos.id,
            pos.status.as_str()
        )));
    }

    if let Some(accrued) = update.accrued_profit {
        if !accrued.is_finite() {
            return Err(EngineError::Validation(
                "accrued_profit must be a finite number".into(),
            ));
        }
        if accrued < 0.0 && matches!(pos.kind, PositionKind::Plan { .. }) {
            return Err(EngineError::Validation(
                "plan accrual cannot be negative".into(),
            ));
        }
    }

    if let Some(amount) = update.next_payout_amount {
        if !amount.is_finite() || amount < 0.0 {
            return Err(EngineError::Validation(format!(
                "next_payout_amount must be non-negative, got {}",
                amount
            )));
        }
    }

    if let Some(next_at) = update.next_payout_at {
        if next_at <= pos.started_at {
            return Err(EngineError::Validation(
                "next_payout_at must fall after the position start".into(),
            ));
        }
        if let Some(ends_at) = pos.ends_at {
            if next_at > ends_at {
                return Err(EngineError::Validation(
                    "next_payout_at cannot fall after the term end".into(),
                ));
            }
        }
    }

    Ok(())
}
