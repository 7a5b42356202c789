//! Position model.
//!
//! A Position is the envelope shared by both commitment kinds; the
//! kind-specific terms live in [`PositionKind`] so lifecycle and settlement
//! logic stay shared while accrual rules stay isolated per kind.

use chrono::{DateTime, Months, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::Terms;
use crate::errors::EngineError;
use crate::store::ts_from_sql;

pub const KIND_PLAN: &str = "plan-investment";
pub const KIND_COPY: &str = "copy-trade";

/// Kind-specific commitment terms, frozen at creation from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PositionKind {
    #[serde(rename = "plan-investment")]
    Plan { roi_percent: f64, duration_months: u32 },
    #[serde(rename = "copy-trade")]
    Copy { allocation_percent: f64 },
}

impl PositionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionKind::Plan { .. } => KIND_PLAN,
            PositionKind::Copy { .. } => KIND_COPY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Active,
    Completed,
    Cancelled,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Active => "active",
            PositionStatus::Completed => "completed",
            PositionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(PositionStatus::Active),
            "completed" => Some(PositionStatus::Completed),
            "cancelled" => Some(PositionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Completed | PositionStatus::Cancelled)
    }
}

/// A user's single capital commitment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub owner_id: String,
    pub reference_id: String,
    #[serde(flatten)]
    pub kind: PositionKind,
    pub committed_amount: f64,
    pub currency: String,
    pub started_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub status: PositionStatus,
    /// Signed for copy positions; never negative for plans.
    pub accrued_profit: f64,
    /// Profit already credited by scheduled payouts. Settlement only ever
    /// moves the unpaid remainder.
    pub paid_out_profit: f64,
    pub next_payout_at: Option<DateTime<Utc>>,
    pub next_payout_amount: f64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind_raw: String = row.get(2)?;
        let kind = match kind_raw.as_str() {
            KIND_PLAN => PositionKind::Plan {
                roi_percent: row.get::<_, Option<f64>>(13)?.unwrap_or(0.0),
                duration_months: row.get::<_, Option<u32>>(14)?.unwrap_or(0),
            },
            KIND_COPY => PositionKind::Copy {
                allocation_percent: row.get::<_, Option<f64>>(15)?.unwrap_or(0.0),
            },
            other => {
                return Err(rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    format!("unknown position kind: {}", other).into(),
                ))
            }
        };

        let status_raw: String = row.get(8)?;
        let status = PositionStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                8,
                rusqlite::types::Type::Text,
                format!("unknown position status: {}", status_raw).into(),
            )
        })?;

        let started_raw: String = row.get(6)?;
        let ends_raw: Option<String> = row.get(7)?;
        let next_payout_raw: Option<String> = row.get(11)?;
        let created_raw: String = row.get(16)?;
        let updated_raw: String = row.get(17)?;

        Ok(Position {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            kind,
            reference_id: row.get(3)?,
            committed_amount: row.get(4)?,
            currency: row.get(5)?,
            started_at: ts_from_sql(6, &started_raw)?,
            ends_at: match ends_raw {
                Some(raw) => Some(ts_from_sql(7, &raw)?),
                None => None,
            },
            status,
            accrued_profit: row.get(9)?,
            paid_out_profit: row.get(10)?,
            next_payout_at: match next_payout_raw {
                Some(raw) => Some(ts_from_sql(11, &raw)?),
                None => None,
            },
            next_payout_amount: row.get(12)?,
            version: row.get(18)?,
            created_at: ts_from_sql(16, &created_raw)?,
            updated_at: ts_from_sql(17, &updated_raw)?,
        })
    }
}

/// Column list matching [`Position::from_row`] ordinals.
pub const POSITION_COLUMNS: &str = "id, owner_id, kind, reference_id, committed_amount, currency, \
     started_at, ends_at, status, accrued_profit, paid_out_profit, \
     next_payout_at, next_payout_amount, roi_percent, duration_months, \
     allocation_percent, created_at, updated_at, version";

/// Commitment request as it arrives from the API boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePosition {
    pub owner_id: String,
    pub kind: String,
    pub reference_id: String,
    pub amount: f64,
    /// Copy positions only; falls back to the trader's catalog default.
    #[serde(default)]
    pub allocation_percent: Option<f64>,
}

/// The single typed validation step: turn a raw request plus resolved
/// catalog terms into an active Position, or reject with the violated
/// constraint. No ledger mutation happens before this succeeds.
pub fn validate_new_position(
    req: &CreatePosition,
    terms: &Terms,
    now: DateTime<Utc>,
) -> Result<Position, EngineError> {
    if req.owner_id.trim().is_empty() {
        return Err(EngineError::Validation("owner_id must not be empty".into()));
    }
    if !req.amount.is_finite() || req.amount <= 0.0 {
        return Err(EngineError::Validation(format!(
            "amount must be a positive number, got {}",
            req.amount
        )));
    }
    if req.amount < terms.min_amount() {
        return Err(EngineError::Validation(format!(
            "amount {:.2} is below the minimum {:.2}",
            req.amount,
            terms.min_amount()
        )));
    }
    if req.amount > terms.max_amount() {
        return Err(EngineError::Validation(format!(
            "amount {:.2} exceeds the maximum {:.2}",
            req.amount,
            terms.max_amount()
        )));
    }

    let (kind, ends_at) = match (req.kind.as_str(), terms) {
        (KIND_PLAN, Terms::Plan(plan)) => {
            if req.allocation_percent.is_some() {
                return Err(EngineError::Validation(
                    "allocation_percent does not apply to plan investments".into(),
                ));
            }
            let ends_at = now
                .checked_add_months(Months::new(plan.duration_months))
                .ok_or_else(|| {
                    EngineError::Validation(format!(
                        "plan duration {} months overflows the calendar",
                        plan.duration_months
                    ))
                })?;
            (
                PositionKind::Plan {
                    roi_percent: plan.roi_percent,
                    duration_months: plan.duration_months,
                },
                Some(ends_at),
            )
        }
        (KIND_COPY, Terms::Trader(trader)) => {
            let allocation = req
                .allocation_percent
                .unwrap_or(trader.default_allocation_percent);
            if !allocation.is_finite() || allocation <= 0.0 {
                return Err(EngineError::Validation(format!(
                    "allocation_percent must be positive, got {}",
                    allocation
                )));
            }
            if allocation > trader.max_allocation_percent {
                return Err(EngineError::Validation(format!(
                    "allocation_percent {:.2} exceeds the trader cap {:.2}",
                    allocation, trader.max_allocation_percent
                )));
            }
            (
                PositionKind::Copy {
                    allocation_percent: allocation,
                },
                None,
            )
        }
        (KIND_PLAN, Terms::Trader(_)) | (KIND_COPY, Terms::Plan(_)) => {
            return Err(EngineError::Validation(format!(
                "kind {} does not match reference {}",
                req.kind, req.reference_id
            )))
        }
        (other, _) => {
            return Err(EngineError::Validation(format!(
                "unknown position kind: {}",
                other
            )))
        }
    };

    Ok(Position {
        id: Uuid::new_v4().to_string(),
        owner_id: req.owner_id.trim().to_string(),
        reference_id: req.reference_id.clone(),
        kind,
        committed_amount: req.amount,
        currency: terms.currency().to_string(),
        started_at: now,
        ends_at,
        status: PositionStatus::Active,
        accrued_profit: 0.0,
        paid_out_profit: 0.0,
        next_payout_at: None, // filled from the initial schedule by the ledger
        next_payout_amount: 0.0,
        version: 0,
        created_at: now,
        updated_at: now,
    })
}
