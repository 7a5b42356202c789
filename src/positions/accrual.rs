//! Accrual calculator.
//!
//! Pure functions of stored position fields and a timestamp. Nothing here
//! mutates state or reads clocks, so recomputing twice for the same `as_of`
//! is bit-identical, and retries and repeated reads cannot drift.

use chrono::{DateTime, Months, Utc};

use crate::catalog::TraderPerformance;

use super::model::{Position, PositionKind};

/// Hard cap on schedule search, far beyond any real product term.
const MAX_SCHEDULE_MONTHS: u32 = 1200;

/// Result of one recompute pass, ready to be persisted as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct AccrualSnapshot {
    pub accrued_profit: f64,
    pub next_payout_at: Option<DateTime<Utc>>,
    pub next_payout_amount: f64,
}

/// Accrued profit as of `as_of`.
///
/// Plan investments accrue linearly over the term and are clamped to
/// `[0, committed * roi]`. Copy positions mirror the referenced trader's
/// realized PnL through the allocation percentage and may be negative;
/// with no snapshot yet, nothing has accrued.
pub fn accrued_profit(
    pos: &Position,
    as_of: DateTime<Utc>,
    perf: Option<&TraderPerformance>,
) -> f64 {
    match &pos.kind {
        PositionKind::Plan { roi_percent, .. } => {
            let Some(ends_at) = pos.ends_at else {
                return 0.0;
            };
            let term_ms = (ends_at - pos.started_at).num_milliseconds();
            if term_ms <= 0 {
                return 0.0;
            }
            let elapsed_ms = (as_of - pos.started_at).num_milliseconds();
            let ratio = (elapsed_ms as f64 / term_ms as f64).clamp(0.0, 1.0);
            pos.committed_amount * roi_percent / 100.0 * ratio
        }
        PositionKind::Copy { allocation_percent } => match perf {
            Some(snapshot) => allocation_percent / 100.0 * snapshot.realized_pnl,
            None => 0.0,
        },
    }
}

/// First monthly payout boundary strictly after `as_of`.
///
/// Boundaries fall on calendar-month anniversaries of `started_at`; the
/// final boundary is clamped to `ends_at`. Returns `None` once
/// `as_of >= ends_at`, which signals completion eligibility. Open-ended
/// copy positions schedule monthly with no terminal boundary.
pub fn schedule_next_payout(pos: &Position, as_of: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(ends_at) = pos.ends_at {
        if as_of >= ends_at {
            return None;
        }
    }

    for k in 1..=MAX_SCHEDULE_MONTHS {
        let boundary = pos.started_at.checked_add_months(Months::new(k))?;
        if boundary > as_of {
            return match pos.ends_at {
                Some(ends_at) => Some(boundary.min(ends_at)),
                None => Some(boundary),
            };
        }
    }
    None
}

/// True once a term position has reached its end date.
pub fn completion_due(pos: &Position, as_of: DateTime<Utc>) -> bool {
    pos.ends_at.map(|e| as_of >= e).unwrap_or(false)
}

/// Profit accrued but not yet paid out, evaluated at `as_of`. Floored at
/// zero: negative copy accrual never produces a negative payout.
pub fn unpaid_accrual(
    pos: &Position,
    as_of: DateTime<Utc>,
    perf: Option<&TraderPerformance>,
) -> f64 {
    (accrued_profit(pos, as_of, perf) - pos.paid_out_profit).max(0.0)
}

/// Full recompute: accrued profit now, the next boundary, and the payout
/// amount that boundary would settle.
///
/// A stored boundary that has already passed is kept, not skipped: only
/// settlement advances the schedule, so a lapsed payout stays due until it
/// is settled (or the closure path absorbs it).
pub fn recompute(
    pos: &Position,
    as_of: DateTime<Utc>,
    perf: Option<&TraderPerformance>,
) -> AccrualSnapshot {
    let accrued = accrued_profit(pos, as_of, perf);
    let next_payout_at = match pos.next_payout_at {
        Some(boundary) if boundary <= as_of => Some(boundary),
        _ => schedule_next_payout(pos, as_of),
    };
    let next_payout_amount = match next_payout_at {
        Some(boundary) => unpaid_accrual(pos, boundary, perf),
        None => 0.0,
    };
    AccrualSnapshot {
        accrued_profit: accrued,
        next_payout_at,
        next_payout_amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positions::model::PositionStatus;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn plan_position(amount: f64, roi: f64, months: u32, started: DateTime<Utc>) -> Position {
        Position {
            id: "p-1".into(),
            owner_id: "owner-1".into(),
            reference_id: "plan-starter-12m".into(),
            kind: PositionKind::Plan {
                roi_percent: roi,
                duration_months: months,
            },
            committed_amount: amount,
            currency: "USD".into(),
            started_at: started,
            ends_at: started.checked_add_months(Months::new(months)),
            status: PositionStatus::Active,
            accrued_profit: 0.0,
            paid_out_profit: 0.0,
            next_payout_at: None,
            next_payout_amount: 0.0,
            version: 0,
            created_at: started,
            updated_at: started,
        }
    }

    fn copy_position(amount: f64, allocation: f64, started: DateTime<Utc>) -> Position {
        Position {
            id: "p-2".into(),
            owner_id: "owner-1".into(),
            reference_id: "trader-orion".into(),
            kind: PositionKind::Copy {
                allocation_percent: allocation,
            },
            committed_amount: amount,
            currency: "USD".into(),
            started_at: started,
            ends_at: None,
            status: PositionStatus::Active,
            accrued_profit: 0.0,
            paid_out_profit: 0.0,
            next_payout_at: None,
            next_payout_amount: 0.0,
            version: 0,
            created_at: started,
            updated_at: started,
        }
    }

    fn perf(pnl: f64, as_of: DateTime<Utc>) -> TraderPerformance {
        TraderPerformance {
            trader_id: "trader-orion".into(),
            as_of,
            realized_pnl: pnl,
        }
    }

    #[test]
    fn test_plan_accrual_halfway() {
        // 12% over 12 months on $2000; 2026-07-01 is ~50% through the term.
        let pos = plan_position(2000.0, 12.0, 12, at(2026, 1, 1));
        let accrued = accrued_profit(&pos, at(2026, 7, 1), None);
        assert!(
            (accrued - 120.0).abs() < 2.0,
            "expected roughly $120, got {accrued}"
        );
    }

    #[test]
    fn test_plan_accrual_monotonic() {
        let pos = plan_position(2000.0, 12.0, 12, at(2026, 1, 1));
        let mut last = f64::NEG_INFINITY;
        for month in 1..=12 {
            let accrued = accrued_profit(&pos, at(2026, month, 15), None);
            assert!(accrued >= last, "accrual regressed at month {month}");
            last = accrued;
        }
    }

    #[test]
    fn test_plan_accrual_clamped_to_term() {
        let pos = plan_position(1000.0, 10.0, 6, at(2026, 1, 1));
        assert_eq!(accrued_profit(&pos, at(2025, 12, 1), None), 0.0);
        // Years past the end date, accrual stays at the full ROI.
        assert_eq!(accrued_profit(&pos, at(2030, 1, 1), None), 100.0);
    }

    #[test]
    fn test_plan_accrual_idempotent_bitwise() {
        let pos = plan_position(2000.0, 12.0, 12, at(2026, 1, 1));
        let as_of = at(2026, 7, 13);
        let a = accrued_profit(&pos, as_of, None);
        let b = accrued_profit(&pos, as_of, None);
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn test_copy_accrual_follows_snapshot() {
        let pos = copy_position(1000.0, 10.0, at(2026, 1, 1));
        let snap = perf(2500.0, at(2026, 3, 1));
        assert_eq!(accrued_profit(&pos, at(2026, 3, 2), Some(&snap)), 250.0);
    }

    #[test]
    fn test_copy_accrual_may_go_negative() {
        let pos = copy_position(1000.0, 10.0, at(2026, 1, 1));
        let snap = perf(-800.0, at(2026, 3, 1));
        assert_eq!(accrued_profit(&pos, at(2026, 3, 2), Some(&snap)), -80.0);
    }

    #[test]
    fn test_copy_accrual_without_snapshot_is_zero() {
        let pos = copy_position(1000.0, 10.0, at(2026, 1, 1));
        assert_eq!(accrued_profit(&pos, at(2026, 3, 2), None), 0.0);
    }

    #[test]
    fn test_schedule_monthly_anniversaries() {
        let pos = plan_position(2000.0, 12.0, 12, at(2026, 1, 15));
        assert_eq!(schedule_next_payout(&pos, at(2026, 1, 15)), Some(at(2026, 2, 15)));
        assert_eq!(schedule_next_payout(&pos, at(2026, 2, 14)), Some(at(2026, 2, 15)));
        // A boundary that has just passed schedules the following month.
        assert_eq!(schedule_next_payout(&pos, at(2026, 2, 15)), Some(at(2026, 3, 15)));
    }

    #[test]
    fn test_schedule_none_at_term_end() {
        let pos = plan_position(2000.0, 12.0, 12, at(2026, 1, 1));
        assert_eq!(schedule_next_payout(&pos, at(2027, 1, 1)), None);
        assert_eq!(schedule_next_payout(&pos, at(2027, 6, 1)), None);
        assert!(completion_due(&pos, at(2027, 1, 1)));
        assert!(!completion_due(&pos, at(2026, 12, 31)));
    }

    #[test]
    fn test_schedule_open_ended_never_completes() {
        let pos = copy_position(1000.0, 10.0, at(2026, 1, 31));
        // Month-end starts roll to the shorter month's last day.
        assert_eq!(schedule_next_payout(&pos, at(2026, 2, 1)), Some(at(2026, 2, 28)));
        assert!(schedule_next_payout(&pos, at(2036, 1, 1)).is_some());
        assert!(!completion_due(&pos, at(2036, 1, 1)));
    }

    #[test]
    fn test_unpaid_accrual_floors_at_zero() {
        let mut pos = copy_position(1000.0, 10.0, at(2026, 1, 1));
        pos.paid_out_profit = 50.0;
        let snap = perf(-800.0, at(2026, 3, 1));
        assert_eq!(unpaid_accrual(&pos, at(2026, 3, 2), Some(&snap)), 0.0);
    }

    #[test]
    fn test_recompute_keeps_lapsed_boundary_until_settled() {
        let mut pos = plan_position(2000.0, 12.0, 12, at(2026, 1, 1));
        pos.next_payout_at = Some(at(2026, 2, 1));
        // Three weeks past the boundary with no settlement: the boundary
        // stays due instead of rolling forward.
        let snap = recompute(&pos, at(2026, 2, 21), None);
        assert_eq!(snap.next_payout_at, Some(at(2026, 2, 1)));
        assert!(snap.next_payout_amount > 0.0);
    }

    #[test]
    fn test_recompute_reports_boundary_amount() {
        let pos = plan_position(2000.0, 12.0, 12, at(2026, 1, 1));
        let snap = recompute(&pos, at(2026, 1, 10), None);
        assert_eq!(snap.next_payout_at, Some(at(2026, 2, 1)));
        // One month of a 12-month 12% term on $2000 is about $20.
        assert!((snap.next_payout_amount - 20.0).abs() < 0.5);
        let again = recompute(&pos, at(2026, 1, 10), None);
        assert_eq!(snap, again);
    }
}
