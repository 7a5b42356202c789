//! Position lifecycle engine.
//!
//! This module owns the full life of a capital commitment:
//! 1. Validation against catalog terms and atomic creation with the wallet
//!    debit
//! 2. Pure accrual recomputation (lazy on read, eager via the sweep)
//! 3. Lifecycle transitions gated by settlement
//! 4. At-most-once wallet settlement with fencing
//! 5. The audited admin override gateway

pub mod accrual;
pub mod admin;
pub mod ledger;
pub mod lifecycle;
pub mod locks;
pub mod model;
pub mod settlement;
pub mod sweep;

pub use accrual::{accrued_profit, completion_due, recompute, schedule_next_payout, AccrualSnapshot};
pub use admin::AdminOverride;
pub use ledger::PositionLedger;
pub use lifecycle::{can_transition, closing_amount};
pub use locks::PositionLocks;
pub use model::{
    validate_new_position, CreatePosition, Position, PositionKind, PositionStatus,
};
pub use settlement::{payout_idempotency_key, PayoutOutcome};
pub use sweep::{run_sweep, spawn_accrual_sweep, SweepStats};
