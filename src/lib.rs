//! AlphaVest Backend Library
//!
//! The financial position lifecycle engine: commitments over catalog plans
//! and copy-trading allocations, accrual recomputation, scheduled payouts,
//! and atomic wallet settlement. Exposed for the service binary and tests.

pub mod api;
pub mod audit;
pub mod catalog;
pub mod errors;
pub mod models;
pub mod positions;
pub mod store;
pub mod wallet;
