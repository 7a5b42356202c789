//! Engine error taxonomy.
//!
//! Every fallible engine operation returns one of these variants so callers
//! (HTTP layer, sweep, tests) can react to the specific failure class.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Request rejected before any ledger mutation (amount out of catalog
    /// range, malformed fields, whitelist violation).
    #[error("validation: {0}")]
    Validation(String),

    /// Wallet debit failed because the available balance cannot cover it.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Illegal status change (terminal states are absorbing).
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Position, catalog entry, or wallet missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic version check lost; retried internally up to a bound
    /// before being surfaced.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Persistence or other unexpected failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Internal(anyhow::Error::new(err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(anyhow::Error::new(err))
    }
}

impl EngineError {
    /// True for failures the caller may retry (sweep re-runs, conflict
    /// retry loops). Validation-class errors are deterministic and final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConcurrencyConflict(_) | EngineError::Internal(_)
        )
    }
}
