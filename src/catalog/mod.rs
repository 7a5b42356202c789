//! Catalog: read-only reference data for plans and master traders.
//!
//! The engine consumes terms and trader performance snapshots; it never
//! writes them. Admin CRUD for these entities lives outside this core.

mod sqlite;

pub use sqlite::SqliteCatalog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Fixed-term plan terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTerms {
    pub id: String,
    pub name: String,
    pub roi_percent: f64,
    pub duration_months: u32,
    pub min_amount: f64,
    pub max_amount: f64,
    pub currency: String,
    pub active: bool,
}

/// Copy-trading master terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderTerms {
    pub id: String,
    pub display_name: String,
    pub min_amount: f64,
    pub max_amount: f64,
    /// Mirror percentage applied when the commitment request does not name
    /// one explicitly.
    pub default_allocation_percent: f64,
    pub max_allocation_percent: f64,
    pub currency: String,
    pub active: bool,
}

/// Terms resolved for a commitment reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Terms {
    Plan(PlanTerms),
    Trader(TraderTerms),
}

impl Terms {
    pub fn min_amount(&self) -> f64 {
        match self {
            Terms::Plan(t) => t.min_amount,
            Terms::Trader(t) => t.min_amount,
        }
    }

    pub fn max_amount(&self) -> f64 {
        match self {
            Terms::Plan(t) => t.max_amount,
            Terms::Trader(t) => t.max_amount,
        }
    }

    pub fn currency(&self) -> &str {
        match self {
            Terms::Plan(t) => &t.currency,
            Terms::Trader(t) => &t.currency,
        }
    }
}

/// Last known realized-PnL snapshot of a master trader. Written by the
/// market-data collaborator; copy accrual only ever reads the latest one
/// at or before its evaluation instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderPerformance {
    pub trader_id: String,
    pub as_of: DateTime<Utc>,
    pub realized_pnl: f64,
}

/// Read seam for catalog data.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Resolve terms for a plan or master-trader reference. Inactive
    /// entries resolve as `NotFound`; they are no longer offered.
    async fn get_terms(&self, reference_id: &str) -> Result<Terms, EngineError>;

    /// Latest performance snapshot at or before `as_of`, if any.
    async fn latest_performance(
        &self,
        trader_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<TraderPerformance>, EngineError>;
}
