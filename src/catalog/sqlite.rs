use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::errors::EngineError;
use crate::store::{ts_from_sql, ts_to_sql, Db};

use super::{CatalogStore, PlanTerms, TraderPerformance, TraderTerms, Terms};

/// Catalog reads backed by the engine database.
#[derive(Clone)]
pub struct SqliteCatalog {
    db: Db,
}

impl SqliteCatalog {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a plan row. Used by seeding and tests; production catalog
    /// writes happen outside this core.
    pub async fn upsert_plan(&self, plan: &PlanTerms) -> Result<(), EngineError> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO plans (id, name, roi_percent, duration_months, min_amount, max_amount, currency, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                roi_percent = excluded.roi_percent,
                duration_months = excluded.duration_months,
                min_amount = excluded.min_amount,
                max_amount = excluded.max_amount,
                currency = excluded.currency,
                active = excluded.active",
            params![
                &plan.id,
                &plan.name,
                plan.roi_percent,
                plan.duration_months,
                plan.min_amount,
                plan.max_amount,
                &plan.currency,
                plan.active as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn upsert_trader(&self, trader: &TraderTerms) -> Result<(), EngineError> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO master_traders (id, display_name, min_amount, max_amount, default_allocation_percent, max_allocation_percent, currency, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                min_amount = excluded.min_amount,
                max_amount = excluded.max_amount,
                default_allocation_percent = excluded.default_allocation_percent,
                max_allocation_percent = excluded.max_allocation_percent,
                currency = excluded.currency,
                active = excluded.active",
            params![
                &trader.id,
                &trader.display_name,
                trader.min_amount,
                trader.max_amount,
                trader.default_allocation_percent,
                trader.max_allocation_percent,
                &trader.currency,
                trader.active as i64,
            ],
        )?;
        Ok(())
    }

    /// Record a realized-PnL snapshot for a master trader.
    pub async fn record_performance(&self, perf: &TraderPerformance) -> Result<(), EngineError> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO trader_performance (trader_id, as_of, realized_pnl)
             VALUES (?1, ?2, ?3)",
            params![&perf.trader_id, ts_to_sql(perf.as_of), perf.realized_pnl],
        )?;
        Ok(())
    }

    /// Seed a small demo catalog for local development.
    pub async fn seed_demo(&self) -> Result<(), EngineError> {
        self.upsert_plan(&PlanTerms {
            id: "plan-starter-12m".to_string(),
            name: "Starter 12M".to_string(),
            roi_percent: 12.0,
            duration_months: 12,
            min_amount: 500.0,
            max_amount: 50_000.0,
            currency: "USD".to_string(),
            active: true,
        })
        .await?;
        self.upsert_plan(&PlanTerms {
            id: "plan-growth-6m".to_string(),
            name: "Growth 6M".to_string(),
            roi_percent: 7.5,
            duration_months: 6,
            min_amount: 1_000.0,
            max_amount: 100_000.0,
            currency: "USD".to_string(),
            active: true,
        })
        .await?;
        self.upsert_trader(&TraderTerms {
            id: "trader-orion".to_string(),
            display_name: "Orion Capital".to_string(),
            min_amount: 250.0,
            max_amount: 25_000.0,
            default_allocation_percent: 5.0,
            max_allocation_percent: 20.0,
            currency: "USD".to_string(),
            active: true,
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    async fn get_terms(&self, reference_id: &str) -> Result<Terms, EngineError> {
        let conn = self.db.lock().await;

        let plan = conn
            .query_row(
                "SELECT id, name, roi_percent, duration_months, min_amount, max_amount, currency, active
                 FROM plans WHERE id = ?1",
                [reference_id],
                |row| {
                    Ok(PlanTerms {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        roi_percent: row.get(2)?,
                        duration_months: row.get(3)?,
                        min_amount: row.get(4)?,
                        max_amount: row.get(5)?,
                        currency: row.get(6)?,
                        active: row.get::<_, i64>(7)? == 1,
                    })
                },
            )
            .optional()?;

        if let Some(plan) = plan {
            if !plan.active {
                return Err(EngineError::NotFound(format!(
                    "plan {} is no longer offered",
                    reference_id
                )));
            }
            return Ok(Terms::Plan(plan));
        }

        let trader = conn
            .query_row(
                "SELECT id, display_name, min_amount, max_amount, default_allocation_percent, max_allocation_percent, currency, active
                 FROM master_traders WHERE id = ?1",
                [reference_id],
                |row| {
                    Ok(TraderTerms {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        min_amount: row.get(2)?,
                        max_amount: row.get(3)?,
                        default_allocation_percent: row.get(4)?,
                        max_allocation_percent: row.get(5)?,
                        currency: row.get(6)?,
                        active: row.get::<_, i64>(7)? == 1,
                    })
                },
            )
            .optional()?;

        match trader {
            Some(trader) if trader.active => Ok(Terms::Trader(trader)),
            Some(_) => Err(EngineError::NotFound(format!(
                "trader {} is no longer offered",
                reference_id
            ))),
            None => Err(EngineError::NotFound(format!(
                "unknown plan or trader: {}",
                reference_id
            ))),
        }
    }

    async fn latest_performance(
        &self,
        trader_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<TraderPerformance>, EngineError> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                "SELECT trader_id, as_of, realized_pnl FROM trader_performance
                 WHERE trader_id = ?1 AND as_of <= ?2
                 ORDER BY as_of DESC LIMIT 1",
                params![trader_id, ts_to_sql(as_of)],
                |row| {
                    let as_of_raw: String = row.get(1)?;
                    Ok(TraderPerformance {
                        trader_id: row.get(0)?,
                        as_of: ts_from_sql(1, &as_of_raw)?,
                        realized_pnl: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}
