//! Position ledger.
//!
//! The authoritative service over Position records: creation (validate,
//! debit, insert atomically), reads with lazy recompute, lifecycle
//! transitions through the settlement path, scheduled payout settlement,
//! and the admin override gateway. All mutations of one position are
//! serialized through the per-position lock registry; conflicts from the
//! optimistic version checks are retried a bounded number of times.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde_json::Value;
use tracing::{info, warn};

use crate::audit::{self, AuditNotifier, AuditRecord};
use crate::catalog::{CatalogStore, TraderPerformance};
use crate::errors::EngineError;
use crate::store::Db;
use crate::wallet;

use super::accrual::{self, AccrualSnapshot};
use super::admin::{self, AdminOverride};
use super::lifecycle;
use super::locks::PositionLocks;
use super::model::{
    validate_new_position, CreatePosition, Position, PositionStatus, POSITION_COLUMNS,
};
use super::settlement::{self, PayoutOutcome};

/// Bounded internal retries for lost optimistic version checks.
const MAX_CONFLICT_RETRIES: u32 = 3;

pub struct PositionLedger {
    db: Db,
    catalog: Arc<dyn CatalogStore>,
    locks: PositionLocks,
    notifier: AuditNotifier,
}

impl PositionLedger {
    pub fn new(db: Db, catalog: Arc<dyn CatalogStore>, notifier: AuditNotifier) -> Self {
        Self {
            db,
            catalog,
            locks: PositionLocks::new(),
            notifier,
        }
    }

    pub fn audit_events(&self) -> tokio::sync::broadcast::Receiver<AuditRecord> {
        self.notifier.subscribe()
    }

    /// Create a position: resolve terms, run the typed validation step,
    /// then debit the wallet and insert the row in one transaction. No
    /// ledger mutation happens if validation fails; nothing is partially
    /// committed if the debit fails.
    pub async fn create(&self, req: CreatePosition) -> Result<Position, EngineError> {
        let terms = self.catalog.get_terms(&req.reference_id).await?;
        let now = Utc::now();
        let mut pos = validate_new_position(&req, &terms, now)?;

        let perf = self.perf_for(&pos, now).await?;
        let snap = accrual::recompute(&pos, now, perf.as_ref());
        pos.accrued_profit = snap.accrued_profit;
        pos.next_payout_at = snap.next_payout_at;
        pos.next_payout_amount = snap.next_payout_amount;

        let rec = {
            let mut conn = self.db.lock().await;
            let tx = conn.transaction()?;
            wallet::apply_debit(
                &tx,
                &pos.owner_id,
                Some(&pos.id),
                pos.committed_amount,
                &format!("commit:{}", pos.id),
                now,
            )?;
            settlement::insert_position_tx(&tx, &pos)?;
            let rec = AuditRecord::new(
                &pos.id,
                &pos.owner_id,
                "create",
                now,
                Value::Null,
                serde_json::to_value(&pos)?,
            );
            audit::append_tx(&tx, &rec)?;
            tx.commit()?;
            rec
        };
        self.notifier.publish(rec);

        info!(
            position_id = %pos.id,
            owner_id = %pos.owner_id,
            kind = pos.kind.as_str(),
            amount = pos.committed_amount,
            "position created"
        );
        Ok(pos)
    }

    /// Read a position. Active positions get the lazy recompute against the
    /// stored snapshot; terminal positions are returned as stored.
    pub async fn get(&self, id: &str) -> Result<Position, EngineError> {
        let pos = self.load(id).await?;
        if !pos.is_active() {
            return Ok(pos);
        }
        self.recompute_at(id, Utc::now()).await
    }

    pub async fn list(
        &self,
        owner_id: &str,
        status: Option<PositionStatus>,
    ) -> Result<Vec<Position>, EngineError> {
        let conn = self.db.lock().await;
        let mut out = Vec::new();

        if let Some(status) = status {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM positions WHERE owner_id = ?1 AND status = ?2 ORDER BY created_at ASC",
                POSITION_COLUMNS
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![owner_id, status.as_str()],
                Position::from_row,
            )?;
            for row in rows {
                out.push(row?);
            }
        } else {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM positions WHERE owner_id = ?1 ORDER BY created_at ASC",
                POSITION_COLUMNS
            ))?;
            let rows = stmt.query_map([owner_id], Position::from_row)?;
            for row in rows {
                out.push(row?);
            }
        }

        Ok(out)
    }

    /// Recompute accrual and the payout schedule as of `as_of`, persisting
    /// only when the stored snapshot actually changed. Terminal positions
    /// are untouched. Idempotent: a second call with the same `as_of`
    /// stores nothing new.
    pub async fn recompute_at(
        &self,
        id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Position, EngineError> {
        let lock = self.locks.for_position(id);
        let _guard = lock.lock().await;

        let mut attempts = 0;
        loop {
            let pos = self.load(id).await?;
            if !pos.is_active() {
                return Ok(pos);
            }

            let perf = self.perf_for(&pos, as_of).await?;
            let snap = accrual::recompute(&pos, as_of, perf.as_ref());
            if snapshot_matches(&pos, &snap) {
                return Ok(pos);
            }

            let result = {
                let mut conn = self.db.lock().await;
                let tx = conn.transaction()?;
                match settlement::write_lifecycle_state(
                    &tx,
                    id,
                    pos.version,
                    pos.status,
                    snap.accrued_profit,
                    pos.paid_out_profit,
                    snap.next_payout_at,
                    snap.next_payout_amount,
                    as_of,
                ) {
                    Ok(()) => {
                        tx.commit()?;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(()) => {
                    let mut updated = pos;
                    updated.accrued_profit = snap.accrued_profit;
                    updated.next_payout_at = snap.next_payout_at;
                    updated.next_payout_amount = snap.next_payout_amount;
                    updated.version += 1;
                    updated.updated_at = as_of;
                    return Ok(updated);
                }
                Err(e @ EngineError::ConcurrencyConflict(_)) => {
                    attempts += 1;
                    if attempts >= MAX_CONFLICT_RETRIES {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Recompute every active position. Per-position failures are logged
    /// and skipped; the count of refreshed positions is returned.
    pub async fn recompute_all(&self, as_of: DateTime<Utc>) -> Result<usize, EngineError> {
        let ids = self.active_position_ids().await?;
        let mut refreshed = 0;
        for id in ids {
            match self.recompute_at(&id, as_of).await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(position_id = %id, error = %e, "recompute failed"),
            }
        }
        Ok(refreshed)
    }

    /// Execute a lifecycle transition. Final accrual, settlement credit,
    /// audit record, and the status write commit together; settlement
    /// failure leaves the position untouched. Returns the updated position
    /// and the credited amount.
    pub async fn transition(
        &self,
        id: &str,
        new_status: PositionStatus,
        actor: &str,
        accrued_override: Option<f64>,
    ) -> Result<(Position, f64), EngineError> {
        let lock = self.locks.for_position(id);
        let _guard = lock.lock().await;

        let action = match new_status {
            PositionStatus::Completed => "complete",
            PositionStatus::Cancelled => "cancel",
            PositionStatus::Active => {
                return Err(EngineError::InvalidTransition("-> active".into()))
            }
        };

        let mut attempts = 0;
        loop {
            let pos = self.load(id).await?;
            lifecycle::ensure_transition(pos.status, new_status)?;

            let now = Utc::now();
            let perf = self.perf_for(&pos, now).await?;

            let result = {
                let mut conn = self.db.lock().await;
                let tx = conn.transaction()?;
                match settlement::settle_closure_tx(
                    &tx,
                    id,
                    new_status,
                    accrued_override,
                    perf.as_ref(),
                    now,
                ) {
                    Ok((credit, before, updated)) => {
                        let rec = AuditRecord::new(
                            id,
                            actor,
                            action,
                            now,
                            serde_json::to_value(&before)?,
                            serde_json::to_value(&updated)?,
                        );
                        audit::append_tx(&tx, &rec)?;
                        tx.commit()?;
                        Ok((credit, updated, rec))
                    }
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok((credit, updated, rec)) => {
                    self.notifier.publish(rec);
                    self.locks.release(id);
                    info!(
                        position_id = %id,
                        actor,
                        status = new_status.as_str(),
                        credit,
                        "position transitioned"
                    );
                    return Ok((updated, credit));
                }
                Err(e @ EngineError::ConcurrencyConflict(_)) => {
                    attempts += 1;
                    if attempts >= MAX_CONFLICT_RETRIES {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Settle the position's due payout, if any. At-most-once per
    /// scheduled date via the settlement idempotency key; aborts if the
    /// position left `active` concurrently (the closure path owns the
    /// funds then).
    pub async fn settle_due_payout(
        &self,
        id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<PayoutOutcome, EngineError> {
        let lock = self.locks.for_position(id);
        let _guard = lock.lock().await;

        let mut attempts = 0;
        loop {
            let pos = self.load(id).await?;
            if !pos.is_active() {
                return Ok(PayoutOutcome::Fenced { status: pos.status });
            }
            let Some(scheduled) = pos.next_payout_at else {
                return Ok(PayoutOutcome::NothingDue);
            };
            if scheduled > as_of {
                return Ok(PayoutOutcome::NothingDue);
            }

            let perf = self.perf_for(&pos, as_of).await?;
            let amount = accrual::unpaid_accrual(&pos, scheduled, perf.as_ref());
            let now = Utc::now();

            let result = {
                let mut conn = self.db.lock().await;
                let tx = conn.transaction()?;
                match settlement::settle_payout_tx(&tx, id, amount, scheduled, perf.as_ref(), now)
                {
                    Ok((outcome, updated)) => {
                        let rec = if matches!(outcome, PayoutOutcome::Settled { .. }) {
                            let rec = AuditRecord::new(
                                id,
                                "system:settlement",
                                "payout",
                                now,
                                serde_json::to_value(&pos)?,
                                serde_json::to_value(&updated)?,
                            );
                            audit::append_tx(&tx, &rec)?;
                            Some(rec)
                        } else {
                            None
                        };
                        tx.commit()?;
                        Ok((outcome, rec))
                    }
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok((outcome, rec)) => {
                    if let Some(rec) = rec {
                        self.notifier.publish(rec);
                    }
                    if let PayoutOutcome::Settled { amount } = outcome {
                        info!(position_id = %id, amount, "payout settled");
                    }
                    return Ok(outcome);
                }
                Err(e @ EngineError::ConcurrencyConflict(_)) => {
                    attempts += 1;
                    if attempts >= MAX_CONFLICT_RETRIES {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Admin override gateway. Field whitelist and invariant re-validation
    /// happen before any write; status changes route through
    /// [`Self::transition`], never a direct status write.
    pub async fn admin_update(
        &self,
        id: &str,
        update: AdminOverride,
        actor: &str,
    ) -> Result<Position, EngineError> {
        if let Some(target) = update.status {
            let pos = self.load(id).await?;
            admin::validate_override(&pos, &update)?;
            let (updated, _credit) = self
                .transition(id, target, actor, update.accrued_profit)
                .await?;
            return Ok(updated);
        }

        let lock = self.locks.for_position(id);
        let _guard = lock.lock().await;

        let mut attempts = 0;
        loop {
            let pos = self.load(id).await?;
            admin::validate_override(&pos, &update)?;

            let now = Utc::now();
            let accrued = update.accrued_profit.unwrap_or(pos.accrued_profit);
            let next_at = update.next_payout_at.or(pos.next_payout_at);
            let next_amount = update.next_payout_amount.unwrap_or(pos.next_payout_amount);

            let result = {
                let mut conn = self.db.lock().await;
                let tx = conn.transaction()?;
                match settlement::write_lifecycle_state(
                    &tx,
                    id,
                    pos.version,
                    pos.status,
                    accrued,
                    pos.paid_out_profit,
                    next_at,
                    next_amount,
                    now,
                ) {
                    Ok(()) => {
                        let mut updated = pos.clone();
                        updated.accrued_profit = accrued;
                        updated.next_payout_at = next_at;
                        updated.next_payout_amount = next_amount;
                        updated.version += 1;
                        updated.updated_at = now;
                        let rec = AuditRecord::new(
                            id,
                            actor,
                            "admin-override",
                            now,
                            serde_json::to_value(&pos)?,
                            serde_json::to_value(&updated)?,
                        );
                        audit::append_tx(&tx, &rec)?;
                        tx.commit()?;
                        Ok((updated, rec))
                    }
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok((updated, rec)) => {
                    self.notifier.publish(rec);
                    info!(position_id = %id, actor, "admin override applied");
                    return Ok(updated);
                }
                Err(e @ EngineError::ConcurrencyConflict(_)) => {
                    attempts += 1;
                    if attempts >= MAX_CONFLICT_RETRIES {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn audit_trail(&self, id: &str) -> Result<Vec<AuditRecord>, EngineError> {
        let conn = self.db.lock().await;
        audit::list_for_position(&conn, id)
    }

    pub async fn active_position_ids(&self) -> Result<Vec<String>, EngineError> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM positions WHERE status = 'active' ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn load(&self, id: &str) -> Result<Position, EngineError> {
        let conn = self.db.lock().await;
        let pos = conn
            .query_row(
                &format!("SELECT {} FROM positions WHERE id = ?1", POSITION_COLUMNS),
                [id],
                Position::from_row,
            )
            .optional()?;
        pos.ok_or_else(|| EngineError::NotFound(format!("position {}", id)))
    }

    /// Latest performance snapshot for copy positions; plans accrue from
    /// their own terms and need none.
    async fn perf_for(
        &self,
        pos: &Position,
        as_of: DateTime<Utc>,
    ) -> Result<Option<TraderPerformance>, EngineError> {
        match &pos.kind {
            super::model::PositionKind::Copy { .. } => {
                self.catalog
                    .latest_performance(&pos.reference_id, as_of)
                    .await
            }
            super::model::PositionKind::Plan { .. } => Ok(None),
        }
    }
}

fn snapshot_matches(pos: &Position, snap: &AccrualSnapshot) -> bool {
    pos.accrued_profit.to_bits() == snap.accrued_profit.to_bits()
        && pos.next_payout_at == snap.next_payout_at
        && pos.next_payout_amount.to_bits() == snap.next_payout_amount.to_bits()
}
