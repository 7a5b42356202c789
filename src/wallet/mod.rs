//! Wallet ledger.
//!
//! Per-owner available balance plus an append-only transaction log. The
//! balance is only ever mutated through the debit/credit operations here,
//! and the UNIQUE idempotency key on the log row is the at-most-once
//! guarantee for settlement retries.
//!
//! The tx-scoped functions operate on an open rusqlite transaction so that
//! settlement can mutate wallet, position, log, and audit atomically. The
//! [`WalletStore`] facade wraps them for standalone use (deposits, balance
//! reads).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::store::{ts_from_sql, ts_to_sql, Db};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub owner_id: String,
    pub available_balance: f64,
    pub currency: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: String,
    pub owner_id: String,
    pub position_id: Option<String>,
    pub kind: String, // "debit" | "credit"
    pub amount: f64,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a ledger mutation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEffect {
    Applied,
    /// The idempotency key was already consumed; the balance is untouched.
    AlreadyApplied,
}

/// Append the log row for `key`. Returns false when the key already exists.
fn append_log(
    tx: &Transaction<'_>,
    owner_id: &str,
    position_id: Option<&str>,
    kind: &str,
    amount: f64,
    key: &str,
    now: DateTime<Utc>,
) -> Result<bool, EngineError> {
    let changed = tx.execute(
        "INSERT INTO wallet_transactions (id, owner_id, position_id, kind, amount, idempotency_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(idempotency_key) DO NOTHING",
        params![
            Uuid::new_v4().to_string(),
            owner_id,
            position_id,
            kind,
            amount,
            key,
            ts_to_sql(now),
        ],
    )?;
    Ok(changed == 1)
}

fn read_wallet_row(
    tx: &Transaction<'_>,
    owner_id: &str,
) -> Result<Option<(f64, i64)>, EngineError> {
    let row = tx
        .query_row(
            "SELECT available_balance, version FROM wallets WHERE owner_id = ?1",
            [owner_id],
            |row| Ok((row.get::<_, f64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    Ok(row)
}

/// Debit `amount` from the owner's wallet inside an open transaction.
///
/// Overdraft protection: the balance is read, checked, and then updated with
/// an optimistic version predicate. A lost version check surfaces as
/// `ConcurrencyConflict` and rolls back with the enclosing transaction.
pub fn apply_debit(
    tx: &Transaction<'_>,
    owner_id: &str,
    position_id: Option<&str>,
    amount: f64,
    key: &str,
    now: DateTime<Utc>,
) -> Result<LedgerEffect, EngineError> {
    if !(amount > 0.0) || !amount.is_finite() {
        return Err(EngineError::Validation(format!(
            "debit amount must be positive, got {}",
            amount
        )));
    }

    if !append_log(tx, owner_id, position_id, "debit", amount, key, now)? {
        return Ok(LedgerEffect::AlreadyApplied);
    }

    let Some((balance, version)) = read_wallet_row(tx, owner_id)? else {
        return Err(EngineError::InsufficientFunds(format!(
            "owner {} has no wallet",
            owner_id
        )));
    };
    if balance < amount {
        return Err(EngineError::InsufficientFunds(format!(
            "owner {} needs {:.2}, has {:.2}",
            owner_id, amount, balance
        )));
    }

    let changed = tx.execute(
        "UPDATE wallets SET available_balance = available_balance - ?1,
                version = version + 1, updated_at = ?2
         WHERE owner_id = ?3 AND version = ?4",
        params![amount, ts_to_sql(now), owner_id, version],
    )?;
    if changed == 0 {
        return Err(EngineError::ConcurrencyConflict(format!(
            "wallet {} moved past version {}",
            owner_id, version
        )));
    }

    Ok(LedgerEffect::Applied)
}

/// Credit `amount` to the owner's wallet inside an open transaction,
/// creating the wallet row if the owner has none yet.
pub fn apply_credit(
    tx: &Transaction<'_>,
    owner_id: &str,
    position_id: Option<&str>,
    amount: f64,
    currency: &str,
    key: &str,
    now: DateTime<Utc>,
) -> Result<LedgerEffect, EngineError> {
    if amount < 0.0 || !amount.is_finite() {
        return Err(EngineError::Validation(format!(
            "credit amount must be non-negative, got {}",
            amount
        )));
    }

    if !append_log(tx, owner_id, position_id, "credit", amount, key, now)? {
        return Ok(LedgerEffect::AlreadyApplied);
    }

    match read_wallet_row(tx, owner_id)? {
        Some((_, version)) => {
            let changed = tx.execute(
                "UPDATE wallets SET available_balance = available_balance + ?1,
                        version = version + 1, updated_at = ?2
                 WHERE owner_id = ?3 AND version = ?4",
                params![amount, ts_to_sql(now), owner_id, version],
            )?;
            if changed == 0 {
                return Err(EngineError::ConcurrencyConflict(format!(
                    "wallet {} moved past version {}",
                    owner_id, version
                )));
            }
        }
        None => {
            tx.execute(
                "INSERT INTO wallets (owner_id, available_balance, currency, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                params![owner_id, amount, currency, ts_to_sql(now)],
            )?;
        }
    }

    Ok(LedgerEffect::Applied)
}

/// Standalone wallet operations (the §6 collaborator surface).
#[derive(Clone)]
pub struct WalletStore {
    db: Db,
}

impl WalletStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get_wallet(&self, owner_id: &str) -> Result<Option<Wallet>, EngineError> {
        let conn = self.db.lock().await;
        let wallet = conn
            .query_row(
                "SELECT owner_id, available_balance, currency, version, created_at, updated_at
                 FROM wallets WHERE owner_id = ?1",
                [owner_id],
                |row| {
                    let created_raw: String = row.get(4)?;
                    let updated_raw: String = row.get(5)?;
                    Ok(Wallet {
                        owner_id: row.get(0)?,
                        available_balance: row.get(1)?,
                        currency: row.get(2)?,
                        version: row.get(3)?,
                        created_at: ts_from_sql(4, &created_raw)?,
                        updated_at: ts_from_sql(5, &updated_raw)?,
                    })
                },
            )
            .optional()?;
        Ok(wallet)
    }

    pub async fn get_balance(&self, owner_id: &str) -> Result<f64, EngineError> {
        Ok(self
            .get_wallet(owner_id)
            .await?
            .map(|w| w.available_balance)
            .unwrap_or(0.0))
    }

    /// Credit outside any settlement flow (deposits from the payment-rail
    /// collaborator).
    pub async fn credit(
        &self,
        owner_id: &str,
        amount: f64,
        currency: &str,
        idempotency_key: &str,
    ) -> Result<LedgerEffect, EngineError> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let effect = apply_credit(
            &tx,
            owner_id,
            None,
            amount,
            currency,
            idempotency_key,
            Utc::now(),
        )?;
        tx.commit()?;
        Ok(effect)
    }

    /// Debit outside any settlement flow (withdrawals).
    pub async fn debit(
        &self,
        owner_id: &str,
        amount: f64,
        idempotency_key: &str,
    ) -> Result<LedgerEffect, EngineError> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let effect = apply_debit(&tx, owner_id, None, amount, idempotency_key, Utc::now())?;
        tx.commit()?;
        Ok(effect)
    }

    /// Sum of all debits attributed to the owner's positions. Used to check
    /// the committed-capital invariant.
    pub async fn cumulative_position_debits(&self, owner_id: &str) -> Result<f64, EngineError> {
        let conn = self.db.lock().await;
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0.0) FROM wallet_transactions
             WHERE owner_id = ?1 AND kind = 'debit' AND position_id IS NOT NULL",
            [owner_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub async fn list_transactions(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<WalletTransaction>, EngineError> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, owner_id, position_id, kind, amount, idempotency_key, created_at
             FROM wallet_transactions WHERE owner_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![owner_id, limit], |row| {
            let created_raw: String = row.get(6)?;
            Ok(WalletTransaction {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                position_id: row.get(2)?,
                kind: row.get(3)?,
                amount: row.get(4)?,
                idempotency_key: row.get(5)?,
                created_at: ts_from_sql(6, &created_raw)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
