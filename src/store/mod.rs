//! SQLite persistence layer.
//!
//! One database file holds every table the engine touches so that a single
//! rusqlite transaction can span positions, wallets, the wallet transaction
//! log, and the audit log. Timestamps are stored as RFC 3339 TEXT.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard};

/// Shared handle to the engine database.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open engine db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Acquire the connection. All writes are serialized behind this lock;
    /// multi-table atomicity comes from explicit transactions on the guard.
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallets (
                owner_id TEXT PRIMARY KEY,
                available_balance REAL NOT NULL DEFAULT 0.0,
                currency TEXT NOT NULL DEFAULT 'USD',
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallet_transactions (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                position_id TEXT,
                kind TEXT NOT NULL,
                amount REAL NOT NULL,
                idempotency_key TEXT UNIQUE NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_wallet_tx_owner ON wallet_transactions(owner_id, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_wallet_tx_position ON wallet_transactions(position_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                committed_amount REAL NOT NULL,
                currency TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ends_at TEXT,
                status TEXT NOT NULL,
                accrued_profit REAL NOT NULL DEFAULT 0.0,
                paid_out_profit REAL NOT NULL DEFAULT 0.0,
                next_payout_at TEXT,
                next_payout_amount REAL NOT NULL DEFAULT 0.0,
                roi_percent REAL,
                duration_months INTEGER,
                allocation_percent REAL,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_owner ON positions(owner_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_due ON positions(status, next_payout_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id TEXT NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                ts TEXT NOT NULL,
                before_state TEXT NOT NULL,
                after_state TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_position_ts ON audit_records(position_id, ts)",
            [],
        )?;

        // Catalog tables are read-only from the engine's perspective; they
        // are written by admin tooling / market-data ingestion outside this
        // core.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS plans (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                roi_percent REAL NOT NULL,
                duration_months INTEGER NOT NULL,
                min_amount REAL NOT NULL,
                max_amount REAL NOT NULL,
                currency TEXT NOT NULL DEFAULT 'USD',
                active INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS master_traders (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                min_amount REAL NOT NULL,
                max_amount REAL NOT NULL,
                default_allocation_percent REAL NOT NULL,
                max_allocation_percent REAL NOT NULL,
                currency TEXT NOT NULL DEFAULT 'USD',
                active INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trader_performance (
                trader_id TEXT NOT NULL,
                as_of TEXT NOT NULL,
                realized_pnl REAL NOT NULL,
                PRIMARY KEY (trader_id, as_of)
            )",
            [],
        )?;

        Ok(())
    }
}

/// Render a timestamp the way every table stores it.
pub fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a stored timestamp, surfacing a column-level conversion error so
/// row mappers can propagate it instead of panicking.
pub fn ts_from_sql(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ts_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let raw = ts_to_sql(ts);
        assert_eq!(ts_from_sql(0, &raw).unwrap(), ts);
    }

    #[test]
    fn test_ts_rejects_garbage() {
        assert!(ts_from_sql(3, "not-a-timestamp").is_err());
    }
}
