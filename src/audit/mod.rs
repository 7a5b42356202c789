//! Audit trail.
//!
//! Every lifecycle transition and admin override appends a record with full
//! before/after snapshots, inside the same transaction that commits the
//! change. A broadcast notifier fans records out to the external
//! audit/notification sink fire-and-forget.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::errors::EngineError;
use crate::store::{ts_from_sql, ts_to_sql};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub position_id: String,
    pub actor: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub before_state: serde_json::Value,
    pub after_state: serde_json::Value,
}

impl AuditRecord {
    pub fn new(
        position_id: &str,
        actor: &str,
        action: &str,
        timestamp: DateTime<Utc>,
        before_state: serde_json::Value,
        after_state: serde_json::Value,
    ) -> Self {
        Self {
            position_id: position_id.to_string(),
            actor: actor.to_string(),
            action: action.to_string(),
            timestamp,
            before_state,
            after_state,
        }
    }
}

/// Append a record inside an open transaction.
pub fn append_tx(tx: &Transaction<'_>, rec: &AuditRecord) -> Result<(), EngineError> {
    tx.execute(
        "INSERT INTO audit_records (position_id, actor, action, ts, before_state, after_state)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            &rec.position_id,
            &rec.actor,
            &rec.action,
            ts_to_sql(rec.timestamp),
            rec.before_state.to_string(),
            rec.after_state.to_string(),
        ],
    )?;
    Ok(())
}

/// Read the trail for one position, oldest first.
pub fn list_for_position(
    conn: &Connection,
    position_id: &str,
) -> Result<Vec<AuditRecord>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT position_id, actor, action, ts, before_state, after_state
         FROM audit_records WHERE position_id = ?1 ORDER BY ts ASC, id ASC",
    )?;
    let rows = stmt.query_map([position_id], |row| {
        let ts_raw: String = row.get(3)?;
        let before_raw: String = row.get(4)?;
        let after_raw: String = row.get(5)?;
        Ok(AuditRecord {
            position_id: row.get(0)?,
            actor: row.get(1)?,
            action: row.get(2)?,
            timestamp: ts_from_sql(3, &ts_raw)?,
            before_state: serde_json::from_str(&before_raw).unwrap_or(serde_json::Value::Null),
            after_state: serde_json::from_str(&after_raw).unwrap_or(serde_json::Value::Null),
        })
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Fire-and-forget fan-out to whoever subscribed (notification plumbing,
/// tests). Dropped when there are no subscribers.
#[derive(Clone)]
pub struct AuditNotifier {
    sender: broadcast::Sender<AuditRecord>,
}

impl AuditNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.sender.subscribe()
    }

    pub fn publish(&self, rec: AuditRecord) {
        debug!(
            position_id = %rec.position_id,
            actor = %rec.actor,
            action = %rec.action,
            "audit record"
        );
        let _ = self.sender.send(rec);
    }
}

impl Default for AuditNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}
