//! Append-only activity log.
//!
//! The log is diagnostic: appending never fails the caller, and nothing in
//! the cache reads it back to make decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Row};
use serde_json::Value;
use tracing::warn;

use crate::errors::CacheResult;
use crate::models::{ActivityAction, ActivityRecord};
use crate::store::database::Database;

const ACTIVITY_COLUMNS: &str = "id, session_id, entry_id, action, occurred_at, details";

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<ActivityRecord> {
    let details: Option<String> = row.get(5)?;
    Ok(ActivityRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        entry_id: row.get(2)?,
        action: row.get(3)?,
        occurred_at: row.get(4)?,
        details: details
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(Value::Null),
    })
}

/// Best-effort writer/reader for `activity_log`.
#[derive(Clone, Debug)]
pub struct ActivityLog {
    db: Database,
    failures: Arc<AtomicU64>,
}

impl ActivityLog {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append one action. Failures are logged as warnings and counted,
    /// never returned.
    pub fn append(&self, session_id: &str, entry_id: &str, action: ActivityAction, details: Value) {
        if let Err(e) = self.try_append(session_id, entry_id, action, &details) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                session_id,
                entry_id,
                action = action.as_str(),
                error = %e,
                "activity log append failed"
            );
        }
    }

    fn try_append(
        &self,
        session_id: &str,
        entry_id: &str,
        action: ActivityAction,
        details: &Value,
    ) -> CacheResult<i64> {
        let conn = self.db.connect()?;
        let encoded = if details.is_null() {
            None
        } else {
            Some(serde_json::to_string(details)?)
        };
        conn.execute(
            "INSERT INTO activity_log(session_id, entry_id, action, occurred_at, details) \
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![session_id, entry_id, action, Utc::now(), encoded],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Number of appends that were dropped since this log was created.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Audit query: everything recorded for a session, oldest first.
    pub fn list(&self, session_id: &str) -> CacheResult<Vec<ActivityRecord>> {
        self.query("session_id", session_id)
    }

    pub fn list_for_entry(&self, entry_id: &str) -> CacheResult<Vec<ActivityRecord>> {
        self.query("entry_id", entry_id)
    }

    fn query(&self, column: &'static str, value: &str) -> CacheResult<Vec<ActivityRecord>> {
        let conn = self.db.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activity_log WHERE {column} = ?1 ORDER BY id;"
        ))?;
        let rows = stmt.query_map(params![value], activity_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}
