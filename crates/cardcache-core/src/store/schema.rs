//! SQLite schema DDL and migration framework.

use rusqlite::Connection;

use crate::errors::CacheResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 1;

/// Core DDL statements: 5 CREATE TABLE + 3 CREATE INDEX.
///
/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised database. The uniqueness guarantees of the cache live
/// here, not in application code: `UNIQUE(content_hash, role)` on the catalog
/// and `UNIQUE` on `processing_records.entry_id`.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (5) ──────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS cache_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS catalog_entries (
        entry_id TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        role TEXT NOT NULL,
        original_filename TEXT,
        byte_size INTEGER,
        width INTEGER,
        height INTEGER,
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        upload_count INTEGER NOT NULL DEFAULT 1 CHECK (upload_count >= 1),
        UNIQUE(content_hash, role)
    );",
    "CREATE TABLE IF NOT EXISTS processing_records (
        entry_id TEXT NOT NULL UNIQUE REFERENCES catalog_entries(entry_id),
        artifact_paths TEXT,
        geometry TEXT,
        artifact_root TEXT,
        metadata_auto TEXT,
        metadata_manual TEXT,
        listing TEXT,
        updated_at TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS activity_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        entry_id TEXT NOT NULL REFERENCES catalog_entries(entry_id),
        action TEXT NOT NULL,
        occurred_at TEXT NOT NULL,
        details TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    // ── indexes (3) ─────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_catalog_hash ON catalog_entries(content_hash);",
    "CREATE INDEX IF NOT EXISTS idx_activity_session ON activity_log(session_id, id);",
    "CREATE INDEX IF NOT EXISTS idx_activity_entry ON activity_log(entry_id, id);",
];

// ─── Migration framework ────────────────────────────────────────────────────

/// Run all pending migrations from the current stored version up to
/// [`SCHEMA_VERSION`]. Each step is wrapped in a SAVEPOINT so a failure
/// rolls back only that single step.
pub fn migrate_schema(conn: &Connection) -> CacheResult<()> {
    let mut current_version = get_schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT cardcache_migrate_step;")?;

        let step_result = (|| -> CacheResult<()> {
            match next_version {
                1 => migrate_to_v1(conn)?,
                _ => {}
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT cardcache_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                tracing::debug!(from = current_version, to = next_version, "schema migrated");
                current_version = next_version;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT cardcache_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT cardcache_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Read the current schema version from `cache_meta`.
/// Returns 0 when the key is absent or unparseable.
pub(crate) fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM cache_meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> CacheResult<()> {
    conn.execute(
        "INSERT INTO cache_meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> CacheResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

// ─── Individual migration steps ─────────────────────────────────────────────

/// v0 -> v1: baseline. `SCHEMA_STATEMENTS` already created everything.
fn migrate_to_v1(_conn: &Connection) -> CacheResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    #[test]
    fn schema_statement_counts() {
        // 5 tables + 3 indexes
        assert_eq!(SCHEMA_STATEMENTS.len(), 8);
    }

    #[test]
    fn migrate_fresh_database() {
        let conn = fresh_conn();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);

        let steps: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM migration_history WHERE status = 'success';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(steps, SCHEMA_VERSION as i64);
    }

    #[test]
    fn migrate_idempotent() {
        let conn = fresh_conn();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        migrate_schema(&conn).unwrap();
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn baseline_carries_every_processing_column() {
        let conn = fresh_conn();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        migrate_schema(&conn).unwrap();
        let mut stmt = conn.prepare("PRAGMA table_info(processing_records);").unwrap();
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        for wanted in ["artifact_paths", "geometry", "metadata_auto", "metadata_manual", "listing"] {
            assert!(columns.iter().any(|c| c == wanted), "missing column {wanted}");
        }
    }
}
