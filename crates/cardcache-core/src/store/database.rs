//! SQLite storage layer for the processing cache.
//!
//! Each public method opens its own connection, so the handle is cheap to
//! clone and share between threads; concurrent writers are serialised by
//! SQLite itself (WAL mode plus a busy timeout), never by an in-process lock.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, DatabaseName, OptionalExtension};

use crate::errors::{CacheError, CacheResult};
use crate::store::schema;

/// Default time a connection waits on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helper: tilde expansion
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw == "~" || raw.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            let mut expanded = home;
            if raw.len() > 2 {
                expanded.push(&raw[2..]);
            }
            return expanded;
        }
    }
    path.to_path_buf()
}

/// Expand `~` and make the path absolute against the current directory.
pub(crate) fn resolve_path(path: &Path) -> CacheResult<PathBuf> {
    let expanded = expand_tilde(path);
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Handle to the catalog/processing/activity database.
#[derive(Clone, Debug)]
pub struct Database {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Create a handle without touching the schema. The path is expanded and
    /// parent directories are created if they do not already exist.
    pub fn new(db_path: impl AsRef<Path>) -> CacheResult<Self> {
        let resolved = resolve_path(db_path.as_ref())?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            db_path: resolved,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    /// Create a handle and bring the schema up to date.
    pub fn open(db_path: impl AsRef<Path>) -> CacheResult<Self> {
        let db = Self::new(db_path)?;
        db.init_schema()?;
        Ok(db)
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open a new SQLite connection to `self.db_path` with foreign keys on.
    ///
    /// Failing to open the file at all is reported as [`CacheError::Storage`]
    /// so callers can tell "store unavailable" apart from a bad statement.
    pub(crate) fn connect(&self) -> CacheResult<Connection> {
        let conn = Connection::open(&self.db_path).map_err(|e| {
            CacheError::Storage(format!("cannot open {}: {e}", self.db_path.display()))
        })?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Initialise the database schema: set WAL mode, create all tables and
    /// indexes, then run pending migrations.
    pub fn init_schema(&self) -> CacheResult<()> {
        let conn = self.connect()?;
        // journal_mode returns a row, so it cannot go through execute_batch
        // on every SQLite build.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&conn)?;
        tracing::debug!(path = %self.db_path.display(), "cache schema ready");
        Ok(())
    }

    pub fn schema_version(&self) -> CacheResult<i32> {
        let conn = self.connect()?;
        Ok(schema::get_schema_version(&conn))
    }

    /// Copy the live database to `dest` using SQLite's online backup.
    pub fn backup_to(&self, dest: &Path) -> CacheResult<()> {
        let conn = self.connect()?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        conn.backup(DatabaseName::Main, dest, None)?;
        tracing::info!(dest = %dest.display(), "database backed up");
        Ok(())
    }
}

/// Fail with [`CacheError::Referential`] unless `entry_id` is in the catalog.
pub(crate) fn ensure_entry_exists(conn: &Connection, entry_id: &str) -> CacheResult<()> {
    let found = conn
        .query_row(
            "SELECT 1 FROM catalog_entries WHERE entry_id = ?1;",
            params![entry_id],
            |_| Ok(()),
        )
        .optional()?;
    match found {
        Some(()) => Ok(()),
        None => Err(CacheError::Referential {
            entry_id: entry_id.to_string(),
        }),
    }
}
