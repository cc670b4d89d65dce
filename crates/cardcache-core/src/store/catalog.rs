//! Master catalog: one durable row per `(content_hash, role)`.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::errors::CacheResult;
use crate::identity::ContentHash;
use crate::models::{CatalogEntry, CatalogHit, Role, UploadDescriptor};
use crate::store::database::Database;

const ENTRY_COLUMNS: &str = "entry_id, content_hash, role, original_filename, byte_size, \
                             width, height, first_seen_at, last_seen_at, upload_count";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CatalogEntry> {
    let hash: String = row.get(1)?;
    Ok(CatalogEntry {
        entry_id: row.get(0)?,
        content_hash: ContentHash::from_hex(&hash).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        role: row.get(2)?,
        original_filename: row.get(3)?,
        byte_size: row.get(4)?,
        width: row.get(5)?,
        height: row.get(6)?,
        first_seen_at: row.get(7)?,
        last_seen_at: row.get(8)?,
        upload_count: row.get(9)?,
    })
}

impl Database {
    /// Record one upload of `(content_hash, role)`.
    ///
    /// An existing entry gets its counter bumped and `last_seen_at` refreshed;
    /// otherwise a new entry is created with `upload_count = 1`. The whole
    /// decision is a single statement against the unique index, so two
    /// concurrent callers for the same key end up sharing one row: the
    /// second caller's insert turns into the update and gets the first
    /// caller's `entry_id` back.
    pub fn get_or_create_entry(&self, upload: &UploadDescriptor) -> CacheResult<CatalogHit> {
        let conn = self.connect()?;
        let candidate_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let byte_size = upload.byte_size.map(|n| i64::try_from(n).unwrap_or(i64::MAX));
        let (width, height) = match upload.dims {
            Some(d) => (Some(i64::from(d.width)), Some(i64::from(d.height))),
            None => (None, None),
        };

        let (entry_id, upload_count): (String, i64) = conn.query_row(
            "INSERT INTO catalog_entries(entry_id, content_hash, role, original_filename, \
                 byte_size, width, height, first_seen_at, last_seen_at, upload_count) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 1) \
             ON CONFLICT(content_hash, role) DO UPDATE SET \
                 upload_count = catalog_entries.upload_count + 1, \
                 last_seen_at = excluded.last_seen_at, \
                 width = COALESCE(catalog_entries.width, excluded.width), \
                 height = COALESCE(catalog_entries.height, excluded.height) \
             RETURNING entry_id, upload_count;",
            params![
                candidate_id,
                upload.content_hash.as_str(),
                upload.role,
                upload.original_filename,
                byte_size,
                width,
                height,
                now,
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let created = entry_id == candidate_id;
        tracing::debug!(
            entry_id = %entry_id,
            hash = upload.content_hash.short(),
            role = %upload.role,
            upload_count,
            created,
            "catalog get_or_create"
        );
        Ok(CatalogHit {
            entry_id,
            upload_count,
            created,
        })
    }

    pub fn get_entry(&self, entry_id: &str) -> CacheResult<Option<CatalogEntry>> {
        let conn = self.connect()?;
        let entry = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM catalog_entries WHERE entry_id = ?1;"),
                params![entry_id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn find_entry(&self, content_hash: &ContentHash, role: Role) -> CacheResult<Option<CatalogEntry>> {
        let conn = self.connect()?;
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM catalog_entries \
                     WHERE content_hash = ?1 AND role = ?2;"
                ),
                params![content_hash.as_str(), role],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Every role a given image has been uploaded in.
    pub fn entries_for_hash(&self, content_hash: &ContentHash) -> CacheResult<Vec<CatalogEntry>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM catalog_entries \
             WHERE content_hash = ?1 ORDER BY first_seen_at, entry_id;"
        ))?;
        let rows = stmt.query_map(params![content_hash.as_str()], entry_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn count_entries(&self) -> CacheResult<i64> {
        let conn = self.connect()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM catalog_entries;", [], |row| row.get(0))?)
    }
}
