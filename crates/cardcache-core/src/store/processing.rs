//! Processing cache: at most one processing record per catalog entry.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;

use crate::errors::{CacheError, CacheResult};
use crate::identity::ContentHash;
use crate::models::{
    AutoMetadata, FieldMap, FieldUpdate, GridGeometry, ListingRef, ProcessingRecord, ProcessingUpdate,
    RecordMetadata, Role,
};
use crate::store::database::{ensure_entry_exists, Database};

const RECORD_COLUMNS: &str = "p.entry_id, p.artifact_paths, p.geometry, p.artifact_root, \
                              p.metadata_auto, p.metadata_manual, p.listing, p.updated_at";

/// A processing row as stored: JSON columns still serialised.
struct RawRecord {
    entry_id: String,
    artifact_paths: Option<String>,
    geometry: Option<String>,
    artifact_root: Option<String>,
    metadata_auto: Option<String>,
    metadata_manual: Option<String>,
    listing: Option<String>,
    updated_at: DateTime<Utc>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entry_id: row.get(0)?,
            artifact_paths: row.get(1)?,
            geometry: row.get(2)?,
            artifact_root: row.get(3)?,
            metadata_auto: row.get(4)?,
            metadata_manual: row.get(5)?,
            listing: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_record(self) -> CacheResult<ProcessingRecord> {
        let artifact_paths = self
            .artifact_paths
            .map(|raw| serde_json::from_str::<Vec<PathBuf>>(&raw))
            .transpose()?;
        let geometry = self
            .geometry
            .map(|raw| serde_json::from_str::<GridGeometry>(&raw))
            .transpose()?;
        let auto = self
            .metadata_auto
            .map(|raw| serde_json::from_str::<AutoMetadata>(&raw))
            .transpose()?;
        let manual = match self.metadata_manual {
            Some(raw) => serde_json::from_str::<FieldMap>(&raw)?,
            None => FieldMap::new(),
        };
        let listing = self
            .listing
            .map(|raw| serde_json::from_str::<ListingRef>(&raw))
            .transpose()?;
        Ok(ProcessingRecord {
            entry_id: self.entry_id,
            artifact_paths,
            geometry,
            artifact_root: self.artifact_root.map(PathBuf::from),
            metadata: RecordMetadata { auto, manual },
            listing,
            updated_at: self.updated_at,
        })
    }
}

/// Serialise one tri-state field to its column value. `None` means the
/// column is not part of the update.
fn column_value<T>(
    update: &FieldUpdate<T>,
    encode: impl Fn(&T) -> CacheResult<String>,
) -> CacheResult<Option<Option<String>>> {
    Ok(match update {
        FieldUpdate::Keep => None,
        FieldUpdate::Clear => Some(None),
        FieldUpdate::Set(v) => Some(Some(encode(v)?)),
    })
}

fn read_record(conn: &Connection, entry_id: &str) -> CacheResult<Option<ProcessingRecord>> {
    let raw = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM processing_records p WHERE p.entry_id = ?1;"),
            params![entry_id],
            RawRecord::from_row,
        )
        .optional()?;
    raw.map(RawRecord::into_record).transpose()
}

/// Insert-or-update a single JSON column, leaving every other column alone.
fn upsert_single_column(
    conn: &Connection,
    entry_id: &str,
    column: &'static str,
    value: &str,
    now: DateTime<Utc>,
) -> CacheResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO processing_records(entry_id, {column}, updated_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(entry_id) DO UPDATE SET \
                 {column} = excluded.{column}, updated_at = excluded.updated_at;"
        ),
        params![entry_id, value, now],
    )?;
    Ok(())
}

impl Database {
    /// Read path consulted before any expensive work: the processing record
    /// for `(content_hash, role)`, or `None` if the image was never seen in
    /// that role or was seen but never processed.
    pub fn lookup(&self, content_hash: &ContentHash, role: Role) -> CacheResult<Option<ProcessingRecord>> {
        let conn = self.connect()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM processing_records p \
                     JOIN catalog_entries c ON c.entry_id = p.entry_id \
                     WHERE c.content_hash = ?1 AND c.role = ?2;"
                ),
                params![content_hash.as_str(), role],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    pub fn get_record(&self, entry_id: &str) -> CacheResult<Option<ProcessingRecord>> {
        let conn = self.connect()?;
        read_record(&conn, entry_id)
    }

    /// Partial upsert of the processing record for `entry_id`.
    ///
    /// Fields set to `Keep` are untouched on an existing record and NULL on
    /// a new one; `Clear` nulls the column. The manual metadata layer and
    /// the listing are never touched here. Returns the record as stored.
    /// An update that keeps every field leaves an existing record as is,
    /// `updated_at` included.
    pub fn upsert_processing(
        &self,
        entry_id: &str,
        update: &ProcessingUpdate,
    ) -> CacheResult<ProcessingRecord> {
        if update.is_noop() {
            if let Some(existing) = self.get_record(entry_id)? {
                return Ok(existing);
            }
        }
        if let Some(geometry) = update.geometry.as_option() {
            geometry.validate()?;
        }
        if let Some(auto) = update.metadata.as_option() {
            auto.fields.validate()?;
        }

        let columns: [(&str, Option<Option<String>>); 4] = [
            (
                "artifact_paths",
                column_value(&update.artifact_paths, |v| Ok(serde_json::to_string(v)?))?,
            ),
            (
                "geometry",
                column_value(&update.geometry, |v| Ok(serde_json::to_string(v)?))?,
            ),
            (
                "artifact_root",
                column_value(&update.artifact_root, |v| Ok(v.to_string_lossy().into_owned()))?,
            ),
            (
                "metadata_auto",
                column_value(&update.metadata, |v| Ok(serde_json::to_string(v)?))?,
            ),
        ];

        let mut set_clauses = vec!["updated_at = excluded.updated_at".to_string()];
        for (name, value) in &columns {
            if value.is_some() {
                set_clauses.push(format!("{name} = excluded.{name}"));
            }
        }
        let sql = format!(
            "INSERT INTO processing_records(entry_id, artifact_paths, geometry, artifact_root, \
                 metadata_auto, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(entry_id) DO UPDATE SET {};",
            set_clauses.join(", ")
        );
        let insert_values: Vec<Option<String>> = columns
            .iter()
            .map(|(_, value)| value.clone().flatten())
            .collect();

        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_entry_exists(&tx, entry_id)?;
        tx.execute(
            &sql,
            params![
                entry_id,
                insert_values[0],
                insert_values[1],
                insert_values[2],
                insert_values[3],
                Utc::now(),
            ],
        )?;
        let record = read_record(&tx, entry_id)?;
        tx.commit()?;

        tracing::debug!(
            entry_id,
            artifacts = !update.artifact_paths.is_keep(),
            geometry = !update.geometry.is_keep(),
            metadata = !update.metadata.is_keep(),
            "processing record upserted"
        );
        record.ok_or_else(|| CacheError::Storage(format!(
            "processing record for {entry_id} vanished after upsert"
        )))
    }

    /// Merge human overrides into the manual metadata layer.
    ///
    /// A `null` value removes that override so the extracted value shows
    /// through again. Creates the record if the entry was never processed.
    pub fn set_manual_fields(&self, entry_id: &str, fields: &FieldMap) -> CacheResult<ProcessingRecord> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_entry_exists(&tx, entry_id)?;

        let mut manual = read_record(&tx, entry_id)?
            .map(|record| record.metadata.manual)
            .unwrap_or_default();
        for (name, value) in fields {
            if value == &Value::Null {
                manual.shift_remove(name);
            } else {
                manual.insert(name.clone(), value.clone());
            }
        }
        let encoded = serde_json::to_string(&manual)?;
        upsert_single_column(&tx, entry_id, "metadata_manual", &encoded, Utc::now())?;
        let record = read_record(&tx, entry_id)?;
        tx.commit()?;

        record.ok_or_else(|| CacheError::Storage(format!(
            "processing record for {entry_id} vanished after manual update"
        )))
    }

    /// Store the marketplace listing created from this entry's metadata.
    pub fn record_listing(&self, entry_id: &str, listing: &ListingRef) -> CacheResult<ProcessingRecord> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_entry_exists(&tx, entry_id)?;
        let encoded = serde_json::to_string(listing)?;
        upsert_single_column(&tx, entry_id, "listing", &encoded, Utc::now())?;
        let record = read_record(&tx, entry_id)?;
        tx.commit()?;

        record.ok_or_else(|| CacheError::Storage(format!(
            "processing record for {entry_id} vanished after listing update"
        )))
    }

    pub fn count_records(&self) -> CacheResult<i64> {
        let conn = self.connect()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM processing_records;", [], |row| row.get(0))?)
    }
}
