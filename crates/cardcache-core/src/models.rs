//! Shared typed models used across the catalog, processing and artifact layers.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{CacheError, CacheResult};
use crate::identity::ContentHash;

/// Free-form fields keyed by name, kept in insertion order.
pub type FieldMap = IndexMap<String, Value>;

// ---------------------------------------------------------------------------
// 1. Role
// ---------------------------------------------------------------------------

/// The role an image was uploaded in. The same bytes uploaded as a face and
/// as a verso are two different catalog entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Face,
    Verso,
    Combined,
    Lot,
    Stamp,
}

impl Role {
    pub const ALL: [Role; 5] = [Role::Face, Role::Verso, Role::Combined, Role::Lot, Role::Stamp];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Face => "face",
            Role::Verso => "verso",
            Role::Combined => "combined",
            Role::Lot => "lot",
            Role::Stamp => "stamp",
        }
    }

    /// Whether uploads in this role go through grid cropping. Combined and
    /// lot images are already assembled and are only ever extracted.
    pub fn is_cropped(self) -> bool {
        matches!(self, Role::Face | Role::Verso | Role::Stamp)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == wanted)
            .ok_or_else(|| CacheError::InvalidMetadata(format!("unknown role: {s:?}")))
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: CacheError| FromSqlError::Other(Box::new(e)))
    }
}

// ---------------------------------------------------------------------------
// 2. Catalog entries
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDims {
    pub width: u32,
    pub height: u32,
}

/// Caller-supplied description of one upload, as passed to the catalog.
#[derive(Clone, Debug)]
pub struct UploadDescriptor {
    pub content_hash: ContentHash,
    pub role: Role,
    pub original_filename: Option<String>,
    pub byte_size: Option<u64>,
    pub dims: Option<ImageDims>,
}

impl UploadDescriptor {
    pub fn new(content_hash: ContentHash, role: Role) -> Self {
        Self {
            content_hash,
            role,
            original_filename: None,
            byte_size: None,
            dims: None,
        }
    }
}

/// One physically distinct image in one role.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub entry_id: String,
    pub content_hash: ContentHash,
    pub role: Role,
    pub original_filename: Option<String>,
    pub byte_size: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub upload_count: i64,
}

/// Result of `get_or_create`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CatalogHit {
    pub entry_id: String,
    pub upload_count: i64,
    /// True when this call inserted the entry.
    pub created: bool,
}

// ---------------------------------------------------------------------------
// 3. Grid geometry
// ---------------------------------------------------------------------------

/// Position of one crop inside the scanned grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCell {
    pub row: u32,
    pub col: u32,
}

/// Grid boundary definition used to cut a scan into crops.
///
/// Boundaries list every cut position including the image edges, so a grid
/// with `rows` rows has `rows + 1` horizontal boundaries. Boundaries may be
/// empty when only the grid shape is known.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub rows: u32,
    pub cols: u32,
    #[serde(default)]
    pub h_boundaries: Vec<u32>,
    #[serde(default)]
    pub v_boundaries: Vec<u32>,
}

impl GridGeometry {
    /// Build a geometry from complete boundary lists (edges included).
    pub fn from_boundaries(h_boundaries: Vec<u32>, v_boundaries: Vec<u32>) -> CacheResult<Self> {
        let geometry = Self {
            rows: h_boundaries.len().saturating_sub(1) as u32,
            cols: v_boundaries.len().saturating_sub(1) as u32,
            h_boundaries,
            v_boundaries,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Shape-only geometry, used when crops exist but boundaries are unknown.
    pub fn shape(rows: u32, cols: u32) -> Self {
        Self {
            rows,
            cols,
            h_boundaries: Vec::new(),
            v_boundaries: Vec::new(),
        }
    }

    pub fn cell_count(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.rows == 0 || self.cols == 0 {
            return Err(CacheError::InvalidMetadata(format!(
                "grid must have at least one row and column, got {}x{}",
                self.rows, self.cols
            )));
        }
        check_boundaries("horizontal", &self.h_boundaries, self.rows)?;
        check_boundaries("vertical", &self.v_boundaries, self.cols)?;
        Ok(())
    }
}

fn check_boundaries(axis: &str, boundaries: &[u32], cells: u32) -> CacheResult<()> {
    if boundaries.is_empty() {
        return Ok(());
    }
    if boundaries.len() != cells as usize + 1 {
        return Err(CacheError::InvalidMetadata(format!(
            "{axis} boundaries describe {} cells but the grid declares {cells}",
            boundaries.len().saturating_sub(1)
        )));
    }
    if boundaries.windows(2).any(|w| w[0] >= w[1]) {
        return Err(CacheError::InvalidMetadata(format!(
            "{axis} boundaries must be strictly increasing: {boundaries:?}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// 4. Metadata
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostalCardFields {
    pub title: Option<String>,
    pub description: Option<String>,
    pub condition: Option<String>,
    pub price: Option<f64>,
    pub country: Option<String>,
    pub year: Option<i32>,
    pub publisher: Option<String>,
    /// Provider fields with no dedicated slot, in the order received.
    #[serde(flatten)]
    pub extra: FieldMap,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StampFields {
    pub title: Option<String>,
    pub description: Option<String>,
    pub condition: Option<String>,
    pub price: Option<f64>,
    pub country: Option<String>,
    pub year: Option<i32>,
    pub denomination: Option<String>,
    pub catalogue_number: Option<String>,
    /// Provider fields with no dedicated slot, in the order received.
    #[serde(flatten)]
    pub extra: FieldMap,
}

/// Structured result of one AI extraction, tagged by item kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractedFields {
    PostalCard(PostalCardFields),
    Stamp(StampFields),
}

impl ExtractedFields {
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractedFields::PostalCard(_) => "postal_card",
            ExtractedFields::Stamp(_) => "stamp",
        }
    }

    /// Check the shape of the payload; the meaning of the fields is up to
    /// the extraction client.
    pub fn validate(&self) -> CacheResult<()> {
        let (title, price, year) = match self {
            ExtractedFields::PostalCard(f) => (&f.title, f.price, f.year),
            ExtractedFields::Stamp(f) => (&f.title, f.price, f.year),
        };
        if matches!(title, Some(t) if t.trim().is_empty()) {
            return Err(CacheError::InvalidMetadata("title is blank".into()));
        }
        if let Some(price) = price {
            if !price.is_finite() || price < 0.0 {
                return Err(CacheError::InvalidMetadata(format!(
                    "price must be a non-negative number, got {price}"
                )));
            }
        }
        if let Some(year) = year {
            if !(1000..=9999).contains(&year) {
                return Err(CacheError::InvalidMetadata(format!("implausible year {year}")));
            }
        }
        Ok(())
    }

    /// Look up a field by name, including fields carried in `extra`.
    pub fn get(&self, field: &str) -> Option<Value> {
        if field == "kind" {
            return None;
        }
        let Value::Object(map) = serde_json::to_value(self).ok()? else {
            return None;
        };
        map.get(field).filter(|v| !v.is_null()).cloned()
    }
}

/// The automatically extracted metadata layer plus its provenance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutoMetadata {
    pub fields: ExtractedFields,
    pub provider: String,
    pub model: String,
    pub extracted_at: DateTime<Utc>,
}

/// Two-layer metadata: `auto` is replaced wholesale by every extraction,
/// `manual` holds human overrides and is never touched by extraction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub auto: Option<AutoMetadata>,
    #[serde(default)]
    pub manual: FieldMap,
}

impl RecordMetadata {
    pub fn is_empty(&self) -> bool {
        self.auto.is_none() && self.manual.is_empty()
    }

    /// Manual override if present, otherwise the extracted value.
    pub fn effective(&self, field: &str) -> Option<Value> {
        if let Some(v) = self.manual.get(field) {
            return Some(v.clone());
        }
        self.auto.as_ref().and_then(|auto| auto.fields.get(field))
    }
}

// ---------------------------------------------------------------------------
// 5. Processing records
// ---------------------------------------------------------------------------

/// Marketplace listing written back after submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRef {
    pub marketplace: String,
    pub listing_id: String,
    pub listed_at: DateTime<Utc>,
}

/// Cached result of expensive work for one catalog entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub entry_id: String,
    pub artifact_paths: Option<Vec<PathBuf>>,
    pub geometry: Option<GridGeometry>,
    pub artifact_root: Option<PathBuf>,
    pub metadata: RecordMetadata,
    pub listing: Option<ListingRef>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingRecord {
    /// Artifact paths, or an empty slice for entries that were never cropped.
    pub fn artifacts(&self) -> &[PathBuf] {
        self.artifact_paths.as_deref().unwrap_or(&[])
    }
}

/// Tri-state field update for partial upserts.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldUpdate<T> {
    Keep,
    Set(T),
    Clear,
}

impl<T> Default for FieldUpdate<T> {
    fn default() -> Self {
        FieldUpdate::Keep
    }
}

impl<T> FieldUpdate<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, FieldUpdate::Keep)
    }

    pub(crate) fn as_option(&self) -> Option<&T> {
        match self {
            FieldUpdate::Set(v) => Some(v),
            _ => None,
        }
    }
}

/// The fields an upsert touches. Anything left as `Keep` is untouched on
/// an existing record and NULL on a new one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcessingUpdate {
    pub artifact_paths: FieldUpdate<Vec<PathBuf>>,
    pub geometry: FieldUpdate<GridGeometry>,
    pub artifact_root: FieldUpdate<PathBuf>,
    pub metadata: FieldUpdate<AutoMetadata>,
}

impl ProcessingUpdate {
    /// Update written after a successful crop.
    pub fn artifacts(paths: Vec<PathBuf>, geometry: GridGeometry, root: PathBuf) -> Self {
        Self {
            artifact_paths: FieldUpdate::Set(paths),
            geometry: FieldUpdate::Set(geometry),
            artifact_root: FieldUpdate::Set(root),
            metadata: FieldUpdate::Keep,
        }
    }

    /// Update written after an extraction; artifacts are left alone.
    pub fn metadata(auto: AutoMetadata) -> Self {
        Self {
            metadata: FieldUpdate::Set(auto),
            ..Self::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.artifact_paths.is_keep()
            && self.geometry.is_keep()
            && self.artifact_root.is_keep()
            && self.metadata.is_keep()
    }
}

// ---------------------------------------------------------------------------
// 6. Activity
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Uploaded,
    Processed,
    Reused,
    LotCreated,
    Extracted,
    Listed,
}

impl ActivityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityAction::Uploaded => "uploaded",
            ActivityAction::Processed => "processed",
            ActivityAction::Reused => "reused",
            ActivityAction::LotCreated => "lot_created",
            ActivityAction::Extracted => "extracted",
            ActivityAction::Listed => "listed",
        }
    }
}

impl FromStr for ActivityAction {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "uploaded" => ActivityAction::Uploaded,
            "processed" => ActivityAction::Processed,
            "reused" => ActivityAction::Reused,
            "lot_created" => ActivityAction::LotCreated,
            "extracted" => ActivityAction::Extracted,
            "listed" => ActivityAction::Listed,
            other => {
                return Err(CacheError::InvalidMetadata(format!(
                    "unknown activity action: {other:?}"
                )))
            }
        })
    }
}

impl ToSql for ActivityAction {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ActivityAction {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: CacheError| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: i64,
    pub session_id: String,
    pub entry_id: String,
    pub action: ActivityAction,
    pub occurred_at: DateTime<Utc>,
    pub details: Value,
}
