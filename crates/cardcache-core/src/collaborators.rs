//! Interfaces of the external routines the cache drives.
//!
//! The cache never looks inside an image. Cropping, AI extraction and
//! face/verso combination are supplied by the host application through
//! these traits.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::CacheResult;
use crate::models::{ExtractedFields, GridGeometry};

/// Files written by a cropping run plus the grid that produced them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CropOutput {
    pub artifact_files: Vec<PathBuf>,
    pub geometry: GridGeometry,
}

/// Grid detection and cropping.
pub trait Cropper {
    /// Cut `image` into crops written under `out_dir`.
    ///
    /// With `hint == None` the routine detects the grid itself; with a hint
    /// it must reproduce exactly those boundaries.
    fn crop(&self, image: &Path, hint: Option<&GridGeometry>, out_dir: &Path) -> CacheResult<CropOutput>;
}

/// What kind of item an extraction should describe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    PostalCard,
    Stamp,
}

/// Parameters for one extraction call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionProfile {
    pub item_kind: ItemKind,
    /// Requested model; the client may fall back to its default.
    pub model: Option<String>,
    pub instructions: Option<String>,
}

impl ExtractionProfile {
    pub fn new(item_kind: ItemKind) -> Self {
        Self {
            item_kind,
            model: None,
            instructions: None,
        }
    }
}

/// Structured extraction result with provenance.
#[derive(Clone, Debug, PartialEq)]
pub struct Extraction {
    pub fields: ExtractedFields,
    pub provider: String,
    pub model: String,
}

/// AI metadata extraction client.
pub trait Extractor {
    fn extract(&self, image: &Path, profile: &ExtractionProfile) -> CacheResult<Extraction>;
}

/// Face/verso combination routine.
pub trait Combiner {
    /// Combine two related crops into one composite written to `out`.
    /// Returns the path actually written.
    fn combine(&self, a: &Path, b: &Path, geometry: &GridGeometry, out: &Path) -> CacheResult<PathBuf>;

    /// Stack one grid column's composites into a lot image. Routines that
    /// do not produce lots keep the default.
    fn combine_lot(&self, _composites: &[PathBuf], _out: &Path) -> CacheResult<Option<PathBuf>> {
        Ok(None)
    }
}
