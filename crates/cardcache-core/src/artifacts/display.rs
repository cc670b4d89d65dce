//! Display projection: disposable copies of durable artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

/// One artifact that could not be copied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconstituteFailure {
    pub source: PathBuf,
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconstituteReport {
    /// Copies that were written, in source order.
    pub paths: Vec<PathBuf>,
    pub failures: Vec<ReconstituteFailure>,
}

impl ReconstituteReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// File name used for the display copy of `source`.
///
/// Prefixed with the CRC32 of the durable path so crops that share a file
/// name (every entry has a `crop_row0_col0.jpg`) can live in one directory.
pub fn display_name(source: &Path) -> String {
    let crc = crc32fast::hash(source.to_string_lossy().as_bytes());
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    format!("{crc:08x}_{name}")
}

/// Copy each source into `destination`, continuing past failures.
///
/// The durable originals are only read. A copy that cannot be made is
/// reported in `failures`; the rest of the batch still goes through.
pub fn reconstitute(sources: &[PathBuf], destination: &Path) -> ReconstituteReport {
    let mut report = ReconstituteReport::default();
    if let Err(e) = fs::create_dir_all(destination) {
        warn!(dest = %destination.display(), error = %e, "cannot create display directory");
        report.failures = sources
            .iter()
            .map(|source| ReconstituteFailure {
                source: source.clone(),
                error: e.to_string(),
            })
            .collect();
        return report;
    }

    for source in sources {
        let target = destination.join(display_name(source));
        match fs::copy(source, &target) {
            Ok(_) => report.paths.push(target),
            Err(e) => {
                warn!(source = %source.display(), error = %e, "artifact not reconstituted");
                report.failures.push(ReconstituteFailure {
                    source: source.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    debug!(
        copied = report.paths.len(),
        failed = report.failures.len(),
        dest = %destination.display(),
        "reconstituted artifacts"
    );
    report
}
