//! Durable artifact storage.
//!
//! Processing outputs live under a process-independent root laid out as
//! `<root>/<role>/<entry_id>/`. Processing records only ever point into this
//! tree; anything a UI serves is a copy made by [`reconstitute`].
//!
//! An entry's directory is replaced as a whole: new files are written to a
//! hidden staging directory next to it and renamed into place, so a reader
//! sees either the old set, the new set, or (briefly) no set at all, which
//! validates as a miss.

mod display;

pub use display::{display_name, reconstitute, ReconstituteFailure, ReconstituteReport};

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::errors::{CacheError, CacheResult};
use crate::models::Role;
use crate::store::database::resolve_path;

const STAGING_MARKER: &str = ".staging-";
const RETIRED_MARKER: &str = ".retired-";
const SWAP_ATTEMPTS: usize = 8;

/// Where a persisted artifact set ended up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PersistedArtifacts {
    pub paths: Vec<PathBuf>,
    pub root: PathBuf,
}

/// Outcome of checking a cached artifact set against the disk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub all_valid: bool,
    pub checked: usize,
    pub missing: Vec<PathBuf>,
}

/// A referenced artifact is usable when it is a regular, non-empty file.
fn is_usable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Check every referenced path. An empty list is trivially valid.
pub fn validate(paths: &[PathBuf]) -> ValidationReport {
    let missing: Vec<PathBuf> = paths
        .par_iter()
        .filter(|path| !is_usable(path))
        .cloned()
        .collect();
    ValidationReport {
        all_valid: missing.is_empty(),
        checked: paths.len(),
        missing,
    }
}

/// Reject names that are not a single, non-hidden path component.
pub(crate) fn check_dir_name(kind: &str, name: &str) -> CacheResult<()> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) || name.contains("..") {
        return Err(CacheError::InvalidMetadata(format!(
            "{kind} cannot be used as a directory name: {name:?}"
        )));
    }
    Ok(())
}

/// Rename `staging` onto `final_dir`, moving whatever occupies `final_dir`
/// aside first. Every directory moved aside is pushed onto `retired`.
fn rename_into_place(
    staging: &Path,
    final_dir: &Path,
    role_dir: &Path,
    entry_id: &str,
    retired: &mut Vec<PathBuf>,
) -> io::Result<()> {
    let mut attempt = 0;
    loop {
        let err = match fs::rename(staging, final_dir) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        attempt += 1;
        if attempt >= SWAP_ATTEMPTS {
            return Err(err);
        }
        if !final_dir.exists() {
            continue;
        }
        let aside = role_dir.join(format!(".{entry_id}{RETIRED_MARKER}{}", Uuid::new_v4().simple()));
        match fs::rename(final_dir, &aside) {
            Ok(()) => retired.push(aside),
            // Another writer moved it first.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
}

/// The durable artifact tree.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) the artifact tree at `root`.
    pub fn new(root: impl AsRef<Path>) -> CacheResult<Self> {
        let root = resolve_path(root.as_ref())?;
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, role: Role, entry_id: &str) -> PathBuf {
        self.root.join(role.as_str()).join(entry_id)
    }

    /// Copy externally produced files into the entry's durable directory,
    /// replacing any previous set for the same entry.
    ///
    /// Nothing is swapped in unless every source was copied; the sources
    /// themselves are left untouched.
    pub fn persist(
        &self,
        entry_id: &str,
        role: Role,
        sources: &[PathBuf],
    ) -> CacheResult<PersistedArtifacts> {
        check_dir_name("entry id", entry_id)?;
        let mut names = Vec::with_capacity(sources.len());
        let mut seen = HashSet::new();
        for source in sources {
            let name = source.file_name().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("artifact has no file name: {}", source.display()),
                )
            })?;
            if !seen.insert(name.to_os_string()) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("duplicate artifact file name: {}", name.to_string_lossy()),
                )
                .into());
            }
            names.push(name.to_os_string());
        }

        let role_dir = self.root.join(role.as_str());
        fs::create_dir_all(&role_dir)?;
        let final_dir = role_dir.join(entry_id);
        let staging = role_dir.join(format!(".{entry_id}{STAGING_MARKER}{}", Uuid::new_v4().simple()));
        fs::create_dir(&staging)?;

        let copied = sources
            .iter()
            .zip(&names)
            .try_for_each(|(source, name)| fs::copy(source, staging.join(name)).map(|_| ()));
        if let Err(e) = copied {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }

        self.swap_in(&staging, &final_dir, &role_dir, entry_id, &names)?;

        let paths: Vec<PathBuf> = names.iter().map(|name| final_dir.join(name)).collect();
        info!(
            entry_id,
            role = %role,
            artifacts = paths.len(),
            dir = %final_dir.display(),
            "artifacts persisted"
        );
        Ok(PersistedArtifacts {
            paths,
            root: final_dir,
        })
    }

    /// Move `staging` into place as `final_dir`.
    ///
    /// A directory already at `final_dir` (an older set, or one another
    /// writer of the same entry just committed) is moved aside and the
    /// rename retried. If other writers keep winning, their set is accepted
    /// as long as it holds every file this persist was going to write.
    fn swap_in(
        &self,
        staging: &Path,
        final_dir: &Path,
        role_dir: &Path,
        entry_id: &str,
        names: &[OsString],
    ) -> CacheResult<()> {
        let mut retired = Vec::new();
        let swapped = rename_into_place(staging, final_dir, role_dir, entry_id, &mut retired);

        if swapped.is_err() && !final_dir.exists() {
            // Put the most recent set back so the record keeps pointing at files.
            if let Some(previous) = retired.pop() {
                let _ = fs::rename(&previous, final_dir);
            }
        }
        for dir in &retired {
            if let Err(e) = fs::remove_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "could not remove replaced artifact set");
            }
        }

        match swapped {
            Ok(()) => {
                if !retired.is_empty() {
                    debug!(entry_id, replaced = retired.len(), "replaced previous artifact set");
                }
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_dir_all(staging);
                if names.iter().all(|name| is_usable(&final_dir.join(name))) {
                    debug!(entry_id, error = %e, "concurrent persist committed first; keeping its set");
                    return Ok(());
                }
                Err(e.into())
            }
        }
    }

    /// Validate a set of artifact paths (see [`validate`]).
    pub fn validate(&self, paths: &[PathBuf]) -> ValidationReport {
        validate(paths)
    }

    /// Copy artifacts into a disposable destination (see [`reconstitute`]).
    pub fn reconstitute(&self, paths: &[PathBuf], destination: &Path) -> ReconstituteReport {
        reconstitute(paths, destination)
    }

    /// Remove staging and retired directories left behind by an interrupted
    /// persist. Committed entry directories are never touched. Meant to run
    /// at startup, before any persist is in flight.
    pub fn sweep_staging(&self) -> CacheResult<usize> {
        let leftovers: Vec<PathBuf> = WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable path during sweep");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_dir())
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy();
                name.starts_with('.')
                    && (name.contains(STAGING_MARKER) || name.contains(RETIRED_MARKER))
            })
            .map(|entry| entry.into_path())
            .collect();

        let mut removed = 0;
        for dir in leftovers {
            match fs::remove_dir_all(&dir) {
                Ok(()) => removed += 1,
                Err(e) => warn!(dir = %dir.display(), error = %e, "could not remove leftover"),
            }
        }
        if removed > 0 {
            info!(removed, "swept abandoned artifact staging directories");
        }
        Ok(removed)
    }
}
