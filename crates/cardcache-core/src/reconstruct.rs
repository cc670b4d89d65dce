//! On-demand reconstruction of derived artifacts.
//!
//! Composites of a face crop and its verso crop are never stored: they are
//! rebuilt from the two entries' durable crops and geometry whenever they
//! are needed. Entries are paired per session, explicit links first and
//! upload order second.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::artifacts;
use crate::collaborators::Combiner;
use crate::errors::CacheResult;
use crate::models::{GridCell, GridGeometry, ProcessingRecord, Role};
use crate::store::Database;

static CROP_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^crop_row(\d+)_col(\d+)\.[A-Za-z0-9]+$").expect("valid crop name pattern")
});

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SessionInner {
    order: Vec<(Role, String)>,
    links: Vec<(String, String)>,
}

/// The uploads of one session in the order they were made, plus any
/// explicit face/verso links. Shared between request handlers of the same
/// session; passed explicitly wherever pairing happens.
#[derive(Debug)]
pub struct SessionUploads {
    session_id: String,
    inner: Mutex<SessionInner>,
}

impl SessionUploads {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            inner: Mutex::new(SessionInner::default()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record an upload. Re-uploading an entry already in the session keeps
    /// its original position.
    pub fn push(&self, role: Role, entry_id: &str) {
        let mut inner = self.inner.lock();
        if !inner.order.iter().any(|(r, id)| *r == role && id == entry_id) {
            inner.order.push((role, entry_id.to_string()));
        }
    }

    /// Explicitly pair two entries, overriding order-based pairing.
    pub fn link(&self, a: &str, b: &str) {
        self.inner.lock().links.push((a.to_string(), b.to_string()));
    }

    pub fn entries(&self, role: Role) -> Vec<String> {
        self.inner
            .lock()
            .order
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn links(&self) -> Vec<(String, String)> {
        self.inner.lock().links.clone()
    }
}

/// Cooperative cancellation, checked between pairs.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Pairing
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Pairing {
    pub pairs: Vec<(String, String)>,
    /// Entries of either role left without a counterpart.
    pub unmatched: Vec<String>,
}

/// Pair the session's `role_a` entries with its `role_b` entries.
///
/// Links whose ends belong to the two roles are honoured first; the rest
/// are zipped in upload order, so `min(a, b)` pairs are formed in total.
pub fn pair_entries(session: &SessionUploads, role_a: Role, role_b: Role) -> Pairing {
    let side_a = session.entries(role_a);
    let side_b = session.entries(role_b);
    let mut used: HashSet<String> = HashSet::new();
    let mut pairs = Vec::new();

    for (x, y) in session.links() {
        let (a, b) = if side_a.contains(&x) && side_b.contains(&y) {
            (x, y)
        } else if side_a.contains(&y) && side_b.contains(&x) {
            (y, x)
        } else {
            continue;
        };
        if used.contains(&a) || used.contains(&b) {
            continue;
        }
        used.insert(a.clone());
        used.insert(b.clone());
        pairs.push((a, b));
    }

    let rest_a: Vec<&String> = side_a.iter().filter(|id| !used.contains(*id)).collect();
    let rest_b: Vec<&String> = side_b.iter().filter(|id| !used.contains(*id)).collect();
    let n = rest_a.len().min(rest_b.len());
    pairs.extend(
        rest_a
            .iter()
            .zip(&rest_b)
            .map(|(a, b)| ((*a).clone(), (*b).clone())),
    );
    let unmatched = rest_a[n..]
        .iter()
        .chain(&rest_b[n..])
        .map(|id| (*id).clone())
        .collect();

    Pairing { pairs, unmatched }
}

/// Grid cell of every crop, taken from `crop_row{r}_col{c}` file names and
/// falling back to list position for names that do not follow it.
pub fn cell_map(paths: &[PathBuf], geometry: Option<&GridGeometry>) -> BTreeMap<GridCell, PathBuf> {
    let cols = geometry.map(|g| g.cols.max(1)).unwrap_or(1);
    let mut cells = BTreeMap::new();
    for (idx, path) in paths.iter().enumerate() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let cell = match CROP_NAME.captures(&name) {
            Some(caps) => GridCell {
                row: caps[1].parse().unwrap_or(0),
                col: caps[2].parse().unwrap_or(0),
            },
            None => GridCell {
                row: idx as u32 / cols,
                col: idx as u32 % cols,
            },
        };
        if cells.contains_key(&cell) {
            warn!(path = %path.display(), ?cell, "two crops map to one grid cell; keeping the first");
            continue;
        }
        cells.insert(cell, path.clone());
    }
    cells
}

// ---------------------------------------------------------------------------
// Reconstruction
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Composite {
    pub a_entry: String,
    pub b_entry: String,
    pub cell: GridCell,
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LotArtifact {
    pub a_entry: String,
    pub b_entry: String,
    pub column: u32,
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedPair {
    pub a_entry: String,
    pub b_entry: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconstructionReport {
    pub composites: Vec<Composite>,
    pub lots: Vec<LotArtifact>,
    pub skipped: Vec<SkippedPair>,
    pub unmatched: Vec<String>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

struct PairOutput {
    composites: Vec<Composite>,
    lots: Vec<LotArtifact>,
    warnings: Vec<String>,
}

/// Rebuilds composites for the pairs of one session.
pub struct Reconstructor<'a> {
    db: &'a Database,
    combiner: &'a dyn Combiner,
}

impl<'a> Reconstructor<'a> {
    pub fn new(db: &'a Database, combiner: &'a dyn Combiner) -> Self {
        Self { db, combiner }
    }

    /// Rebuild every composite for the session's `roles.0`/`roles.1` pairs
    /// under `out_dir`.
    ///
    /// Count mismatches and broken pairs are reported, not raised. Only
    /// failing to create `out_dir` aborts the run.
    pub fn run(
        &self,
        session: &SessionUploads,
        roles: (Role, Role),
        out_dir: &Path,
        cancel: &CancelFlag,
    ) -> CacheResult<ReconstructionReport> {
        std::fs::create_dir_all(out_dir)?;
        let pairing = pair_entries(session, roles.0, roles.1);
        let mut report = ReconstructionReport {
            unmatched: pairing.unmatched.clone(),
            ..ReconstructionReport::default()
        };
        if !pairing.unmatched.is_empty() {
            let msg = format!(
                "{} {} vs {} {} entries; {} left unpaired",
                session.entries(roles.0).len(),
                roles.0,
                session.entries(roles.1).len(),
                roles.1,
                pairing.unmatched.len()
            );
            warn!(session_id = session.session_id(), "{msg}");
            report.warnings.push(msg);
        }

        for (a_id, b_id) in &pairing.pairs {
            if cancel.is_cancelled() {
                info!(session_id = session.session_id(), "reconstruction cancelled");
                report.cancelled = true;
                break;
            }
            match self.reconstruct_pair(a_id, b_id, out_dir) {
                Ok(out) => {
                    report.composites.extend(out.composites);
                    report.lots.extend(out.lots);
                    report.warnings.extend(out.warnings);
                }
                Err(reason) => {
                    warn!(a_entry = %a_id, b_entry = %b_id, %reason, "pair skipped");
                    report.skipped.push(SkippedPair {
                        a_entry: a_id.clone(),
                        b_entry: b_id.clone(),
                        reason,
                    });
                }
            }
        }

        info!(
            session_id = session.session_id(),
            composites = report.composites.len(),
            lots = report.lots.len(),
            skipped = report.skipped.len(),
            unmatched = report.unmatched.len(),
            "reconstruction finished"
        );
        Ok(report)
    }

    fn load_valid(&self, entry_id: &str) -> Result<ProcessingRecord, String> {
        let record = match self.db.get_record(entry_id) {
            Ok(Some(record)) => record,
            Ok(None) => return Err(format!("entry {entry_id} was never processed")),
            Err(e) => return Err(format!("could not read entry {entry_id}: {e}")),
        };
        if record.artifacts().is_empty() {
            return Err(format!("entry {entry_id} has no crops"));
        }
        let validation = artifacts::validate(record.artifacts());
        if !validation.all_valid {
            return Err(format!(
                "entry {entry_id} is missing {} of {} crops",
                validation.missing.len(),
                validation.checked
            ));
        }
        Ok(record)
    }

    fn reconstruct_pair(&self, a_id: &str, b_id: &str, out_dir: &Path) -> Result<PairOutput, String> {
        let a = self.load_valid(a_id)?;
        let b = self.load_valid(b_id)?;
        let cells_a = cell_map(a.artifacts(), a.geometry.as_ref());
        let cells_b = cell_map(b.artifacts(), b.geometry.as_ref());

        let geometry = match a.geometry.clone().or_else(|| b.geometry.clone()) {
            Some(g) => g,
            None => {
                let rows = cells_a.keys().map(|c| c.row + 1).max().unwrap_or(1);
                let cols = cells_a.keys().map(|c| c.col + 1).max().unwrap_or(1);
                GridGeometry::shape(rows, cols)
            }
        };

        let pair_dir = out_dir.join(format!("{a_id}__{b_id}"));
        std::fs::create_dir_all(&pair_dir).map_err(|e| format!("cannot create {}: {e}", pair_dir.display()))?;

        let mut out = PairOutput {
            composites: Vec::new(),
            lots: Vec::new(),
            warnings: Vec::new(),
        };
        let mut by_column: BTreeMap<u32, Vec<PathBuf>> = BTreeMap::new();

        for (cell, path_a) in &cells_a {
            let Some(path_b) = cells_b.get(cell) else {
                out.warnings.push(format!(
                    "{a_id}: crop at row {} col {} has no counterpart in {b_id}",
                    cell.row, cell.col
                ));
                continue;
            };
            let target = pair_dir.join(format!("combined_row{}_col{}.jpg", cell.row, cell.col));
            match self.combiner.combine(path_a, path_b, &geometry, &target) {
                Ok(path) => {
                    by_column.entry(cell.col).or_default().push(path.clone());
                    out.composites.push(Composite {
                        a_entry: a_id.to_string(),
                        b_entry: b_id.to_string(),
                        cell: *cell,
                        path,
                    });
                }
                Err(e) => out.warnings.push(format!(
                    "combining row {} col {} of {a_id}/{b_id} failed: {e}",
                    cell.row, cell.col
                )),
            }
        }
        for cell in cells_b.keys().filter(|cell| !cells_a.contains_key(*cell)) {
            out.warnings.push(format!(
                "{b_id}: crop at row {} col {} has no counterpart in {a_id}",
                cell.row, cell.col
            ));
        }

        for (column, composites) in by_column {
            let target = pair_dir.join(format!("lot_column_{}.jpg", column + 1));
            match self.combiner.combine_lot(&composites, &target) {
                Ok(Some(path)) => out.lots.push(LotArtifact {
                    a_entry: a_id.to_string(),
                    b_entry: b_id.to_string(),
                    column,
                    path,
                }),
                Ok(None) => {}
                Err(e) => out.warnings.push(format!("lot for column {} failed: {e}", column + 1)),
            }
        }

        debug!(a_entry = a_id, b_entry = b_id, composites = out.composites.len(), "pair reconstructed");
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::CacheError;
    use crate::identity::resolve_bytes;
    use crate::models::{ProcessingUpdate, UploadDescriptor};
    use crate::store::database::tests::temp_db;
    use std::fs;

    /// Writes the two inputs' names into the composite so tests can check
    /// which crops were combined.
    pub(crate) struct ConcatCombiner {
        pub lots: bool,
    }

    impl Combiner for ConcatCombiner {
        fn combine(&self, a: &Path, b: &Path, _geometry: &GridGeometry, out: &Path) -> CacheResult<PathBuf> {
            let body = format!("{}+{}", a.display(), b.display());
            fs::write(out, body)?;
            Ok(out.to_path_buf())
        }

        fn combine_lot(&self, composites: &[PathBuf], out: &Path) -> CacheResult<Option<PathBuf>> {
            if !self.lots {
                return Ok(None);
            }
            fs::write(out, format!("{}", composites.len()))?;
            Ok(Some(out.to_path_buf()))
        }
    }

    /// Flips the cancel flag from inside the first `combine` call, the way
    /// a UI cancel lands while a pair is being worked on.
    struct CancellingCombiner {
        cancel: CancelFlag,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl Combiner for CancellingCombiner {
        fn combine(&self, a: &Path, b: &Path, geometry: &GridGeometry, out: &Path) -> CacheResult<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.cancel.cancel();
            ConcatCombiner { lots: false }.combine(a, b, geometry, out)
        }
    }

    struct FailingCombiner;

    impl Combiner for FailingCombiner {
        fn combine(&self, _a: &Path, _b: &Path, _g: &GridGeometry, _out: &Path) -> CacheResult<PathBuf> {
            Err(CacheError::collaborator("combine", "opencv exploded"))
        }
    }

    /// Create a processed entry whose crops exist on disk.
    fn processed_entry(db: &Database, root: &Path, tag: &str, role: Role, names: &[&str]) -> String {
        let id = db
            .get_or_create_entry(&UploadDescriptor::new(resolve_bytes(tag.as_bytes()), role))
            .unwrap()
            .entry_id;
        let dir = root.join(role.as_str()).join(&id);
        fs::create_dir_all(&dir).unwrap();
        let paths: Vec<PathBuf> = names
            .iter()
            .map(|n| {
                let p = dir.join(n);
                fs::write(&p, tag).unwrap();
                p
            })
            .collect();
        db.upsert_processing(&id, &ProcessingUpdate::artifacts(paths, GridGeometry::shape(2, 2), dir))
            .unwrap();
        id
    }

    #[test]
    fn test_pairing_by_order_with_mismatch() {
        let session = SessionUploads::new("s");
        for id in ["f1", "f2", "f3"] {
            session.push(Role::Face, id);
        }
        for id in ["v1", "v2"] {
            session.push(Role::Verso, id);
        }
        session.push(Role::Face, "f1");
        let pairing = pair_entries(&session, Role::Face, Role::Verso);
        assert_eq!(
            pairing.pairs,
            vec![("f1".to_string(), "v1".to_string()), ("f2".to_string(), "v2".to_string())]
        );
        assert_eq!(pairing.unmatched, vec!["f3".to_string()]);
    }

    #[test]
    fn test_explicit_links_take_precedence() {
        let session = SessionUploads::new("s");
        session.push(Role::Face, "f1");
        session.push(Role::Face, "f2");
        session.push(Role::Verso, "v1");
        session.push(Role::Verso, "v2");
        // Linked in either orientation.
        session.link("v1", "f2");
        let pairing = pair_entries(&session, Role::Face, Role::Verso);
        assert_eq!(
            pairing.pairs,
            vec![("f2".to_string(), "v1".to_string()), ("f1".to_string(), "v2".to_string())]
        );
        assert!(pairing.unmatched.is_empty());
    }

    #[test]
    fn test_cell_map_parses_names_and_falls_back_to_position() {
        let paths = vec![
            PathBuf::from("/d/crop_row1_col0.jpg"),
            PathBuf::from("/d/crop_row0_col1.png"),
            PathBuf::from("/d/scan-3.jpg"),
        ];
        let cells = cell_map(&paths, Some(&GridGeometry::shape(2, 2)));
        assert_eq!(cells[&GridCell { row: 1, col: 0 }], paths[0]);
        assert_eq!(cells[&GridCell { row: 0, col: 1 }], paths[1]);
        // Third item, two columns: row 1, col 0 is taken, so it is dropped.
        assert_eq!(cells.len(), 2);

        let loose = cell_map(&[PathBuf::from("a.jpg"), PathBuf::from("b.jpg")], None);
        assert!(loose.contains_key(&GridCell { row: 1, col: 0 }));
    }

    #[test]
    fn test_three_faces_two_versos_make_two_composites() {
        let (tmp, db) = temp_db();
        let root = tmp.path().join("durable");
        let session = SessionUploads::new("s1");
        for i in 0..3 {
            let id = processed_entry(&db, &root, &format!("face{i}"), Role::Face, &["crop_row0_col0.jpg"]);
            session.push(Role::Face, &id);
        }
        for i in 0..2 {
            let id = processed_entry(&db, &root, &format!("verso{i}"), Role::Verso, &["crop_row0_col0.jpg"]);
            session.push(Role::Verso, &id);
        }

        let combiner = ConcatCombiner { lots: false };
        let report = Reconstructor::new(&db, &combiner)
            .run(&session, (Role::Face, Role::Verso), &tmp.path().join("out"), &CancelFlag::new())
            .unwrap();
        assert_eq!(report.composites.len(), 2);
        assert_eq!(report.unmatched.len(), 1);
        assert_eq!(report.unmatched[0], session.entries(Role::Face)[2]);
        assert!(report.skipped.is_empty());
        assert!(!report.warnings.is_empty());
        assert!(report.composites.iter().all(|c| c.path.exists()));
    }

    #[test]
    fn test_cells_are_matched_by_position_and_lots_built_per_column() {
        let (tmp, db) = temp_db();
        let root = tmp.path().join("durable");
        let session = SessionUploads::new("s1");
        let face = processed_entry(
            &db,
            &root,
            "face",
            Role::Face,
            &["crop_row0_col0.jpg", "crop_row1_col0.jpg", "crop_row0_col1.jpg"],
        );
        let verso = processed_entry(&db, &root, "verso", Role::Verso, &["crop_row1_col0.jpg", "crop_row0_col0.jpg"]);
        session.push(Role::Face, &face);
        session.push(Role::Verso, &verso);

        let combiner = ConcatCombiner { lots: true };
        let report = Reconstructor::new(&db, &combiner)
            .run(&session, (Role::Face, Role::Verso), &tmp.path().join("out"), &CancelFlag::new())
            .unwrap();

        assert_eq!(report.composites.len(), 2);
        let body = fs::read_to_string(&report.composites[1].path).unwrap();
        assert!(body.contains(&format!("{face}/crop_row1_col0.jpg")));
        assert!(body.contains(&format!("{verso}/crop_row1_col0.jpg")));
        // Column 1 exists only on the face side.
        assert!(report.warnings.iter().any(|w| w.contains("row 0 col 1")));
        assert_eq!(report.lots.len(), 1);
        assert_eq!(report.lots[0].column, 0);
        assert!(report.lots[0].path.ends_with("lot_column_1.jpg"));
    }

    #[test]
    fn test_pair_with_missing_crops_is_skipped_not_fatal() {
        let (tmp, db) = temp_db();
        let root = tmp.path().join("durable");
        let session = SessionUploads::new("s1");
        let f1 = processed_entry(&db, &root, "f1", Role::Face, &["crop_row0_col0.jpg"]);
        let f2 = processed_entry(&db, &root, "f2", Role::Face, &["crop_row0_col0.jpg"]);
        let v1 = processed_entry(&db, &root, "v1", Role::Verso, &["crop_row0_col0.jpg"]);
        let v2 = processed_entry(&db, &root, "v2", Role::Verso, &["crop_row0_col0.jpg"]);
        for (role, id) in [(Role::Face, &f1), (Role::Face, &f2), (Role::Verso, &v1), (Role::Verso, &v2)] {
            session.push(role, id);
        }
        fs::remove_dir_all(root.join("face").join(&f1)).unwrap();

        let combiner = ConcatCombiner { lots: false };
        let report = Reconstructor::new(&db, &combiner)
            .run(&session, (Role::Face, Role::Verso), &tmp.path().join("out"), &CancelFlag::new())
            .unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].a_entry, f1);
        assert_eq!(report.composites.len(), 1);
        assert_eq!(report.composites[0].a_entry, f2);
    }

    #[test]
    fn test_combiner_failures_are_isolated_per_cell() {
        let (tmp, db) = temp_db();
        let root = tmp.path().join("durable");
        let session = SessionUploads::new("s1");
        session.push(Role::Face, &processed_entry(&db, &root, "f", Role::Face, &["crop_row0_col0.jpg"]));
        session.push(Role::Verso, &processed_entry(&db, &root, "v", Role::Verso, &["crop_row0_col0.jpg"]));

        let report = Reconstructor::new(&db, &FailingCombiner)
            .run(&session, (Role::Face, Role::Verso), &tmp.path().join("out"), &CancelFlag::new())
            .unwrap();
        assert!(report.composites.is_empty());
        assert!(report.warnings.iter().any(|w| w.contains("opencv exploded")));
    }

    #[test]
    fn test_cancelled_before_first_pair() {
        let (tmp, db) = temp_db();
        let root = tmp.path().join("durable");
        let session = SessionUploads::new("s1");
        session.push(Role::Face, &processed_entry(&db, &root, "f", Role::Face, &["crop_row0_col0.jpg"]));
        session.push(Role::Verso, &processed_entry(&db, &root, "v", Role::Verso, &["crop_row0_col0.jpg"]));

        let cancel = CancelFlag::new();
        cancel.cancel();
        let combiner = ConcatCombiner { lots: false };
        let report = Reconstructor::new(&db, &combiner)
            .run(&session, (Role::Face, Role::Verso), &tmp.path().join("out"), &cancel)
            .unwrap();
        assert!(report.cancelled);
        assert!(report.composites.is_empty());
    }

    #[test]
    fn test_cancel_during_combine_finishes_current_pair_only() {
        let (tmp, db) = temp_db();
        let root = tmp.path().join("durable");
        let session = SessionUploads::new("s1");
        let cell = ["crop_row0_col0.jpg"];
        let f1 = processed_entry(&db, &root, "f1", Role::Face, &cell);
        let f2 = processed_entry(&db, &root, "f2", Role::Face, &cell);
        let v1 = processed_entry(&db, &root, "v1", Role::Verso, &cell);
        let v2 = processed_entry(&db, &root, "v2", Role::Verso, &cell);
        session.push(Role::Face, &f1);
        session.push(Role::Face, &f2);
        session.push(Role::Verso, &v1);
        session.push(Role::Verso, &v2);

        let cancel = CancelFlag::new();
        let combiner = CancellingCombiner {
            cancel: cancel.clone(),
            calls: Default::default(),
        };
        let report = Reconstructor::new(&db, &combiner)
            .run(&session, (Role::Face, Role::Verso), &tmp.path().join("out"), &cancel)
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(combiner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.composites.len(), 1);
        assert_eq!(report.composites[0].a_entry, f1);
        assert_eq!(report.composites[0].b_entry, v1);
        assert!(report.composites[0].path.exists());
        assert!(report.skipped.is_empty());
    }
}
