//! The processing cache facade.
//!
//! Drives one upload through identity resolution, the catalog, the reuse
//! decision and (on a miss) cropping and persistence, and records every
//! transition in the activity log.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifacts::{self, ArtifactStore, ReconstituteReport};
use crate::collaborators::{Combiner, Cropper, ExtractionProfile, Extractor};
use crate::config::CacheConfig;
use crate::errors::{CacheError, CacheResult};
use crate::identity::{self, ContentHash, UploadIdentity};
use crate::models::{
    ActivityAction, ActivityRecord, AutoMetadata, CatalogHit, FieldMap, GridGeometry, ImageDims,
    ListingRef, ProcessingRecord, ProcessingUpdate, Role, UploadDescriptor,
};
use crate::reconstruct::{CancelFlag, ReconstructionReport, Reconstructor, SessionUploads};
use crate::store::{ActivityLog, Database};

/// One uploaded file and the role the user declared for it.
#[derive(Clone, Debug)]
pub struct Upload {
    pub path: PathBuf,
    pub role: Role,
    /// Name the user uploaded; defaults to the file name of `path`.
    pub original_filename: Option<String>,
    pub dims: Option<ImageDims>,
}

impl Upload {
    pub fn new(path: impl Into<PathBuf>, role: Role) -> Self {
        Self {
            path: path.into(),
            role,
            original_filename: None,
            dims: None,
        }
    }
}

/// How an upload was served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadStatus {
    /// Valid cached artifacts were reused; nothing was cropped.
    Reused,
    /// The cropping routine ran. `recropped` is set when a previous
    /// artifact set existed but failed validation.
    Processed { recropped: bool },
    /// The role is not cropped; the entry was catalogued only.
    Uncropped,
    /// The catalog was unavailable; the upload was processed without caching.
    Unidentified,
}

#[derive(Clone, Debug, Serialize)]
pub struct UploadOutcome {
    pub content_hash: ContentHash,
    pub role: Role,
    /// `None` only when the upload is [`UploadStatus::Unidentified`].
    pub entry_id: Option<String>,
    pub upload_count: Option<i64>,
    pub status: UploadStatus,
    pub record: Option<ProcessingRecord>,
    /// Disposable copies of the artifacts for this session.
    pub display: ReconstituteReport,
}

/// Content-addressable processing cache.
#[derive(Clone, Debug)]
pub struct ProcessingCache {
    db: Database,
    store: ArtifactStore,
    activity: ActivityLog,
    display_root: PathBuf,
}

impl ProcessingCache {
    /// Validate `config`, open the database (migrating it) and the artifact
    /// tree, and clear staging directories left by an earlier crash.
    pub fn open(config: &CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let db = Database::open(&config.db_path)?.with_busy_timeout(config.busy_timeout());
        let store = ArtifactStore::new(&config.artifact_root)?;
        store.sweep_staging()?;
        let cache = Self::from_parts(db, store, &config.display_root)?;
        info!(
            db = %cache.db.db_path().display(),
            artifacts = %cache.store.root().display(),
            "processing cache opened"
        );
        Ok(cache)
    }

    /// Assemble a cache from already opened parts. The schema is not touched.
    pub fn from_parts(db: Database, store: ArtifactStore, display_root: &Path) -> CacheResult<Self> {
        fs::create_dir_all(display_root)?;
        Ok(Self {
            activity: ActivityLog::new(db.clone()),
            db,
            store,
            display_root: display_root.to_path_buf(),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    /// Display directory of one session. The id must be a plain directory
    /// name so the session stays inside the display root.
    pub fn session_display_dir(&self, session_id: &str) -> CacheResult<PathBuf> {
        artifacts::check_dir_name("session id", session_id)?;
        Ok(self.display_root.join(session_id))
    }

    // -- Store pass-throughs ------------------------------------------------

    pub fn lookup(&self, content_hash: &ContentHash, role: Role) -> CacheResult<Option<ProcessingRecord>> {
        self.db.lookup(content_hash, role)
    }

    pub fn get_or_create_entry(&self, upload: &UploadDescriptor) -> CacheResult<CatalogHit> {
        self.db.get_or_create_entry(upload)
    }

    pub fn upsert_processing(&self, entry_id: &str, update: &ProcessingUpdate) -> CacheResult<ProcessingRecord> {
        self.db.upsert_processing(entry_id, update)
    }

    pub fn list_activity(&self, session_id: &str) -> CacheResult<Vec<ActivityRecord>> {
        self.activity.list(session_id)
    }

    // -- Upload flow --------------------------------------------------------

    /// Serve one upload, reusing cached artifacts when they are still valid.
    ///
    /// A cache that cannot be reached does not fail the upload: it is
    /// cropped into the session's display directory and reported as
    /// [`UploadStatus::Unidentified`].
    pub fn ingest_upload(
        &self,
        session: &SessionUploads,
        upload: &Upload,
        cropper: &dyn Cropper,
    ) -> CacheResult<UploadOutcome> {
        let display_dir = self.session_display_dir(session.session_id())?;
        let probed = identity::probe(&upload.path)?;
        let descriptor = UploadDescriptor {
            content_hash: probed.content_hash.clone(),
            role: upload.role,
            original_filename: upload
                .original_filename
                .clone()
                .or_else(|| probed.original_filename.clone()),
            byte_size: Some(probed.byte_size),
            dims: upload.dims,
        };

        let hit = match self.db.get_or_create_entry(&descriptor) {
            Ok(hit) => hit,
            Err(e) if e.is_storage() => {
                warn!(
                    hash = probed.content_hash.short(),
                    error = %e,
                    "catalog unavailable, processing upload without caching"
                );
                return self.process_uncached(session, upload, probed, cropper);
            }
            Err(e) => return Err(e),
        };
        let entry_id = hit.entry_id.clone();
        session.push(upload.role, &entry_id);
        self.activity.append(
            session.session_id(),
            &entry_id,
            ActivityAction::Uploaded,
            json!({
                "upload_count": hit.upload_count,
                "created": hit.created,
                "filename": descriptor.original_filename,
            }),
        );

        let prior = self.db.get_record(&entry_id)?;
        let mut outcome = UploadOutcome {
            content_hash: probed.content_hash,
            role: upload.role,
            entry_id: Some(entry_id.clone()),
            upload_count: Some(hit.upload_count),
            status: UploadStatus::Uncropped,
            record: None,
            display: ReconstituteReport::default(),
        };

        if !upload.role.is_cropped() {
            outcome.record = prior;
            return Ok(outcome);
        }

        let mut hint = None;
        let mut recropped = false;
        if let Some(record) = prior.filter(|r| !r.artifacts().is_empty()) {
            let report = self.store.validate(record.artifacts());
            if report.all_valid {
                outcome.display = self.store.reconstitute(record.artifacts(), &display_dir);
                self.activity.append(
                    session.session_id(),
                    &entry_id,
                    ActivityAction::Reused,
                    json!({ "artifacts": record.artifacts().len() }),
                );
                info!(entry_id = %entry_id, artifacts = report.checked, "cached artifacts reused");
                outcome.status = UploadStatus::Reused;
                outcome.record = Some(record);
                return Ok(outcome);
            }
            warn!(
                entry_id = %entry_id,
                missing = report.missing.len(),
                checked = report.checked,
                "cached artifacts failed validation, recropping"
            );
            hint = record.geometry;
            recropped = true;
        }

        let record = self.recrop(&entry_id, upload, hint.as_ref(), cropper)?;
        outcome.display = self.store.reconstitute(record.artifacts(), &display_dir);
        self.activity.append(
            session.session_id(),
            &entry_id,
            ActivityAction::Processed,
            json!({ "artifacts": record.artifacts().len(), "recropped": recropped }),
        );
        outcome.status = UploadStatus::Processed { recropped };
        outcome.record = Some(record);
        Ok(outcome)
    }

    /// Crop into scratch space, persist durably and point the record at the
    /// new set. `hint` carries the previous geometry so a recrop reproduces
    /// the same grid.
    fn recrop(
        &self,
        entry_id: &str,
        upload: &Upload,
        hint: Option<&GridGeometry>,
        cropper: &dyn Cropper,
    ) -> CacheResult<ProcessingRecord> {
        let scratch = self
            .display_root
            .join(format!(".crop-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&scratch)?;
        let result = self.crop_and_persist(entry_id, upload, hint, cropper, &scratch);
        if let Err(e) = fs::remove_dir_all(&scratch) {
            warn!(dir = %scratch.display(), error = %e, "could not remove crop scratch directory");
        }
        result
    }

    fn crop_and_persist(
        &self,
        entry_id: &str,
        upload: &Upload,
        hint: Option<&GridGeometry>,
        cropper: &dyn Cropper,
        scratch: &Path,
    ) -> CacheResult<ProcessingRecord> {
        let output = cropper.crop(&upload.path, hint, scratch)?;
        let persisted = self
            .store
            .persist(entry_id, upload.role, &output.artifact_files)?;
        debug!(entry_id, artifacts = persisted.paths.len(), "crop output persisted");
        self.db.upsert_processing(
            entry_id,
            &ProcessingUpdate::artifacts(persisted.paths, output.geometry, persisted.root),
        )
    }

    fn process_uncached(
        &self,
        session: &SessionUploads,
        upload: &Upload,
        identity: UploadIdentity,
        cropper: &dyn Cropper,
    ) -> CacheResult<UploadOutcome> {
        let mut display = ReconstituteReport::default();
        if upload.role.is_cropped() {
            let dir = self
                .session_display_dir(session.session_id())?
                .join(format!("uncached-{}", identity.content_hash.short()));
            fs::create_dir_all(&dir)?;
            display.paths = cropper.crop(&upload.path, None, &dir)?.artifact_files;
        }
        Ok(UploadOutcome {
            content_hash: identity.content_hash,
            role: upload.role,
            entry_id: None,
            upload_count: None,
            status: UploadStatus::Unidentified,
            record: None,
            display,
        })
    }

    // -- Metadata -------------------------------------------------------------

    /// Run the extraction client on `image` and replace the entry's
    /// extracted metadata layer. Artifacts and manual overrides are kept.
    pub fn extract_metadata(
        &self,
        session_id: &str,
        entry_id: &str,
        image: &Path,
        extractor: &dyn Extractor,
        profile: &ExtractionProfile,
    ) -> CacheResult<ProcessingRecord> {
        // Fail before paying for an extraction call.
        if self.db.get_entry(entry_id)?.is_none() {
            return Err(CacheError::Referential {
                entry_id: entry_id.to_string(),
            });
        }
        let extraction = extractor.extract(image, profile)?;
        let auto = AutoMetadata {
            fields: extraction.fields,
            provider: extraction.provider,
            model: extraction.model,
            extracted_at: Utc::now(),
        };
        let details = json!({
            "provider": auto.provider,
            "model": auto.model,
            "kind": auto.fields.kind(),
        });
        let record = self.db.upsert_processing(entry_id, &ProcessingUpdate::metadata(auto))?;
        self.activity
            .append(session_id, entry_id, ActivityAction::Extracted, details);
        Ok(record)
    }

    pub fn set_manual_fields(&self, entry_id: &str, fields: &FieldMap) -> CacheResult<ProcessingRecord> {
        self.db.set_manual_fields(entry_id, fields)
    }

    /// Marketplace write-back after a successful submission.
    pub fn record_listing(
        &self,
        session_id: &str,
        entry_id: &str,
        listing: &ListingRef,
    ) -> CacheResult<ProcessingRecord> {
        let record = self.db.record_listing(entry_id, listing)?;
        self.activity.append(
            session_id,
            entry_id,
            ActivityAction::Listed,
            json!({ "marketplace": listing.marketplace, "listing_id": listing.listing_id }),
        );
        Ok(record)
    }

    // -- Display and reconstruction ------------------------------------------

    /// Copy an entry's durable artifacts into `dest` for display.
    ///
    /// An entry that was never processed yields an empty report.
    pub fn reconstitute_for_display(&self, entry_id: &str, dest: &Path) -> CacheResult<ReconstituteReport> {
        if self.db.get_entry(entry_id)?.is_none() {
            return Err(CacheError::Referential {
                entry_id: entry_id.to_string(),
            });
        }
        Ok(match self.db.get_record(entry_id)? {
            Some(record) => artifacts::reconstitute(record.artifacts(), dest),
            None => ReconstituteReport::default(),
        })
    }

    /// Rebuild the session's face/verso composites (and lots, if the
    /// combiner produces them) under the session's display directory.
    pub fn reconstruct_pairs(
        &self,
        session: &SessionUploads,
        roles: (Role, Role),
        combiner: &dyn Combiner,
        cancel: &CancelFlag,
    ) -> CacheResult<ReconstructionReport> {
        let out_dir = self
            .session_display_dir(session.session_id())?
            .join("composites");
        let report = Reconstructor::new(&self.db, combiner).run(session, roles, &out_dir, cancel)?;
        for lot in &report.lots {
            self.activity.append(
                session.session_id(),
                &lot.a_entry,
                ActivityAction::LotCreated,
                json!({
                    "paired_with": lot.b_entry,
                    "column": lot.column + 1,
                    "path": lot.path,
                }),
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CropOutput, Extraction, ItemKind};
    use crate::models::{ExtractedFields, FieldUpdate, PostalCardFields};
    use crate::reconstruct::tests::ConcatCombiner;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Cuts every image into two rows and remembers the hints it was given.
    #[derive(Default)]
    struct FakeCropper {
        hints: Mutex<Vec<Option<GridGeometry>>>,
    }

    impl FakeCropper {
        fn calls(&self) -> usize {
            self.hints.lock().len()
        }
    }

    impl Cropper for FakeCropper {
        fn crop(&self, image: &Path, hint: Option<&GridGeometry>, out_dir: &Path) -> CacheResult<CropOutput> {
            self.hints.lock().push(hint.cloned());
            let geometry = match hint {
                Some(g) => g.clone(),
                None => GridGeometry::from_boundaries(vec![0, 50, 100], vec![0, 80])?,
            };
            let body = fs::read(image)?;
            let mut artifact_files = Vec::new();
            for row in 0..geometry.rows {
                let path = out_dir.join(format!("crop_row{row}_col0.jpg"));
                fs::write(&path, &body)?;
                artifact_files.push(path);
            }
            Ok(CropOutput {
                artifact_files,
                geometry,
            })
        }
    }

    struct FakeExtractor {
        model: &'static str,
        title: &'static str,
    }

    impl Extractor for FakeExtractor {
        fn extract(&self, _image: &Path, profile: &ExtractionProfile) -> CacheResult<Extraction> {
            assert_eq!(profile.item_kind, ItemKind::PostalCard);
            let fields = PostalCardFields {
                title: Some(self.title.to_string()),
                ..PostalCardFields::default()
            };
            Ok(Extraction {
                fields: ExtractedFields::PostalCard(fields),
                provider: "acme-vision".to_string(),
                model: self.model.to_string(),
            })
        }
    }

    fn setup() -> (TempDir, CacheConfig, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::under(tmp.path().join("state"));
        config.allow_ephemeral_root = true;
        let scan = tmp.path().join("uploads/scan_001.jpg");
        fs::create_dir_all(scan.parent().unwrap()).unwrap();
        fs::write(&scan, b"fake jpeg of a 2x1 grid").unwrap();
        (tmp, config, scan)
    }

    #[test]
    fn test_same_file_twice_is_cropped_once() {
        let (_tmp, config, scan) = setup();
        let cache = ProcessingCache::open(&config).unwrap();
        let cropper = FakeCropper::default();
        let session = SessionUploads::new("s1");

        let first = cache.ingest_upload(&session, &Upload::new(&scan, Role::Face), &cropper).unwrap();
        assert_eq!(first.status, UploadStatus::Processed { recropped: false });
        assert_eq!(first.upload_count, Some(1));
        assert_eq!(first.display.paths.len(), 2);

        let second = cache.ingest_upload(&session, &Upload::new(&scan, Role::Face), &cropper).unwrap();
        assert_eq!(second.status, UploadStatus::Reused);
        assert_eq!(second.entry_id, first.entry_id);
        assert_eq!(second.upload_count, Some(2));
        assert_eq!(cropper.calls(), 1);
        assert_eq!(cache.database().count_entries().unwrap(), 1);
        assert_eq!(cache.database().count_records().unwrap(), 1);

        let actions: Vec<ActivityAction> = cache
            .list_activity("s1")
            .unwrap()
            .into_iter()
            .map(|r| r.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                ActivityAction::Uploaded,
                ActivityAction::Processed,
                ActivityAction::Uploaded,
                ActivityAction::Reused,
            ]
        );
        // Re-uploading does not add the entry to the session twice.
        assert_eq!(session.entries(Role::Face).len(), 1);
    }

    #[test]
    fn test_restart_reuses_without_cropping() {
        let (_tmp, config, scan) = setup();
        let first_paths = {
            let cache = ProcessingCache::open(&config).unwrap();
            let outcome = cache
                .ingest_upload(&SessionUploads::new("s1"), &Upload::new(&scan, Role::Verso), &FakeCropper::default())
                .unwrap();
            outcome.record.unwrap().artifact_paths.unwrap()
        };

        let cache = ProcessingCache::open(&config).unwrap();
        let cropper = FakeCropper::default();
        let outcome = cache
            .ingest_upload(&SessionUploads::new("s2"), &Upload::new(&scan, Role::Verso), &cropper)
            .unwrap();
        assert_eq!(outcome.status, UploadStatus::Reused);
        assert_eq!(cropper.calls(), 0);
        assert_eq!(outcome.record.unwrap().artifact_paths.unwrap(), first_paths);
        assert!(first_paths.iter().all(|p| p.starts_with(cache.artifact_store().root())));
    }

    #[test]
    fn test_deleted_artifacts_are_recropped_into_same_record() {
        let (_tmp, config, scan) = setup();
        let cache = ProcessingCache::open(&config).unwrap();
        let cropper = FakeCropper::default();
        let session = SessionUploads::new("s1");
        let first = cache.ingest_upload(&session, &Upload::new(&scan, Role::Face), &cropper).unwrap();
        let record = first.record.unwrap();
        fs::remove_file(&record.artifacts()[1]).unwrap();

        let second = cache.ingest_upload(&session, &Upload::new(&scan, Role::Face), &cropper).unwrap();
        assert_eq!(second.status, UploadStatus::Processed { recropped: true });
        assert_eq!(second.entry_id, first.entry_id);
        assert_eq!(cache.database().count_records().unwrap(), 1);
        assert!(artifacts::validate(second.record.unwrap().artifacts()).all_valid);

        // The recrop was asked to reproduce the stored grid.
        let hints = cropper.hints.lock();
        assert_eq!(hints[0], None);
        assert_eq!(hints[1], record.geometry);
    }

    #[test]
    fn test_reextraction_replaces_auto_layer_only() {
        let (_tmp, config, scan) = setup();
        let cache = ProcessingCache::open(&config).unwrap();
        let outcome = cache
            .ingest_upload(&SessionUploads::new("s1"), &Upload::new(&scan, Role::Face), &FakeCropper::default())
            .unwrap();
        let entry_id = outcome.entry_id.unwrap();
        let crops = outcome.record.unwrap().artifact_paths;
        let profile = ExtractionProfile::new(ItemKind::PostalCard);

        let first = FakeExtractor { model: "vision-small", title: "Harbour at dusk" };
        cache.extract_metadata("s1", &entry_id, &scan, &first, &profile).unwrap();

        let mut manual = FieldMap::new();
        manual.insert("price".to_string(), json!("12.50"));
        cache.set_manual_fields(&entry_id, &manual).unwrap();

        let second = FakeExtractor { model: "vision-large", title: "Harbour at night" };
        let record = cache.extract_metadata("s1", &entry_id, &scan, &second, &profile).unwrap();

        let auto = record.metadata.auto.as_ref().unwrap();
        assert_eq!(auto.model, "vision-large");
        assert_eq!(auto.provider, "acme-vision");
        assert_eq!(record.metadata.effective("title"), Some(json!("Harbour at night")));
        assert_eq!(record.metadata.manual["price"], json!("12.50"));
        assert_eq!(record.artifact_paths, crops);

        let extracted = cache
            .list_activity("s1")
            .unwrap()
            .into_iter()
            .filter(|r| r.action == ActivityAction::Extracted)
            .count();
        assert_eq!(extracted, 2);
    }

    #[test]
    fn test_extraction_for_unknown_entry_is_referential() {
        let (_tmp, config, scan) = setup();
        let cache = ProcessingCache::open(&config).unwrap();
        let extractor = FakeExtractor { model: "m", title: "t" };
        let err = cache
            .extract_metadata("s1", "missing", &scan, &extractor, &ExtractionProfile::new(ItemKind::PostalCard))
            .unwrap_err();
        assert!(matches!(err, CacheError::Referential { .. }));
        assert!(err.user_message().contains("re-upload"));
    }

    #[test]
    fn test_unavailable_catalog_processes_without_caching() {
        let (tmp, _config, scan) = setup();
        let db_path = tmp.path().join("broken.db");
        fs::create_dir_all(&db_path).unwrap();
        let cache = ProcessingCache::from_parts(
            Database::new(&db_path).unwrap(),
            ArtifactStore::new(tmp.path().join("artifacts")).unwrap(),
            &tmp.path().join("display"),
        )
        .unwrap();
        let cropper = FakeCropper::default();
        let outcome = cache
            .ingest_upload(&SessionUploads::new("s1"), &Upload::new(&scan, Role::Face), &cropper)
            .unwrap();
        assert_eq!(outcome.status, UploadStatus::Unidentified);
        assert!(outcome.entry_id.is_none());
        assert_eq!(outcome.display.paths.len(), 2);
        assert_eq!(cropper.calls(), 1);
    }

    #[test]
    fn test_combined_role_is_catalogued_not_cropped() {
        let (_tmp, config, scan) = setup();
        let cache = ProcessingCache::open(&config).unwrap();
        let cropper = FakeCropper::default();
        let outcome = cache
            .ingest_upload(&SessionUploads::new("s1"), &Upload::new(&scan, Role::Combined), &cropper)
            .unwrap();
        assert_eq!(outcome.status, UploadStatus::Uncropped);
        assert!(outcome.entry_id.is_some());
        assert_eq!(cropper.calls(), 0);
    }

    #[test]
    fn test_listing_and_display_and_lots() {
        let (tmp, config, scan) = setup();
        let cache = ProcessingCache::open(&config).unwrap();
        let cropper = FakeCropper::default();
        let session = SessionUploads::new("s1");
        let verso_scan = tmp.path().join("uploads/scan_002.jpg");
        fs::write(&verso_scan, b"the back side").unwrap();

        let face = cache.ingest_upload(&session, &Upload::new(&scan, Role::Face), &cropper).unwrap();
        cache
            .ingest_upload(&session, &Upload::new(&verso_scan, Role::Verso), &cropper)
            .unwrap();
        let face_id = face.entry_id.unwrap();

        let display = cache
            .reconstitute_for_display(&face_id, &tmp.path().join("elsewhere"))
            .unwrap();
        assert!(display.is_complete());
        assert_eq!(display.paths.len(), 2);

        let report = cache
            .reconstruct_pairs(&session, (Role::Face, Role::Verso), &ConcatCombiner { lots: true }, &CancelFlag::new())
            .unwrap();
        assert_eq!(report.composites.len(), 2);
        assert_eq!(report.lots.len(), 1);

        let listing = ListingRef {
            marketplace: "ebay".to_string(),
            listing_id: "1234567890".to_string(),
            listed_at: Utc::now(),
        };
        let record = cache.record_listing("s1", &face_id, &listing).unwrap();
        assert_eq!(record.listing, Some(listing));

        let actions: Vec<ActivityAction> = cache
            .activity()
            .list_for_entry(&face_id)
            .unwrap()
            .into_iter()
            .map(|r| r.action)
            .collect();
        assert!(actions.contains(&ActivityAction::LotCreated));
        assert_eq!(actions.last(), Some(&ActivityAction::Listed));
        assert!(matches!(
            cache.reconstitute_for_display("nope", tmp.path()),
            Err(CacheError::Referential { .. })
        ));
    }

    #[test]
    fn test_clearing_artifacts_forces_a_fresh_crop() {
        let (_tmp, config, scan) = setup();
        let cache = ProcessingCache::open(&config).unwrap();
        let cropper = FakeCropper::default();
        let session = SessionUploads::new("s1");
        let first = cache.ingest_upload(&session, &Upload::new(&scan, Role::Stamp), &cropper).unwrap();
        let entry_id = first.entry_id.unwrap();

        let cleared = ProcessingUpdate {
            artifact_paths: FieldUpdate::Clear,
            ..ProcessingUpdate::default()
        };
        cache.upsert_processing(&entry_id, &cleared).unwrap();
        let again = cache.ingest_upload(&session, &Upload::new(&scan, Role::Stamp), &cropper).unwrap();
        assert_eq!(again.status, UploadStatus::Processed { recropped: false });
        assert_eq!(cropper.calls(), 2);
        assert_eq!(again.record.unwrap().metadata.auto, None);
    }

    #[test]
    fn test_session_id_must_stay_inside_display_root() {
        let (tmp, config, scan) = setup();
        let cache = ProcessingCache::open(&config).unwrap();
        let cropper = FakeCropper::default();

        assert!(cache.session_display_dir("s1").unwrap().starts_with(&config.display_root));
        for bad in ["../outside", "", ".hidden", "a/b"] {
            assert!(matches!(
                cache.session_display_dir(bad),
                Err(CacheError::InvalidMetadata(_))
            ));
        }

        let session = SessionUploads::new("../outside");
        let err = cache
            .ingest_upload(&session, &Upload::new(&scan, Role::Face), &cropper)
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidMetadata(_)));
        assert_eq!(cropper.calls(), 0);
        assert_eq!(cache.database().count_entries().unwrap(), 0);
        assert!(cache
            .reconstruct_pairs(&session, (Role::Face, Role::Verso), &ConcatCombiner { lots: false }, &CancelFlag::new())
            .is_err());
        assert!(!tmp.path().join("state/outside").exists());
    }
}
