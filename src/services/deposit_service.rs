//! DepositService — the deposit lifecycle state machine.
//!
//! States run `DRAFT → UPLOADED → FINALIZING → SUBMITTED` on the happy
//! path. `FINALIZING → UPLOADED` is the single backward edge, taken only on
//! disk-space exhaustion; `INVALID` and `FAILED` are terminal and reachable
//! only from `FINALIZING`. The on-disk record is the sole source of truth:
//! every operation reloads it, mutates a copy, and persists explicitly.

use crate::models::collection::Collection;
use crate::models::deposit::{Deposit, DepositState};
use crate::models::depositor::Depositor;
use crate::services::bag_extractor::BagExtractor;
use crate::services::bagit_manager::BagItManager;
use crate::services::deposit_record::{DepositRecordStore, RECORD_FILENAME};
use crate::services::file_service::FileService;
use crate::services::finalizer::FinalizerEvent;
use crate::services::space_verifier::FilesystemSpaceVerifier;
use crate::services::{DepositError, DepositResult};
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use futures::Stream;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};
use uuid::Uuid;

/// The only packaging format the service accepts.
pub const PACKAGING_BAGIT: &str = "http://purl.org/net/sword/package/BagIt";

const SUPPORTED_CONTENT_TYPES: [&str; 2] = ["application/zip", "application/octet-stream"];

/// Everything a payload-bearing request declares about its content.
#[derive(Clone, Debug)]
pub struct PayloadSpec {
    pub content_type: String,
    pub declared_md5: Option<String>,
    pub packaging: Option<String>,
    pub filename: String,
    pub content_length: i64,
    pub in_progress: bool,
}

#[derive(Clone)]
pub struct DepositService {
    collections: Arc<Vec<Collection>>,
    users: Arc<Vec<Depositor>>,
    file_service: FileService,
    records: DepositRecordStore,
    extractor: BagExtractor,
    bagit_manager: BagItManager,
    space_verifier: FilesystemSpaceVerifier,
    finalizer_queue: mpsc::Sender<FinalizerEvent>,
    admin_email: String,
}

impl DepositService {
    pub fn new(
        collections: Vec<Collection>,
        users: Vec<Depositor>,
        finalizer_queue: mpsc::Sender<FinalizerEvent>,
        admin_email: String,
    ) -> Self {
        let file_service = FileService;
        let space_verifier = FilesystemSpaceVerifier::new(file_service);
        Self {
            collections: Arc::new(collections),
            users: Arc::new(users),
            file_service,
            records: DepositRecordStore,
            extractor: BagExtractor::new(file_service, BagItManager, space_verifier),
            bagit_manager: BagItManager,
            space_verifier,
            finalizer_queue,
            admin_email,
        }
    }

    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    pub fn space_verifier(&self) -> &FilesystemSpaceVerifier {
        &self.space_verifier
    }

    pub fn file_service(&self) -> &FileService {
        &self.file_service
    }

    /// Resolve a collection by its external path segment, scoped to the
    /// depositor's permitted set.
    pub fn collection_by_path(
        &self,
        path: &str,
        depositor: &Depositor,
    ) -> DepositResult<&Collection> {
        self.collections
            .iter()
            .find(|c| c.path == path && depositor.collections.contains(&c.name))
            .ok_or_else(|| DepositError::CollectionNotFound(path.to_string()))
    }

    pub fn collection_by_name(&self, name: &str) -> DepositResult<&Collection> {
        self.collections
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DepositError::CollectionNotFound(name.to_string()))
    }

    pub fn depositor_by_name(&self, name: &str) -> Option<&Depositor> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Create a fresh deposit from an uploaded payload.
    ///
    /// Streams the payload while hashing it, verifies the declared checksum
    /// and content declarations, writes the record in DRAFT, and enqueues
    /// finalization when the client marked the deposit complete. Partially
    /// written files are removed on any rejection.
    pub async fn create_deposit_with_payload<S>(
        &self,
        collection_path: &str,
        depositor: &Depositor,
        slug: Option<String>,
        spec: PayloadSpec,
        payload: S,
    ) -> DepositResult<Deposit>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let id = Uuid::new_v4().to_string();
        let collection = self.collection_by_path(collection_path, depositor)?;
        let deposit_dir = collection.uploads.join(&id);
        let payload_path = deposit_dir.join(&spec.filename);

        self.file_service
            .ensure_directories(&collection.uploads)
            .await?;
        self.space_verifier.ensure_margin_for(
            &collection.uploads,
            collection.disk_space_margin,
            spec.content_length,
        )?;

        let result = self
            .ingest_new_deposit(&id, collection, depositor, slug, &spec, &payload_path, payload)
            .await;

        match result {
            Ok(mut deposit) => {
                self.start_finalizing(&mut deposit).await?;
                Ok(deposit)
            }
            Err(err) => {
                if ingest_failure_leaves_file(&err) {
                    self.cleanup_file(&payload_path).await;
                }
                Err(err)
            }
        }
    }

    async fn ingest_new_deposit<S>(
        &self,
        id: &str,
        collection: &Collection,
        depositor: &Depositor,
        slug: Option<String>,
        spec: &PayloadSpec,
        payload_path: &Path,
        payload: S,
    ) -> DepositResult<Deposit>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let calculated_md5 = self
            .file_service
            .copy_stream_with_md5(payload, payload_path)
            .await?;
        verify_declared_hash(spec.declared_md5.as_deref(), &calculated_md5)?;
        verify_content_declarations(&spec.content_type, spec.packaging.as_deref())?;

        let deposit = Deposit {
            id: id.to_string(),
            slug,
            filename: Some(spec.filename.clone()),
            mime_type: Some(spec.content_type.clone()),
            md5: Some(calculated_md5),
            packaging: spec.packaging.clone(),
            depositor: depositor.name.clone(),
            bag_name: None,
            sword_token: None,
            other_id: None,
            other_id_version: None,
            created: Utc::now(),
            state: DepositState::Draft,
            state_description: "Deposit is open for additional data".to_string(),
            path: payload_path.parent().map(Path::to_path_buf).unwrap_or_default(),
            collection_id: collection.name.clone(),
            in_progress: spec.in_progress,
            content_length: spec.content_length,
        };

        self.records.save(&deposit.path, &deposit).await?;
        Ok(deposit)
    }

    /// Append another payload part to an open deposit. Only legal in DRAFT.
    pub async fn add_payload<S>(
        &self,
        deposit_id: &str,
        depositor: &Depositor,
        spec: PayloadSpec,
        payload: S,
    ) -> DepositResult<Deposit>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut deposit = self.get_deposit(deposit_id, Some(depositor)).await?;
        let collection = self.collection_by_name(&deposit.collection_id)?;
        let payload_path = deposit.path.join(&spec.filename);

        self.space_verifier.ensure_margin_for(
            &deposit.path,
            collection.disk_space_margin,
            spec.content_length,
        )?;

        if deposit.state != DepositState::Draft {
            return Err(DepositError::DepositReadOnly(deposit.id));
        }

        let calculated_md5 = self
            .file_service
            .copy_stream_with_md5(payload, &payload_path)
            .await?;
        if let Err(err) = verify_declared_hash(spec.declared_md5.as_deref(), &calculated_md5) {
            self.cleanup_file(&payload_path).await;
            return Err(err);
        }

        deposit.in_progress = spec.in_progress;
        deposit.md5 = Some(calculated_md5);
        deposit.filename = Some(spec.filename.clone());
        let record_dir = deposit.path.clone();
        self.records.save(&record_dir, &deposit).await?;

        self.start_finalizing(&mut deposit).await?;
        Ok(deposit)
    }

    /// Resolve a deposit by probing each collection's intake, archive, and
    /// tracking directories in order. When a depositor is supplied, an
    /// ownership mismatch reads as not-found so existence never leaks
    /// across users.
    pub async fn get_deposit(
        &self,
        deposit_id: &str,
        depositor: Option<&Depositor>,
    ) -> DepositResult<Deposit> {
        for collection in self.collections.iter() {
            let mut base_paths: Vec<&PathBuf> = vec![&collection.uploads, &collection.deposits];
            base_paths.extend(collection.deposit_tracking.iter());

            for base in base_paths {
                let deposit_path = base.join(deposit_id);
                let exists = self.file_service.exists(&deposit_path).await;
                trace!(path = %deposit_path.display(), exists, "probing for deposit");

                if exists {
                    let mut deposit = self.records.load(&deposit_path).await?;
                    deposit.path = deposit_path;
                    deposit.collection_id = collection.name.clone();

                    if let Some(depositor) = depositor {
                        if depositor.name != deposit.depositor {
                            return Err(DepositError::DepositNotFound(deposit_id.to_string()));
                        }
                    }
                    return Ok(deposit);
                }
            }
        }

        Err(DepositError::DepositNotFound(deposit_id.to_string()))
    }

    /// Every deposit currently in UPLOADED or FINALIZING across all intake
    /// directories. Used at process start to rebuild the event queue.
    pub async fn open_deposits(&self) -> Vec<Deposit> {
        let mut open = Vec::new();

        for collection in self.collections.iter() {
            let directories = match self.file_service.list_directories(&collection.uploads).await {
                Ok(directories) => directories,
                Err(err) => {
                    error!(
                        "unable to list directories in {}: {err}",
                        collection.uploads.display()
                    );
                    continue;
                }
            };

            for path in directories {
                match self.records.load(&path).await {
                    Ok(mut deposit) => {
                        deposit.path = path;
                        deposit.collection_id = collection.name.clone();
                        if matches!(
                            deposit.state,
                            DepositState::Uploaded | DepositState::Finalizing
                        ) {
                            open.push(deposit);
                        }
                    }
                    Err(err) => error!("unable to open deposit from {}: {err}", path.display()),
                }
            }
        }

        open
    }

    /// Once the client stops declaring the deposit in progress, mark it
    /// UPLOADED and hand it to the finalization queue.
    async fn start_finalizing(&self, deposit: &mut Deposit) -> DepositResult<()> {
        if deposit.in_progress {
            info!(deposit = %deposit.id, "deposit is still in progress, not finalizing");
            return Ok(());
        }

        info!(deposit = %deposit.id, "queueing deposit for finalization");

        let collection = self.collection_by_name(&deposit.collection_id)?;
        let deposit_dir = collection.uploads.join(&deposit.id);

        deposit.state = DepositState::Uploaded;
        self.records.save(&deposit_dir, deposit).await?;

        if let Err(err) = self
            .finalizer_queue
            .send(FinalizerEvent::Finalize(deposit.id.clone()))
            .await
        {
            error!("unable to put finalize event on queue: {err}");
        }
        Ok(())
    }

    /// The core pipeline: FINALIZING, extract, locate the bag, read its
    /// identity, SUBMITTED, drop the redundant archive parts, relocate to
    /// the archive area.
    ///
    /// Error mapping: structural errors end in INVALID, a vanished
    /// collection ends in FAILED with a generic message, disk-space
    /// exhaustion steps back to UPLOADED for a later retry. Anything else is
    /// left exactly as found for the caller to log.
    pub async fn finalize_deposit(&self, deposit_id: &str) -> DepositResult<Deposit> {
        match self.run_finalize(deposit_id).await {
            Ok(deposit) => Ok(deposit),
            Err(err @ (DepositError::InvalidDeposit(_) | DepositError::InvalidPartialFile(_))) => {
                self.set_deposit_to_invalid(deposit_id, &err.to_string())
                    .await?;
                Err(err)
            }
            Err(err @ DepositError::CollectionNotFound(_)) => {
                self.set_deposit_to_failed(deposit_id, &self.generic_error_message(deposit_id))
                    .await?;
                Err(err)
            }
            Err(err @ DepositError::OutOfDiskSpace) => {
                self.set_deposit_to_retrying(deposit_id).await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn run_finalize(&self, deposit_id: &str) -> DepositResult<Deposit> {
        let mut deposit = self.get_deposit(deposit_id, None).await?;
        let deposit_dir = deposit.path.clone();
        let depositor = self
            .depositor_by_name(&deposit.depositor)
            .cloned()
            .ok_or_else(|| {
                DepositError::InvalidDeposit(format!(
                    "depositor {} is not configured",
                    deposit.depositor
                ))
            })?;

        info!(deposit = %deposit_id, "finalizing deposit");
        deposit.state = DepositState::Finalizing;
        deposit.state_description = "Finalizing deposit".to_string();
        self.records.save(&deposit_dir, &deposit).await?;

        let collection = self.collection_by_name(&deposit.collection_id)?;
        let mime_type = deposit.mime_type.clone().ok_or_else(|| {
            DepositError::InvalidDeposit(format!(
                "deposit {deposit_id} has no recorded content type"
            ))
        })?;

        info!(deposit = %deposit_id, "extracting deposit files");
        self.extractor
            .extract_bag(
                &deposit_dir,
                collection.disk_space_margin,
                &mime_type,
                depositor.filepath_mapping,
            )
            .await?;

        let bag_dir = self.extractor.bag_dir(&deposit_dir)?;
        let bag_name = bag_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(deposit = %deposit_id, bag = %bag_name, "bag dir found");

        deposit.state = DepositState::Submitted;
        deposit.state_description =
            "Deposit is valid and ready for post-submission processing".to_string();
        deposit.bag_name = Some(bag_name);
        deposit.mime_type = None;

        let metadata = self.bagit_manager.bag_metadata(&bag_dir, deposit_id)?;
        deposit.sword_token = Some(metadata.sword_token);
        deposit.other_id = metadata.other_id;
        deposit.other_id_version = metadata.other_id_version;

        self.records.save(&deposit_dir, &deposit).await?;

        self.remove_archive_parts(&deposit_dir).await?;

        let target_path = collection.deposits.join(deposit_id);
        self.file_service
            .move_path(&deposit_dir, &target_path)
            .await?;
        deposit.path = target_path;

        Ok(deposit)
    }

    async fn set_deposit_to_invalid(&self, deposit_id: &str, reason: &str) -> DepositResult<()> {
        info!(deposit = %deposit_id, reason, "marking deposit as INVALID");
        self.transition_with_cleanup(deposit_id, DepositState::Invalid, reason)
            .await
    }

    async fn set_deposit_to_failed(&self, deposit_id: &str, message: &str) -> DepositResult<()> {
        info!(deposit = %deposit_id, "marking deposit as FAILED");
        self.transition_with_cleanup(deposit_id, DepositState::Failed, message)
            .await
    }

    async fn set_deposit_to_retrying(&self, deposit_id: &str) -> DepositResult<()> {
        info!(deposit = %deposit_id, "rescheduling deposit");
        self.transition_with_cleanup(
            deposit_id,
            DepositState::Uploaded,
            "Rescheduled, waiting for more disk space",
        )
        .await
    }

    /// Persist a state transition, then purge leftover package files when
    /// the collection's auto-clean policy covers the new state. Cleanup runs
    /// even when the save fails.
    async fn transition_with_cleanup(
        &self,
        deposit_id: &str,
        state: DepositState,
        description: &str,
    ) -> DepositResult<()> {
        let mut deposit = self.get_deposit(deposit_id, None).await?;
        deposit.state = state;
        deposit.state_description = description.to_string();

        let record_dir = deposit.path.clone();
        let save_result = self.records.save(&record_dir, &deposit).await;
        self.cleanup_deposit_files(&deposit, state).await;
        save_result
    }

    async fn cleanup_deposit_files(&self, deposit: &Deposit, state: DepositState) {
        let collection = match self.collection_by_name(&deposit.collection_id) {
            Ok(collection) => collection,
            Err(err) => {
                error!("unable to clean up deposit {}: {err}", deposit.id);
                return;
            }
        };

        if !collection.auto_clean.contains(&state) {
            trace!(
                "cleanup for state {state} is not allowed; only cleaning up for {:?}",
                collection.auto_clean
            );
            return;
        }

        info!(deposit = %deposit.id, %state, "cleaning up archive parts and bag directory");

        if let Err(err) = self.remove_archive_parts(&deposit.path).await {
            error!("unable to clean path {}: {err}", deposit.path.display());
            return;
        }

        match self.file_service.list_directories(&deposit.path).await {
            Ok(directories) => {
                for directory in directories {
                    if let Err(err) = self.file_service.delete_directory(&directory).await {
                        error!("unable to delete directory {}: {err}", directory.display());
                    }
                }
            }
            Err(err) => error!("unable to clean path {}: {err}", deposit.path.display()),
        }
    }

    /// Delete every file in the deposit directory except the durable record.
    async fn remove_archive_parts(&self, deposit_dir: &Path) -> DepositResult<()> {
        for file in self.file_service.list_files(deposit_dir).await? {
            if file.file_name().is_none_or(|name| name == RECORD_FILENAME) {
                continue;
            }
            if let Err(err) = self.file_service.delete_file(&file).await {
                warn!("unable to remove file {}: {err}", file.display());
            }
        }
        Ok(())
    }

    async fn cleanup_file(&self, path: &Path) {
        info!("cleaning up file {}", path.display());
        if let Err(err) = self.file_service.delete_file(path).await {
            error!("unable to clean up file {}: {err}", path.display());
        }
    }

    /// Administrator-contact message used for FAILED deposits; the raw error
    /// is logged, never surfaced to the depositor.
    fn generic_error_message(&self, deposit_id: &str) -> String {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        format!(
            "The server encountered an unexpected condition. \
             Please contact the SWORD service administrator at {}. \
             The error occurred at timestamp {timestamp}. Your 'DepositID' is {deposit_id}",
            self.admin_email
        )
    }
}

fn verify_declared_hash(declared: Option<&str>, calculated: &str) -> DepositResult<()> {
    match declared {
        Some(expected) if expected.eq_ignore_ascii_case(calculated) => Ok(()),
        other => Err(DepositError::HashMismatch {
            expected: other.unwrap_or("(none)").to_string(),
            actual: calculated.to_string(),
        }),
    }
}

fn verify_content_declarations(content_type: &str, packaging: Option<&str>) -> DepositResult<()> {
    if let Some(packaging) = packaging.filter(|p| !p.is_empty()) {
        if packaging != PACKAGING_BAGIT {
            return Err(DepositError::UnsupportedPackaging(packaging.to_string()));
        }
    }
    if !SUPPORTED_CONTENT_TYPES.contains(&content_type) {
        return Err(DepositError::InvalidContentType(content_type.to_string()));
    }
    Ok(())
}

/// Rejections raised after bytes hit disk; these require removing the
/// partial file.
fn ingest_failure_leaves_file(err: &DepositError) -> bool {
    matches!(
        err,
        DepositError::HashMismatch { .. }
            | DepositError::Io(_)
            | DepositError::InvalidDeposit(_)
            | DepositError::UnsupportedPackaging(_)
            | DepositError::InvalidContentType(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::{TempDir, tempdir};
    use zip::write::SimpleFileOptions;

    struct Fixture {
        service: DepositService,
        queue: mpsc::Receiver<FinalizerEvent>,
        _root: TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn fixture_with(tweak: impl FnOnce(&mut Collection)) -> Fixture {
        let root = tempdir().unwrap();
        let mut collection = Collection {
            name: "collection1".to_string(),
            path: "col1".to_string(),
            uploads: root.path().join("uploads"),
            deposits: root.path().join("deposits"),
            deposit_tracking: Vec::new(),
            disk_space_margin: 0,
            auto_clean: vec![DepositState::Invalid, DepositState::Failed],
        };
        tweak(&mut collection);
        std::fs::create_dir_all(&collection.uploads).unwrap();
        std::fs::create_dir_all(&collection.deposits).unwrap();

        let user = Depositor {
            name: "user001".to_string(),
            filepath_mapping: false,
            collections: vec!["collection1".to_string()],
        };

        let (tx, rx) = mpsc::channel(16);
        let service = DepositService::new(
            vec![collection],
            vec![user],
            tx,
            "sword-admin@example.com".to_string(),
        );
        Fixture {
            service,
            queue: rx,
            _root: root,
        }
    }

    fn depositor(service: &DepositService) -> Depositor {
        service.depositor_by_name("user001").cloned().unwrap()
    }

    fn bag_zip_bytes() -> Vec<u8> {
        let bagit: &[u8] = b"BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n";
        let manifest: &[u8] = b"5eb63bbbe01eeed093cb22bb8f5acdc3  data/file1.txt\n";
        let bagit_sum = format!("{:x}", md5::compute(bagit));
        let manifest_sum = format!("{:x}", md5::compute(manifest));
        let tagmanifest = format!("{bagit_sum}  bagit.txt\n{manifest_sum}  manifest-md5.txt\n");

        let mut cursor = std::io::Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(&mut cursor);
        for (name, content) in [
            ("audiences/bagit.txt", bagit),
            ("audiences/manifest-md5.txt", manifest),
            ("audiences/data/file1.txt", b"hello world".as_slice()),
            ("audiences/tagmanifest-md5.txt", tagmanifest.as_bytes()),
        ] {
            use std::io::Write;
            writer
                .start_file(name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
        cursor.into_inner()
    }

    fn payload_stream(bytes: Vec<u8>) -> impl Stream<Item = io::Result<Bytes>> {
        stream::once(async move { Ok(Bytes::from(bytes)) })
    }

    fn zip_spec(bytes: &[u8], in_progress: bool) -> PayloadSpec {
        PayloadSpec {
            content_type: "application/zip".to_string(),
            declared_md5: Some(format!("{:x}", md5::compute(bytes))),
            packaging: Some(PACKAGING_BAGIT.to_string()),
            filename: "bag.zip".to_string(),
            content_length: bytes.len() as i64,
            in_progress,
        }
    }

    #[tokio::test]
    async fn closed_deposit_finalizes_to_submitted_and_relocates() {
        let mut fx = fixture();
        let bytes = bag_zip_bytes();
        let user = depositor(&fx.service);

        let deposit = fx
            .service
            .create_deposit_with_payload(
                "col1",
                &user,
                None,
                zip_spec(&bytes, false),
                payload_stream(bytes.clone()),
            )
            .await
            .unwrap();

        // the closed deposit was queued for finalization
        match fx.queue.recv().await {
            Some(FinalizerEvent::Finalize(id)) => assert_eq!(id, deposit.id),
            other => panic!("expected finalize event, got {other:?}"),
        }

        let finalized = fx.service.finalize_deposit(&deposit.id).await.unwrap();
        assert_eq!(finalized.state, DepositState::Submitted);
        assert_eq!(finalized.bag_name.as_deref(), Some("audiences"));
        assert_eq!(
            finalized.sword_token.as_deref(),
            Some(format!("sword:{}", deposit.id).as_str())
        );

        // relocated wholesale to the archive area, archive part removed
        let archived = fx.service.get_deposit(&deposit.id, None).await.unwrap();
        assert!(archived.path.starts_with(fx._root.path().join("deposits")));
        assert!(!archived.path.join("bag.zip").exists());
        assert!(archived.path.join("audiences/data/file1.txt").exists());
        assert!(!fx._root.path().join("uploads").join(&deposit.id).exists());
    }

    #[tokio::test]
    async fn wrong_checksum_is_rejected_and_leaves_nothing_behind() {
        let fx = fixture();
        let bytes = bag_zip_bytes();
        let user = depositor(&fx.service);

        let mut spec = zip_spec(&bytes, false);
        spec.declared_md5 = Some("00000000000000000000000000000000".to_string());

        let result = fx
            .service
            .create_deposit_with_payload("col1", &user, None, spec, payload_stream(bytes))
            .await;
        assert!(matches!(result, Err(DepositError::HashMismatch { .. })));

        // the rejection happens before the record is written, so nothing
        // survives in the intake area
        let uploads = fx._root.path().join("uploads");
        for entry in std::fs::read_dir(&uploads).unwrap() {
            let dir = entry.unwrap().path();
            assert_eq!(
                std::fs::read_dir(&dir).unwrap().count(),
                0,
                "no file should remain in {}",
                dir.display()
            );
        }
    }

    #[tokio::test]
    async fn unsupported_packaging_and_content_type_are_rejected() {
        let fx = fixture();
        let bytes = bag_zip_bytes();
        let user = depositor(&fx.service);

        let mut spec = zip_spec(&bytes, false);
        spec.packaging = Some("http://purl.org/net/sword/package/METSDSpaceSIP".to_string());
        let result = fx
            .service
            .create_deposit_with_payload("col1", &user, None, spec, payload_stream(bytes.clone()))
            .await;
        assert!(matches!(result, Err(DepositError::UnsupportedPackaging(_))));

        let mut spec = zip_spec(&bytes, false);
        spec.content_type = "text/plain".to_string();
        let result = fx
            .service
            .create_deposit_with_payload("col1", &user, None, spec, payload_stream(bytes))
            .await;
        assert!(matches!(result, Err(DepositError::InvalidContentType(_))));
    }

    #[tokio::test]
    async fn two_top_level_directories_end_in_invalid_with_the_count() {
        let mut fx = fixture();
        let user = depositor(&fx.service);

        let bagit: &[u8] = b"BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n";
        let mut cursor = std::io::Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(&mut cursor);
        for name in ["one/bagit.txt", "two/bagit.txt"] {
            use std::io::Write;
            writer
                .start_file(name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(bagit).unwrap();
        }
        writer.finish().unwrap();
        let bytes = cursor.into_inner();

        let deposit = fx
            .service
            .create_deposit_with_payload(
                "col1",
                &user,
                None,
                zip_spec(&bytes, false),
                payload_stream(bytes.clone()),
            )
            .await
            .unwrap();
        let _ = fx.queue.recv().await;

        let result = fx.service.finalize_deposit(&deposit.id).await;
        assert!(matches!(result, Err(DepositError::InvalidDeposit(_))));

        let after = fx.service.get_deposit(&deposit.id, None).await.unwrap();
        assert_eq!(after.state, DepositState::Invalid);
        assert!(
            after.state_description.contains("number found: 2"),
            "description: {}",
            after.state_description
        );
        // auto-clean covers INVALID: extracted directories were purged
        assert!(!after.path.join("one").exists());
        assert!(!after.path.join("two").exists());
    }

    #[tokio::test]
    async fn disk_exhaustion_steps_back_to_uploaded_for_a_later_retry() {
        let mut fx = fixture_with(|collection| collection.disk_space_margin = u64::MAX);
        let user = depositor(&fx.service);
        let bytes = bag_zip_bytes();

        // an unknown length skips intake admission; the margin bites during
        // extraction instead
        let mut spec = zip_spec(&bytes, false);
        spec.content_length = crate::services::space_verifier::UNKNOWN_CONTENT_LENGTH;

        let deposit = fx
            .service
            .create_deposit_with_payload("col1", &user, None, spec, payload_stream(bytes))
            .await
            .unwrap();
        let _ = fx.queue.recv().await;

        let result = fx.service.finalize_deposit(&deposit.id).await;
        assert!(matches!(result, Err(DepositError::OutOfDiskSpace)));

        let after = fx.service.get_deposit(&deposit.id, None).await.unwrap();
        assert_eq!(after.state, DepositState::Uploaded);
        assert_eq!(
            after.state_description,
            "Rescheduled, waiting for more disk space"
        );
        // the archive part stays in place for the retry
        assert!(after.path.join("bag.zip").exists());
    }

    #[tokio::test]
    async fn chunked_uploads_reassemble_and_leave_no_chunks_after_submit() {
        let mut fx = fixture();
        let user = depositor(&fx.service);
        let bytes = bag_zip_bytes();

        let (first, rest) = bytes.split_at(bytes.len() / 3);
        let (second, third) = rest.split_at(rest.len() / 2);

        let chunk_spec = |part: &[u8], n: u32, in_progress: bool| PayloadSpec {
            content_type: "application/octet-stream".to_string(),
            declared_md5: Some(format!("{:x}", md5::compute(part))),
            packaging: Some(PACKAGING_BAGIT.to_string()),
            filename: format!("bag.zip.{n}"),
            content_length: part.len() as i64,
            in_progress,
        };

        let deposit = fx
            .service
            .create_deposit_with_payload(
                "col1",
                &user,
                None,
                chunk_spec(first, 1, true),
                payload_stream(first.to_vec()),
            )
            .await
            .unwrap();
        fx.service
            .add_payload(
                &deposit.id,
                &user,
                chunk_spec(second, 2, true),
                payload_stream(second.to_vec()),
            )
            .await
            .unwrap();
        fx.service
            .add_payload(
                &deposit.id,
                &user,
                chunk_spec(third, 3, false),
                payload_stream(third.to_vec()),
            )
            .await
            .unwrap();

        let _ = fx.queue.recv().await;
        let finalized = fx.service.finalize_deposit(&deposit.id).await.unwrap();
        assert_eq!(finalized.state, DepositState::Submitted);

        let archived = fx.service.get_deposit(&deposit.id, None).await.unwrap();
        for n in 1..=3 {
            assert!(!archived.path.join(format!("bag.zip.{n}")).exists());
        }
        assert!(!archived.path.join("merged.zip").exists());
        assert!(archived.path.join("audiences").is_dir());
    }

    #[tokio::test]
    async fn append_to_non_draft_deposit_is_read_only() {
        let mut fx = fixture();
        let user = depositor(&fx.service);
        let bytes = bag_zip_bytes();

        let deposit = fx
            .service
            .create_deposit_with_payload(
                "col1",
                &user,
                None,
                zip_spec(&bytes, false),
                payload_stream(bytes.clone()),
            )
            .await
            .unwrap();
        let _ = fx.queue.recv().await;

        // closing the deposit moved it to UPLOADED
        let result = fx
            .service
            .add_payload(
                &deposit.id,
                &user,
                zip_spec(&bytes, false),
                payload_stream(bytes),
            )
            .await;
        assert!(matches!(result, Err(DepositError::DepositReadOnly(_))));
    }

    #[tokio::test]
    async fn foreign_depositor_reads_as_not_found() {
        let mut fx = fixture();
        let user = depositor(&fx.service);
        let bytes = bag_zip_bytes();

        let deposit = fx
            .service
            .create_deposit_with_payload(
                "col1",
                &user,
                None,
                zip_spec(&bytes, true),
                payload_stream(bytes),
            )
            .await
            .unwrap();
        assert!(fx.queue.try_recv().is_err(), "open deposit must not enqueue");

        let stranger = Depositor {
            name: "user002".to_string(),
            filepath_mapping: false,
            collections: vec!["collection1".to_string()],
        };
        let result = fx.service.get_deposit(&deposit.id, Some(&stranger)).await;
        assert!(matches!(result, Err(DepositError::DepositNotFound(_))));
    }

    #[tokio::test]
    async fn open_deposits_reports_uploaded_and_finalizing_only() {
        let mut fx = fixture();
        let user = depositor(&fx.service);
        let bytes = bag_zip_bytes();

        // one DRAFT (still in progress), one UPLOADED (closed)
        fx.service
            .create_deposit_with_payload(
                "col1",
                &user,
                None,
                zip_spec(&bytes, true),
                payload_stream(bytes.clone()),
            )
            .await
            .unwrap();
        let closed = fx
            .service
            .create_deposit_with_payload(
                "col1",
                &user,
                None,
                zip_spec(&bytes, false),
                payload_stream(bytes),
            )
            .await
            .unwrap();
        let _ = fx.queue.recv().await;

        let open = fx.service.open_deposits().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, closed.id);
        assert_eq!(open[0].state, DepositState::Uploaded);
    }

    #[tokio::test]
    async fn unknown_collection_path_is_not_found() {
        let fx = fixture();
        let user = depositor(&fx.service);
        let bytes = bag_zip_bytes();

        let result = fx
            .service
            .create_deposit_with_payload(
                "nope",
                &user,
                None,
                zip_spec(&bytes, false),
                payload_stream(bytes),
            )
            .await;
        assert!(matches!(result, Err(DepositError::CollectionNotFound(_))));
    }

    #[tokio::test]
    async fn slug_becomes_the_canonical_id() {
        let mut fx = fixture();
        let user = depositor(&fx.service);
        let bytes = bag_zip_bytes();

        let deposit = fx
            .service
            .create_deposit_with_payload(
                "col1",
                &user,
                Some("my-dataset".to_string()),
                zip_spec(&bytes, false),
                payload_stream(bytes),
            )
            .await
            .unwrap();
        let _ = fx.queue.recv().await;
        assert_eq!(deposit.canonical_id(), "my-dataset");
        assert_ne!(deposit.id, "my-dataset");
    }
}
