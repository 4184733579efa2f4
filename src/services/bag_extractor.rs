//! BagExtractor — turns the uploaded part(s) of a deposit into an extracted,
//! verified bag directory.
//!
//! Input is either one or more zip archives already in the deposit
//! directory, or a set of raw chunks named `<name>.N` that are first
//! concatenated in ascending sequence order into a single archive.

use crate::services::bagit_manager::BagItManager;
use crate::services::deposit_record::RECORD_FILENAME;
use crate::services::file_service::FileService;
use crate::services::space_verifier::FilesystemSpaceVerifier;
use crate::services::zip_service;
use crate::services::{DepositError, DepositResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const PAYLOAD_DIR: &str = "data";

#[derive(Clone, Copy, Debug)]
pub struct BagExtractor {
    file_service: FileService,
    bagit_manager: BagItManager,
    space_verifier: FilesystemSpaceVerifier,
}

impl BagExtractor {
    pub fn new(
        file_service: FileService,
        bagit_manager: BagItManager,
        space_verifier: FilesystemSpaceVerifier,
    ) -> Self {
        Self {
            file_service,
            bagit_manager,
            space_verifier,
        }
    }

    /// Extract the deposit at `deposit_dir` according to its recorded MIME
    /// type, honoring the collection's disk margin and the depositor's
    /// pseudonymization preference.
    pub async fn extract_bag(
        &self,
        deposit_dir: &Path,
        disk_space_margin: u64,
        mime_type: &str,
        filepath_mapping: bool,
    ) -> DepositResult<()> {
        debug!(deposit = %deposit_dir.display(), mime_type, filepath_mapping, "extracting bag");

        match mime_type {
            "application/zip" => {
                self.extract_zips(deposit_dir, disk_space_margin, filepath_mapping)
                    .await
            }
            "application/octet-stream" => {
                self.extract_octet_stream(deposit_dir, disk_space_margin, filepath_mapping)
                    .await
            }
            other => Err(DepositError::InvalidDeposit(format!(
                "Unknown mime-type {other}"
            ))),
        }
    }

    /// Reassemble sequenced chunks into `merged.zip`, then extract it. The
    /// source chunks are deleted once merged.
    async fn extract_octet_stream(
        &self,
        deposit_dir: &Path,
        disk_space_margin: u64,
        filepath_mapping: bool,
    ) -> DepositResult<()> {
        let mut files = Vec::new();
        for file in self.deposit_files(deposit_dir).await? {
            let sequence_number = sequence_number(&file)?;
            files.push((sequence_number, file));
        }
        files.sort_by_key(|(sequence_number, _)| *sequence_number);

        let chunks: Vec<PathBuf> = files.into_iter().map(|(_, file)| file).collect();
        let output = deposit_dir.join("merged.zip");
        self.file_service.merge_files(&chunks, &output).await?;

        debug!(deposit = %deposit_dir.display(), "extracting merged zip");
        self.extract_zips(deposit_dir, disk_space_margin, filepath_mapping)
            .await
    }

    async fn extract_zips(
        &self,
        deposit_dir: &Path,
        disk_space_margin: u64,
        filepath_mapping: bool,
    ) -> DepositResult<()> {
        for zip_file in self.deposit_files(deposit_dir).await? {
            self.extract(&zip_file, deposit_dir, disk_space_margin, filepath_mapping)
                .await?;
        }
        Ok(())
    }

    /// Everything in the deposit directory except the durable record.
    async fn deposit_files(&self, deposit_dir: &Path) -> DepositResult<Vec<PathBuf>> {
        Ok(self
            .file_service
            .list_files(deposit_dir)
            .await?
            .into_iter()
            .filter(|f| f.file_name().is_none_or(|name| name != RECORD_FILENAME))
            .collect())
    }

    async fn extract(
        &self,
        zip_file: &Path,
        target: &Path,
        disk_space_margin: u64,
        filepath_mapping: bool,
    ) -> DepositResult<()> {
        self.file_service.ensure_directories(target).await?;

        let extracted_size = zip_service::extracted_size(zip_file)?;
        let parent = zip_file.parent().unwrap_or(target);
        self.space_verifier
            .ensure_margin_for(parent, disk_space_margin, admission_size(extracted_size))?;

        let mapping = if filepath_mapping {
            generate_filepath_mapping(&zip_service::entry_names(zip_file)?)
        } else {
            HashMap::new()
        };

        debug!(zip = %zip_file.display(), entries_mapped = mapping.len(), "extracting archive");
        zip_service::extract_with_mapping(zip_file, target, &mapping)?;

        self.bagit_manager.update_manifests(target, &mapping)?;
        self.bagit_manager.verify_bag(target)?;

        Ok(())
    }

    /// The single top-level directory of the extracted deposit.
    pub fn bag_dir(&self, deposit_dir: &Path) -> DepositResult<PathBuf> {
        self.bagit_manager.bag_dir(deposit_dir)
    }
}

/// Trailing sequence number of a chunk filename (`bag.zip.3` → 3). Missing,
/// non-numeric, or non-positive suffixes are invalid-partial-file errors.
pub fn sequence_number(path: &Path) -> DepositResult<u32> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let Some((_, suffix)) = file_name.rsplit_once('.') else {
        return Err(DepositError::InvalidPartialFile(format!(
            "Partial file {file_name} has no extension. It should be a positive sequence number."
        )));
    };

    match suffix.parse::<i64>() {
        Ok(value) if value > 0 => Ok(value as u32),
        Ok(value) => Err(DepositError::InvalidPartialFile(format!(
            "Partial file {file_name} has an incorrect extension. It should be a positive sequence number (> 0), but was: {value}"
        ))),
        Err(_) => Err(DepositError::InvalidPartialFile(format!(
            "Partial file {file_name} has an incorrect extension. Should be a positive sequence number."
        ))),
    }
}

/// Declared uncompressed total as an admission-check length. Totals beyond
/// the signed range clamp to the maximum rather than wrapping negative,
/// which would wave the archive through.
fn admission_size(total: u64) -> i64 {
    i64::try_from(total).unwrap_or(i64::MAX)
}

/// For every archive entry under the `<top-level>/data/` payload prefix,
/// map the remainder to a fresh random identifier. Entries outside the
/// prefix are left unmapped.
pub fn generate_filepath_mapping(entry_names: &[String]) -> HashMap<String, String> {
    entry_names
        .iter()
        .filter_map(|name| {
            payload_prefix(name)
                .map(|prefix| (name.clone(), format!("{prefix}{}", Uuid::new_v4())))
        })
        .collect()
}

/// The `<top-level>/data/` prefix of an entry name, when present.
fn payload_prefix(name: &str) -> Option<&str> {
    let (top_level, rest) = name.split_once('/')?;
    if top_level.is_empty() || !rest.starts_with(&format!("{PAYLOAD_DIR}/")) {
        return None;
    }
    let prefix_len = top_level.len() + 1 + PAYLOAD_DIR.len() + 1;
    Some(&name[..prefix_len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn invalid_partial(result: DepositResult<u32>) -> String {
        match result {
            Err(DepositError::InvalidPartialFile(reason)) => reason,
            other => panic!("expected InvalidPartialFile, got {other:?}"),
        }
    }

    #[test]
    fn positive_suffixes_parse_as_sequence_numbers() {
        assert_eq!(sequence_number(Path::new("bag.zip.1")).unwrap(), 1);
        assert_eq!(sequence_number(Path::new("bag.zip.42")).unwrap(), 42);
        assert_eq!(sequence_number(Path::new("x.3")).unwrap(), 3);
    }

    #[test]
    fn zero_negative_and_garbage_suffixes_are_invalid() {
        assert!(invalid_partial(sequence_number(Path::new("bag.zip.0"))).contains("was: 0"));
        assert!(invalid_partial(sequence_number(Path::new("bag.zip.-2"))).contains("was: -2"));
        invalid_partial(sequence_number(Path::new("bag.zip.part")));
        invalid_partial(sequence_number(Path::new("bagzip")));
    }

    #[test]
    fn oversized_declared_totals_clamp_instead_of_wrapping() {
        assert_eq!(admission_size(11), 11);
        assert_eq!(admission_size(u64::MAX), i64::MAX);
        // a clamped total still fails admission
        assert!(!crate::services::space_verifier::fits_within_margin(
            1024,
            0,
            admission_size(u64::MAX)
        ));
    }

    #[test]
    fn mapping_covers_only_payload_entries() {
        let entries = vec![
            "bag/bagit.txt".to_string(),
            "bag/manifest-md5.txt".to_string(),
            "bag/data/file1.txt".to_string(),
            "bag/data/sub/file2.txt".to_string(),
        ];

        let mapping = generate_filepath_mapping(&entries);
        assert_eq!(mapping.len(), 2);
        assert!(!mapping.contains_key("bag/bagit.txt"));
        for (original, mapped) in &mapping {
            assert!(mapped.starts_with("bag/data/"), "mapped: {mapped}");
            assert_ne!(original, mapped);
            // remainder collapses to a single fresh identifier
            assert_eq!(mapped.matches('/').count(), 2);
        }
    }

    #[test]
    fn mapping_is_fresh_per_run() {
        let entries = vec!["bag/data/file1.txt".to_string()];
        let first = generate_filepath_mapping(&entries);
        let second = generate_filepath_mapping(&entries);
        assert_ne!(
            first.get("bag/data/file1.txt"),
            second.get("bag/data/file1.txt")
        );
    }

    #[test]
    fn entries_outside_the_prefix_are_unmapped() {
        assert_eq!(payload_prefix("bag/data/x"), Some("bag/data/"));
        assert_eq!(payload_prefix("bag/metadata/x"), None);
        assert_eq!(payload_prefix("data/x"), None);
        assert_eq!(payload_prefix("/data/x"), None);
        assert_eq!(payload_prefix("bagit.txt"), None);
    }

    #[tokio::test]
    async fn extracts_a_zip_deposit_into_a_verified_bag() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("bag.zip");
        write_bag_zip(&zip_path);

        let extractor = extractor();
        extractor
            .extract_bag(dir.path(), 0, "application/zip", false)
            .await
            .unwrap();

        let bag = extractor.bag_dir(dir.path()).unwrap();
        assert_eq!(bag.file_name().unwrap(), "audiences");
        assert_eq!(
            std::fs::read(bag.join("data/file1.txt")).unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn chunked_deposit_is_reassembled_before_extraction() {
        let dir = tempdir().unwrap();
        let whole = dir.path().join("whole.zip");
        write_bag_zip(&whole);
        let bytes = std::fs::read(&whole).unwrap();
        std::fs::remove_file(&whole).unwrap();

        // split out of order on purpose; merge must sort by sequence
        let (first, rest) = bytes.split_at(bytes.len() / 3);
        let (second, third) = rest.split_at(rest.len() / 2);
        std::fs::write(dir.path().join("bag.zip.2"), second).unwrap();
        std::fs::write(dir.path().join("bag.zip.1"), first).unwrap();
        std::fs::write(dir.path().join("bag.zip.3"), third).unwrap();

        let extractor = extractor();
        extractor
            .extract_bag(dir.path(), 0, "application/octet-stream", false)
            .await
            .unwrap();

        assert!(!dir.path().join("bag.zip.1").exists());
        assert!(!dir.path().join("bag.zip.2").exists());
        assert!(!dir.path().join("bag.zip.3").exists());
        extractor.bag_dir(dir.path()).unwrap();
    }

    #[tokio::test]
    async fn pseudonymized_extraction_still_verifies() {
        let dir = tempdir().unwrap();
        write_bag_zip(&dir.path().join("bag.zip"));

        let extractor = extractor();
        extractor
            .extract_bag(dir.path(), 0, "application/zip", true)
            .await
            .unwrap();

        let bag = extractor.bag_dir(dir.path()).unwrap();
        assert!(!bag.join("data/file1.txt").exists());
        assert!(bag.join("original-filepaths.txt").exists());
    }

    #[tokio::test]
    async fn unknown_mime_type_is_invalid() {
        let dir = tempdir().unwrap();
        let result = extractor()
            .extract_bag(dir.path(), 0, "text/plain", false)
            .await;
        assert!(matches!(result, Err(DepositError::InvalidDeposit(_))));
    }

    fn extractor() -> BagExtractor {
        let file_service = FileService;
        BagExtractor::new(
            file_service,
            BagItManager,
            FilesystemSpaceVerifier::new(file_service),
        )
    }

    /// Zip fixture holding the same minimal bag `bagit_manager` tests use.
    fn write_bag_zip(path: &Path) {
        let payload: &[u8] = b"hello world";
        let bagit: &[u8] = b"BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n";
        let manifest: &[u8] = b"5eb63bbbe01eeed093cb22bb8f5acdc3  data/file1.txt\n";
        let bagit_sum = format!("{:x}", md5::compute(bagit));
        let manifest_sum = format!("{:x}", md5::compute(manifest));
        let tagmanifest =
            format!("{bagit_sum}  bagit.txt\n{manifest_sum}  manifest-md5.txt\n");

        crate::services::zip_service::tests::write_zip(
            path,
            &[
                ("audiences/bagit.txt", bagit),
                ("audiences/manifest-md5.txt", manifest),
                ("audiences/data/file1.txt", payload),
                ("audiences/tagmanifest-md5.txt", tagmanifest.as_bytes()),
            ],
        );
    }
}
