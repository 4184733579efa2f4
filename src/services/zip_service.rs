//! Thin wrapper around zip archives: entry listing, uncompressed size, and
//! extraction with an optional entry-name mapping.
//!
//! Extraction runs on ordinary blocking I/O; it is only ever called from the
//! finalize worker path.

use crate::services::{DepositError, DepositResult};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::Path;
use tracing::{trace, warn};
use zip::ZipArchive;

fn open_archive(path: &Path) -> DepositResult<ZipArchive<File>> {
    let file = File::open(path)?;
    ZipArchive::new(file).map_err(|err| invalid_archive(path, err))
}

fn invalid_archive(path: &Path, err: zip::result::ZipError) -> DepositError {
    match err {
        zip::result::ZipError::Io(err) => DepositError::Io(err),
        other => DepositError::InvalidDeposit(format!(
            "unable to read zip file {}: {other}",
            path.display()
        )),
    }
}

/// Names of all non-directory entries in the archive, in archive order.
pub fn entry_names(path: &Path) -> DepositResult<Vec<String>> {
    let mut archive = open_archive(path)?;
    let mut names = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|err| invalid_archive(path, err))?;
        if !entry.is_dir() {
            names.push(entry.name().to_string());
        }
    }
    Ok(names)
}

/// Sum of the uncompressed sizes of all entries. The sizes are declared by
/// the archive, not trusted; the sum saturates instead of wrapping.
pub fn extracted_size(path: &Path) -> DepositResult<u64> {
    let mut archive = open_archive(path)?;
    let mut total = 0u64;
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|err| invalid_archive(path, err))?;
        total = total.saturating_add(entry.size());
    }
    Ok(total)
}

/// Extract every non-directory entry of `path` under `target_dir`.
///
/// Entry names present in `mapping` are written to their mapped path
/// instead. Entries whose names begin with a parent-directory traversal
/// token are skipped, not followed.
pub fn extract_with_mapping(
    path: &Path,
    target_dir: &Path,
    mapping: &HashMap<String, String>,
) -> DepositResult<()> {
    let mut archive = open_archive(path)?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| invalid_archive(path, err))?;
        if entry.is_dir() {
            continue;
        }

        let name = entry.name().to_string();
        if name.starts_with("../") {
            warn!(entry = %name, "ignoring entry because it is outside the target directory");
            continue;
        }

        let relative = mapping.get(&name).map(String::as_str).unwrap_or(&name);
        let target = target_dir.join(relative);
        trace!(entry = %name, target = %target.display(), "extracting entry");

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&target)?;
        io::copy(&mut entry, &mut output)?;
    }

    Ok(())
}
