//! BagIt package handling: package-level metadata, manifest rewriting after
//! filename pseudonymization, and structural/checksum validation.
//!
//! Runs on ordinary blocking I/O inside the finalize worker path.

use crate::services::{DepositError, DepositResult};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

const MAPPING_FILENAME: &str = "original-filepaths.txt";
const PAYLOAD_MANIFEST_PREFIX: &str = "manifest-";
const TAG_MANIFEST_PREFIX: &str = "tagmanifest-";

/// Package-level identity read from `bag-info.txt`.
#[derive(Clone, Debug, Default)]
pub struct BagMetadata {
    pub sword_token: String,
    pub other_id: Option<String>,
    pub other_id_version: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BagItManager;

impl BagItManager {
    /// The single top-level directory of an extracted deposit. Any other
    /// count is a structural error.
    pub fn bag_dir(&self, deposit_dir: &Path) -> DepositResult<PathBuf> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(deposit_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }

        if dirs.len() != 1 {
            return Err(DepositError::InvalidDeposit(format!(
                "A deposit package must contain exactly one top-level directory, number found: {}",
                dirs.len()
            )));
        }
        Ok(dirs.remove(0))
    }

    /// Read the bag's identity.
    ///
    /// An `Is-Version-Of: urn:uuid:X` element yields token `sword:X`; any
    /// other `Is-Version-Of` value is a structural error. Without one, a
    /// token is minted from the deposit id.
    pub fn bag_metadata(&self, bag_dir: &Path, deposit_id: &str) -> DepositResult<BagMetadata> {
        let info = read_key_values(&bag_dir.join("bag-info.txt")).unwrap_or_default();
        let mut metadata = BagMetadata {
            sword_token: format!("sword:{deposit_id}"),
            other_id: first_value(&info, "Has-Organizational-Identifier"),
            other_id_version: first_value(&info, "Has-Organizational-Identifier-Version"),
        };

        if let Some(versions) = info.get("Is-Version-Of") {
            for token in versions {
                match token.strip_prefix("urn:uuid:") {
                    Some(uuid) => metadata.sword_token = format!("sword:{uuid}"),
                    None => {
                        return Err(DepositError::InvalidDeposit(format!(
                            "The deposit located at {} and ID {deposit_id} has an invalid SWORD token: {token}",
                            bag_dir.display()
                        )));
                    }
                }
            }
        }

        Ok(metadata)
    }

    /// Rewrite the bag's manifests to match a pseudonymization mapping.
    ///
    /// No-op when the mapping is empty. Otherwise: persist the mapping as
    /// `original-filepaths.txt` inside the bag, substitute mapped names into
    /// every payload manifest (checksums preserved), and recompute every tag
    /// manifest over the now-current file set with its own algorithm.
    pub fn update_manifests(
        &self,
        deposit_dir: &Path,
        mapping: &HashMap<String, String>,
    ) -> DepositResult<()> {
        if mapping.is_empty() {
            debug!("no file path mapping entries, not renaming payload manifest entries");
            return Ok(());
        }

        let bag_dir = self.bag_dir(deposit_dir)?;
        let relative = relative_mapping(&bag_dir, mapping);

        write_mapping_file(&bag_dir, &relative)?;
        rewrite_payload_manifests(&bag_dir, &relative)?;
        rewrite_tag_manifests(&bag_dir)?;

        Ok(())
    }

    /// Verify the bag is structurally complete and every checksum matches,
    /// ignoring hidden files. Any failure is a structural error carrying the
    /// concrete reason.
    pub fn verify_bag(&self, deposit_dir: &Path) -> DepositResult<()> {
        let bag_dir = self.bag_dir(deposit_dir)?;
        trace!(bag = %bag_dir.display(), "verifying bag");

        let declaration = read_key_values(&bag_dir.join("bagit.txt")).map_err(|err| {
            DepositError::InvalidDeposit(format!(
                "bag {} has no readable bagit.txt: {err}",
                bag_dir.display()
            ))
        })?;
        for key in ["BagIt-Version", "Tag-File-Character-Encoding"] {
            if !declaration.contains_key(key) {
                return Err(DepositError::InvalidDeposit(format!(
                    "bagit.txt is missing the {key} element"
                )));
            }
        }

        let data_dir = bag_dir.join("data");
        if !data_dir.is_dir() {
            return Err(DepositError::InvalidDeposit(
                "bag has no data directory".to_string(),
            ));
        }

        let payload_manifests = manifest_files(&bag_dir, PAYLOAD_MANIFEST_PREFIX)?;
        if payload_manifests.is_empty() {
            return Err(DepositError::InvalidDeposit(
                "bag has no payload manifest".to_string(),
            ));
        }

        let mut listed = HashSet::new();
        for manifest in payload_manifests.iter().chain(manifest_files(&bag_dir, TAG_MANIFEST_PREFIX)?.iter()) {
            let algorithm = manifest_algorithm(manifest)?;
            for (checksum, relative_path) in parse_manifest(manifest)? {
                let file = bag_dir.join(&relative_path);
                if !file.is_file() {
                    return Err(DepositError::InvalidDeposit(format!(
                        "file {relative_path} is listed in {} but does not exist",
                        manifest_name(manifest)
                    )));
                }

                let actual = checksum_for(&file, &algorithm)?;
                if !actual.eq_ignore_ascii_case(&checksum) {
                    return Err(DepositError::InvalidDeposit(format!(
                        "file {relative_path} has checksum {actual}, expected {checksum}"
                    )));
                }

                if is_payload_manifest(manifest) {
                    listed.insert(relative_path);
                }
            }
        }

        let mut payload_files = Vec::new();
        collect_files(&data_dir, &bag_dir, &mut payload_files)?;
        for file in payload_files {
            if !listed.contains(&file) {
                return Err(DepositError::InvalidDeposit(format!(
                    "payload file {file} is not listed in any manifest"
                )));
            }
        }

        Ok(())
    }
}

/// Re-express an archive-entry mapping (paths include the bag directory
/// name) relative to the bag directory.
fn relative_mapping(bag_dir: &Path, mapping: &HashMap<String, String>) -> HashMap<String, String> {
    let bag_name = bag_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = format!("{bag_name}/");

    mapping
        .iter()
        .map(|(original, mapped)| {
            let strip = |p: &str| {
                p.strip_prefix(&prefix)
                    .map(str::to_string)
                    .unwrap_or_else(|| p.to_string())
            };
            (strip(original), strip(mapped))
        })
        .collect()
}

/// Persist the mapping as `new-path  original-path` pairs, one per line, so
/// provenance is not lost.
fn write_mapping_file(bag_dir: &Path, mapping: &HashMap<String, String>) -> DepositResult<()> {
    let ordered: BTreeMap<&String, &String> = mapping.iter().map(|(k, v)| (v, k)).collect();
    let content = ordered
        .iter()
        .map(|(new_name, original)| format!("{new_name}  {original}"))
        .collect::<Vec<_>>()
        .join("\n");

    fs::write(bag_dir.join(MAPPING_FILENAME), content)?;
    Ok(())
}

fn rewrite_payload_manifests(
    bag_dir: &Path,
    mapping: &HashMap<String, String>,
) -> DepositResult<()> {
    for manifest in manifest_files(bag_dir, PAYLOAD_MANIFEST_PREFIX)? {
        let lines = parse_manifest(&manifest)?
            .into_iter()
            .map(|(checksum, path)| {
                let renamed = mapping.get(&path).cloned().unwrap_or(path);
                format!("{checksum}  {renamed}")
            })
            .collect::<Vec<_>>()
            .join("\n");

        trace!(manifest = %manifest.display(), "writing renamed payload manifest");
        fs::write(&manifest, lines)?;
    }
    Ok(())
}

/// Recompute each tag manifest over its listed files plus the mapping file,
/// using the algorithm named in the manifest's own filename.
fn rewrite_tag_manifests(bag_dir: &Path) -> DepositResult<()> {
    for manifest in manifest_files(bag_dir, TAG_MANIFEST_PREFIX)? {
        let algorithm = manifest_algorithm(&manifest)?;
        let mut paths: HashSet<String> = parse_manifest(&manifest)?
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        paths.insert(MAPPING_FILENAME.to_string());

        let mut ordered: Vec<String> = paths.into_iter().collect();
        ordered.sort();

        let mut lines = Vec::with_capacity(ordered.len());
        for path in ordered {
            let checksum = checksum_for(&bag_dir.join(&path), &algorithm)?;
            lines.push(format!("{checksum}  {path}"));
        }

        trace!(manifest = %manifest.display(), "writing recomputed tag manifest");
        fs::write(&manifest, lines.join("\n"))?;
    }
    Ok(())
}

fn manifest_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_payload_manifest(path: &Path) -> bool {
    manifest_name(path).starts_with(PAYLOAD_MANIFEST_PREFIX)
}

fn manifest_files(bag_dir: &Path, prefix: &str) -> DepositResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(bag_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && entry.file_name().to_string_lossy().starts_with(prefix) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// `manifest-sha256.txt` → `sha256`.
fn manifest_algorithm(manifest: &Path) -> DepositResult<String> {
    let name = manifest_name(manifest);
    name.split_once('-')
        .map(|(_, rest)| rest.trim_end_matches(".txt").to_lowercase())
        .ok_or_else(|| {
            DepositError::InvalidDeposit(format!("manifest {name} does not name an algorithm"))
        })
}

/// Checksum lines: `<checksum><whitespace><path>`. Malformed lines are
/// skipped, matching lenient BagIt readers.
fn parse_manifest(manifest: &Path) -> DepositResult<Vec<(String, String)>> {
    let content = fs::read_to_string(manifest)?;
    Ok(content
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(2, char::is_whitespace);
            match (parts.next(), parts.next()) {
                (Some(checksum), Some(path)) if !checksum.is_empty() => {
                    Some((checksum.to_string(), path.trim().to_string()))
                }
                _ => None,
            }
        })
        .collect())
}

/// `bag-info.txt` / `bagit.txt` style `Key: value` elements; repeated keys
/// accumulate.
fn read_key_values(path: &Path) -> std::io::Result<HashMap<String, Vec<String>>> {
    let content = fs::read_to_string(path)?;
    let mut values: HashMap<String, Vec<String>> = HashMap::new();
    for line in content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            values
                .entry(key.trim().to_string())
                .or_default()
                .push(value.trim().to_string());
        }
    }
    Ok(values)
}

fn first_value(values: &HashMap<String, Vec<String>>, key: &str) -> Option<String> {
    values
        .get(key)
        .and_then(|v| v.first())
        .filter(|v| !v.is_empty())
        .cloned()
}

/// Relative paths (slash-separated) of all non-hidden files under `dir`.
fn collect_files(dir: &Path, base: &Path, out: &mut Vec<String>) -> DepositResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), base, out)?;
        } else {
            let relative = entry
                .path()
                .strip_prefix(base)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or(name);
            out.push(relative);
        }
    }
    Ok(())
}

/// Checksum of a file with the named manifest algorithm, lowercase hex.
pub fn checksum_for(path: &Path, algorithm: &str) -> DepositResult<String> {
    let mut file = fs::File::open(path)?;
    let mut buffer = [0u8; 64 * 1024];

    match algorithm {
        "md5" => {
            let mut context = md5::Context::new();
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                context.consume(&buffer[..read]);
            }
            Ok(format!("{:x}", context.compute()))
        }
        "sha1" => hash_reader::<Sha1>(&mut file, &mut buffer),
        "sha256" => hash_reader::<Sha256>(&mut file, &mut buffer),
        "sha512" => hash_reader::<Sha512>(&mut file, &mut buffer),
        other => Err(DepositError::InvalidDeposit(format!(
            "unsupported manifest algorithm {other}"
        ))),
    }
}

fn hash_reader<D: Digest>(file: &mut fs::File, buffer: &mut [u8]) -> DepositResult<String> {
    let mut digest = D::new();
    loop {
        let read = file.read(buffer)?;
        if read == 0 {
            break;
        }
        digest.update(&buffer[..read]);
    }
    Ok(hex::encode(digest.finalize()))
}
