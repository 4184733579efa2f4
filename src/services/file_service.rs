//! FileService — primitive file operations shared by the ingestion and
//! finalization paths. Streaming writes go through a temporary file that is
//! fsynced and renamed into place, and cleaned up on any error.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::io;
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Stateless facade over the filesystem. Cheap to copy around; exists so the
/// higher-level services share one vocabulary of primitives.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileService;

impl FileService {
    /// Create `directory` and any missing parents.
    pub async fn ensure_directories(&self, directory: &Path) -> io::Result<()> {
        if !directory.exists() {
            fs::create_dir_all(directory).await?;
        }
        Ok(())
    }

    /// Stream `stream` into `target`, computing the MD5 of the bytes as they
    /// pass through. Returns the digest as lowercase hex.
    ///
    /// Writes to a `.tmp-<uuid>` sibling first and renames into place after
    /// flush + fsync; the temporary file is removed on any error.
    pub async fn copy_stream_with_md5<S>(&self, stream: S, target: &Path) -> io::Result<String>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("target path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        let mut digest = Context::new();

        let result: io::Result<()> = async {
            pin_mut!(stream);
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                digest.consume(&chunk);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, target).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        Ok(format!("{:x}", digest.compute()))
    }

    /// Move `source` to `target`, creating the target's parent first.
    pub async fn move_path(&self, source: &Path, target: &Path) -> io::Result<()> {
        if let Some(parent) = target.parent() {
            self.ensure_directories(parent).await?;
        }
        fs::rename(source, target).await
    }

    /// List the regular files directly under `directory`.
    pub async fn list_files(&self, directory: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(directory).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// List the subdirectories directly under `directory`.
    pub async fn list_directories(&self, directory: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(directory).await?;
        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Delete a file; missing files are not an error.
    pub async fn delete_file(&self, file: &Path) -> io::Result<()> {
        match fs::remove_file(file).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Delete a directory tree.
    pub async fn delete_directory(&self, directory: &Path) -> io::Result<()> {
        fs::remove_dir_all(directory).await
    }

    /// Concatenate `files`, in the order given, onto the end of `target`.
    /// The source files are deleted afterwards, merged or not.
    pub async fn merge_files(&self, files: &[PathBuf], target: &Path) -> io::Result<()> {
        let merge: io::Result<()> = async {
            let mut output = OpenOptions::new()
                .create(true)
                .append(true)
                .open(target)
                .await?;
            for file in files {
                let mut input = File::open(file).await?;
                tokio::io::copy(&mut input, &mut output).await?;
            }
            output.flush().await?;
            Ok(())
        }
        .await;

        for file in files {
            if let Err(err) = self.delete_file(file).await {
                debug!("unable to delete merged source {}: {}", file.display(), err);
            }
        }

        merge
    }

    pub async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Usable bytes on the volume holding `path`.
    pub fn available_disk_space(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }

    /// True when both paths live on the same filesystem (same device id).
    pub async fn is_same_filesystem(&self, a: &Path, b: &Path) -> io::Result<bool> {
        use std::os::unix::fs::MetadataExt;
        let meta_a = fs::metadata(a).await?;
        let meta_b = fs::metadata(b).await?;
        Ok(meta_a.dev() == meta_b.dev())
    }

    /// Best-effort probe: can this process create a file in `directory`?
    pub async fn can_write_to(&self, directory: &Path) -> bool {
        let probe = directory.join(format!(".{}", Uuid::new_v4()));
        let outcome = fs::write(&probe, b"").await;
        if let Err(err) = fs::remove_file(&probe).await {
            if err.kind() != io::ErrorKind::NotFound {
                debug!("unable to remove probe file {}: {}", probe.display(), err);
            }
        }
        outcome.is_ok()
    }
}
