//! Admission control: refuse a write when it would push the free space on
//! the target volume below the collection's configured safety margin.

use crate::services::file_service::FileService;
use crate::services::{DepositError, DepositResult};
use std::path::Path;
use tracing::trace;

/// A content length of this value means "size unknown, skip the check".
pub const UNKNOWN_CONTENT_LENGTH: i64 = -1;

/// Pure admission predicate: does a write of `content_length` bytes into a
/// volume with `available` bytes free leave at least `margin` bytes?
///
/// A negative `content_length` is the unknown sentinel and always passes.
pub fn fits_within_margin(available: u64, margin: u64, content_length: i64) -> bool {
    if content_length < 0 {
        return true;
    }
    available as i128 - content_length as i128 >= margin as i128
}

#[derive(Clone, Copy, Debug)]
pub struct FilesystemSpaceVerifier {
    file_service: FileService,
}

impl FilesystemSpaceVerifier {
    pub fn new(file_service: FileService) -> Self {
        Self { file_service }
    }

    /// Fail with [`DepositError::OutOfDiskSpace`] unless `destination`'s
    /// volume can absorb `content_length` bytes and still keep `margin` free.
    pub fn ensure_margin_for(
        &self,
        destination: &Path,
        margin: u64,
        content_length: i64,
    ) -> DepositResult<()> {
        if content_length < 0 {
            trace!("content length is unknown, not checking disk space margin");
            return Ok(());
        }

        let available = self.file_service.available_disk_space(destination)?;
        trace!(
            available,
            margin, content_length, "checking disk space margin"
        );

        if !fits_within_margin(available, margin, content_length) {
            return Err(DepositError::OutOfDiskSpace);
        }
        Ok(())
    }

    /// Margin-only form, used by the readiness probe.
    pub fn ensure_margin(&self, destination: &Path, margin: u64) -> DepositResult<()> {
        let available = self.file_service.available_disk_space(destination)?;
        if available < margin {
            return Err(DepositError::OutOfDiskSpace);
        }
        Ok(())
    }
}
