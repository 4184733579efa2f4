//! Core services: the deposit lifecycle, package extraction, manifest
//! handling, the durable per-deposit record, and the finalization scheduler.
//!
//! All services share the closed [`DepositError`] taxonomy below; callers
//! dispatch on the variant, never on type identity.

use std::io;
use thiserror::Error;

pub mod bag_extractor;
pub mod bagit_manager;
pub mod deposit_record;
pub mod deposit_service;
pub mod file_service;
pub mod finalizer;
pub mod space_verifier;
pub mod zip_service;

/// Every failure the deposit pipeline can produce.
#[derive(Debug, Error)]
pub enum DepositError {
    /// The referenced collection is not configured (or not permitted).
    #[error("collection `{0}` could not be found")]
    CollectionNotFound(String),

    /// No deposit directory with this id exists in any configured area.
    #[error("deposit with id {0} could not be found")]
    DepositNotFound(String),

    /// Payload may only be appended while the deposit is in DRAFT.
    #[error("deposit id {0} is not in DRAFT state")]
    DepositReadOnly(String),

    /// Computed payload checksum disagrees with the declared one.
    #[error("hash {actual} does not match expected hash {expected}")]
    HashMismatch { expected: String, actual: String },

    /// Declared content type is not one the service accepts.
    #[error("not acceptable content type {0}")]
    InvalidContentType(String),

    /// Declared packaging format is not one the service accepts.
    #[error("unsupported packaging {0}")]
    UnsupportedPackaging(String),

    /// The package is structurally broken: wrong top-level directory count,
    /// incomplete bag, checksum mismatch inside the bag, unreadable record.
    #[error("invalid deposit: {0}")]
    InvalidDeposit(String),

    /// A sequenced chunk carries a missing or non-positive sequence suffix.
    #[error("invalid partial file: {0}")]
    InvalidPartialFile(String),

    /// The target volume cannot hold the write plus the configured margin.
    #[error("not enough disk space available")]
    OutOfDiskSpace,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type DepositResult<T> = Result<T, DepositError>;
