//! Represents a deposit — one client submission, tracked from intake
//! through archival or rejection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Lifecycle state of a deposit.
///
/// Happy path is `Draft → Uploaded → Finalizing → Submitted`. The single
/// permitted backward edge is `Finalizing → Uploaded`, taken only when the
/// target volume runs out of disk space. `Invalid` and `Failed` are terminal
/// and reachable only from `Finalizing`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DepositState {
    #[serde(rename = "DRAFT")]
    Draft,
    #[serde(rename = "UPLOADED")]
    Uploaded,
    #[serde(rename = "FINALIZING")]
    Finalizing,
    #[serde(rename = "SUBMITTED")]
    Submitted,
    #[serde(rename = "INVALID")]
    Invalid,
    #[serde(rename = "FAILED")]
    Failed,
}

impl fmt::Display for DepositState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DepositState::Draft => "DRAFT",
            DepositState::Uploaded => "UPLOADED",
            DepositState::Finalizing => "FINALIZING",
            DepositState::Submitted => "SUBMITTED",
            DepositState::Invalid => "INVALID",
            DepositState::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

impl FromStr for DepositState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "DRAFT" => Ok(DepositState::Draft),
            "UPLOADED" => Ok(DepositState::Uploaded),
            "FINALIZING" => Ok(DepositState::Finalizing),
            "SUBMITTED" => Ok(DepositState::Submitted),
            "INVALID" => Ok(DepositState::Invalid),
            "FAILED" => Ok(DepositState::Failed),
            other => Err(format!("unknown deposit state `{other}`")),
        }
    }
}

/// A single deposit, as projected from its on-disk record.
///
/// The struct is a plain value: every lifecycle operation reloads it from
/// disk, mutates its copy, and persists explicitly. No in-memory copy is
/// assumed current across a suspension point.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Deposit {
    /// Generated identifier (UUID), immutable once assigned.
    pub id: String,

    /// Caller-supplied slug; when present it is the externally visible id.
    pub slug: Option<String>,

    /// Original filename of the uploaded part.
    pub filename: Option<String>,

    /// Declared content type of the pending part. Cleared once extracted.
    pub mime_type: Option<String>,

    /// Verified MD5 of the last uploaded part, lowercase hex.
    pub md5: Option<String>,

    /// Declared packaging format URI.
    pub packaging: Option<String>,

    /// Identity of the owning depositor.
    pub depositor: String,

    /// Name of the bag directory inside the deposit, once known.
    pub bag_name: Option<String>,

    /// Opaque token assigned when the package identity is established.
    pub sword_token: Option<String>,

    /// Externally assigned identifier discovered inside the package.
    pub other_id: Option<String>,

    /// Version of the externally assigned identifier.
    pub other_id_version: Option<String>,

    /// When the deposit was created.
    pub created: DateTime<Utc>,

    /// Current lifecycle state.
    pub state: DepositState,

    /// Human-readable reason for the current state.
    pub state_description: String,

    /// Directory currently holding the deposit (intake or archive area).
    #[serde(skip)]
    pub path: PathBuf,

    /// Name of the owning collection.
    pub collection_id: String,

    /// True while the client may still append payload parts.
    pub in_progress: bool,

    /// Declared content length of the last part; -1 when unknown.
    pub content_length: i64,
}

impl Deposit {
    /// The externally visible id: the slug when one was supplied, the
    /// generated id otherwise.
    pub fn canonical_id(&self) -> &str {
        self.slug.as_deref().unwrap_or(&self.id)
    }
}
