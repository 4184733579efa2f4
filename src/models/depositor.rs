//! Represents a depositor — an account permitted to submit into a set of
//! collections.

use serde::{Deserialize, Serialize};

/// Configured depositor account.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Depositor {
    /// Account name, recorded in each deposit it owns.
    pub name: String,

    /// When true, payload file names are pseudonymized during extraction.
    #[serde(default)]
    pub filepath_mapping: bool,

    /// Names of the collections this depositor may submit into.
    #[serde(default)]
    pub collections: Vec<String>,
}
