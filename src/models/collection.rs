//! Represents a collection — a configured intake/archive pair that deposits
//! are submitted into.

use crate::models::deposit::DepositState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Static configuration for one collection.
///
/// Read-only at runtime; owned by the configuration file, not by the core.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Collection {
    /// Internal name, referenced from deposit records and user grants.
    pub name: String,

    /// External path segment used in collection URLs.
    pub path: String,

    /// Intake directory: deposits live here while open or finalizing.
    pub uploads: PathBuf,

    /// Archive directory: deposits move here wholesale on success.
    pub deposits: PathBuf,

    /// Extra directories probed when resolving a deposit by id, for
    /// deposits handed off to downstream tooling.
    #[serde(default)]
    pub deposit_tracking: Vec<PathBuf>,

    /// Safety margin in bytes that must remain free on the intake volume
    /// after any write.
    pub disk_space_margin: u64,

    /// States for which leftover package files are purged automatically.
    #[serde(default)]
    pub auto_clean: Vec<DepositState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_from_yaml() {
        let yaml = r#"
name: collection1
path: col1
uploads: data/uploads
deposits: data/deposits
disk_space_margin: 1048576
auto_clean: [INVALID, FAILED]
"#;
        let collection: Collection = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(collection.name, "collection1");
        assert_eq!(collection.uploads, PathBuf::from("data/uploads"));
        assert!(collection.deposit_tracking.is_empty());
        assert_eq!(
            collection.auto_clean,
            vec![DepositState::Invalid, DepositState::Failed]
        );
    }
}
