//! The durable per-deposit record: a flat `deposit.properties` file living
//! next to the deposit's content. It is the sole persisted state and is
//! rewritten atomically on every transition.

use crate::models::deposit::{Deposit, DepositState};
use crate::services::{DepositError, DepositResult};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

pub const RECORD_FILENAME: &str = "deposit.properties";

const ORIGIN: &str = "SWORD2";

#[derive(Clone, Copy, Debug, Default)]
pub struct DepositRecordStore;

impl DepositRecordStore {
    fn record_path(&self, deposit_dir: &Path) -> PathBuf {
        deposit_dir.join(RECORD_FILENAME)
    }

    /// Persist `deposit` into `<deposit_dir>/deposit.properties`.
    ///
    /// The file is rewritten whole via a temp-file rename so readers never
    /// observe a half-written record.
    pub async fn save(&self, deposit_dir: &Path, deposit: &Deposit) -> DepositResult<()> {
        let mut entries = BTreeMap::new();
        entries.insert("bag-store.bag-id", deposit.id.clone());
        entries.insert("dataverse.bag-id", format!("urn:uuid:{}", deposit.id));
        entries.insert("creation.timestamp", deposit.created.to_rfc3339());
        entries.insert("deposit.origin", ORIGIN.to_string());
        entries.insert("depositor.userId", deposit.depositor.clone());
        entries.insert("state.label", deposit.state.to_string());
        entries.insert("state.description", deposit.state_description.clone());
        entries.insert(
            "bag-store.bag-name",
            deposit.bag_name.clone().unwrap_or_default(),
        );
        entries.insert(
            "dataverse.sword-token",
            deposit.sword_token.clone().unwrap_or_default(),
        );

        if let Some(other_id) = deposit.other_id.as_deref().filter(|v| !v.is_empty()) {
            entries.insert("dataverse.other-id", other_id.to_string());
        }
        if let Some(version) = deposit.other_id_version.as_deref().filter(|v| !v.is_empty()) {
            entries.insert("dataverse.other-id-version", version.to_string());
        }
        // Only kept while a package part still awaits extraction.
        if let Some(mime_type) = deposit.mime_type.as_deref() {
            entries.insert("easy-sword2.client-message.content-type", mime_type.to_string());
        }

        let mut content = String::new();
        for (key, value) in &entries {
            content.push_str(key);
            content.push_str(" = ");
            content.push_str(value);
            content.push('\n');
        }

        fs::create_dir_all(deposit_dir).await?;
        let tmp_path = deposit_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        fs::write(&tmp_path, content).await?;
        if let Err(err) = fs::rename(&tmp_path, self.record_path(deposit_dir)).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        Ok(())
    }

    /// Rehydrate a deposit from its record.
    ///
    /// `path` and `collection_id` are positional facts, not record contents;
    /// the caller fills them in from where the record was found.
    pub async fn load(&self, deposit_dir: &Path) -> DepositResult<Deposit> {
        let record_path = self.record_path(deposit_dir);
        let content = fs::read_to_string(&record_path).await.map_err(|err| {
            DepositError::InvalidDeposit(format!(
                "unable to read record {}: {err}",
                record_path.display()
            ))
        })?;

        let mut entries = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let required = |key: &str| -> DepositResult<String> {
            entries.get(key).cloned().ok_or_else(|| {
                DepositError::InvalidDeposit(format!(
                    "record {} is missing key `{key}`",
                    record_path.display()
                ))
            })
        };
        let optional = |key: &str| -> Option<String> {
            entries.get(key).filter(|v| !v.is_empty()).cloned()
        };

        let state: DepositState = required("state.label")?
            .parse()
            .map_err(DepositError::InvalidDeposit)?;
        let created: DateTime<Utc> = required("creation.timestamp")?
            .parse()
            .map_err(|err| {
                DepositError::InvalidDeposit(format!("unparseable creation timestamp: {err}"))
            })?;

        Ok(Deposit {
            id: required("bag-store.bag-id")?,
            slug: None,
            filename: None,
            mime_type: optional("easy-sword2.client-message.content-type"),
            md5: None,
            packaging: None,
            depositor: required("depositor.userId")?,
            bag_name: optional("bag-store.bag-name"),
            sword_token: optional("dataverse.sword-token"),
            other_id: optional("dataverse.other-id"),
            other_id_version: optional("dataverse.other-id-version"),
            created,
            state,
            state_description: required("state.description")?,
            path: deposit_dir.to_path_buf(),
            collection_id: String::new(),
            in_progress: false,
            content_length: -1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_deposit() -> Deposit {
        Deposit {
            id: "6e6b1fc2-05b5-4850-b144-8573d22b6ba6".to_string(),
            slug: None,
            filename: Some("bag.zip".to_string()),
            mime_type: Some("application/zip".to_string()),
            md5: Some("abc".to_string()),
            packaging: None,
            depositor: "user001".to_string(),
            bag_name: Some("audiences".to_string()),
            sword_token: Some("sword:6e6b1fc2-05b5-4850-b144-8573d22b6ba6".to_string()),
            other_id: None,
            other_id_version: None,
            created: "2022-05-01T01:10:00+00:00".parse().unwrap(),
            state: DepositState::Uploaded,
            state_description: "Deposit is open for additional data".to_string(),
            path: PathBuf::new(),
            collection_id: "collection1".to_string(),
            in_progress: false,
            content_length: 1024,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips_the_record() {
        let dir = tempdir().unwrap();
        let store = DepositRecordStore;
        let deposit = sample_deposit();

        store.save(dir.path(), &deposit).await.unwrap();
        let loaded = store.load(dir.path()).await.unwrap();

        assert_eq!(loaded.id, deposit.id);
        assert_eq!(loaded.state, deposit.state);
        assert_eq!(loaded.state_description, deposit.state_description);
        assert_eq!(loaded.depositor, deposit.depositor);
        assert_eq!(loaded.created, deposit.created);
        assert_eq!(loaded.bag_name, deposit.bag_name);
        assert_eq!(loaded.sword_token, deposit.sword_token);
        assert_eq!(loaded.mime_type, deposit.mime_type);
        assert_eq!(loaded.path, dir.path());
    }

    #[tokio::test]
    async fn mime_type_key_is_dropped_once_cleared() {
        let dir = tempdir().unwrap();
        let store = DepositRecordStore;
        let mut deposit = sample_deposit();

        store.save(dir.path(), &deposit).await.unwrap();
        deposit.mime_type = None;
        store.save(dir.path(), &deposit).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join(RECORD_FILENAME)).unwrap();
        assert!(!content.contains("easy-sword2.client-message.content-type"));
        assert!(content.contains("deposit.origin = SWORD2"));
        assert!(content.contains(&format!("dataverse.bag-id = urn:uuid:{}", deposit.id)));
    }

    #[tokio::test]
    async fn missing_record_is_an_invalid_deposit() {
        let dir = tempdir().unwrap();
        let store = DepositRecordStore;
        match store.load(dir.path()).await {
            Err(DepositError::InvalidDeposit(_)) => {}
            other => panic!("expected InvalidDeposit, got {other:?}"),
        }
    }
}
