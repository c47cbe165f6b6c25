// dumpcheck/src/backup/mod.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Credentials;
use crate::errors::HarnessError;
use crate::tools::{BackupAction, BackupRequest, ClientTools};

/// A hot backup known to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSnapshot {
    pub name: String,
    pub created_by: String,
    pub key_fingerprints: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListingKey {
    sha256: String,
}

#[derive(Debug, Deserialize)]
struct ListingEntry {
    #[serde(default)]
    keys: Vec<ListingKey>,
}

/// Lowercase hex SHA-256 of the key material, as recorded in backup metadata.
pub fn key_fingerprint(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Label part of a snapshot name (`<timestamp>_<label>`).
fn label_of(name: &str) -> &str {
    name.split_once('_').map(|(_, label)| label).unwrap_or(name)
}

/// Parses the `name -> {keys: [{sha256}], ...}` listing, in name order.
pub fn parse_listing(listing: &serde_json::Value) -> Result<Vec<BackupSnapshot>> {
    let entries = listing
        .as_object()
        .context("backup listing must be a JSON object keyed by snapshot name")?;
    entries
        .iter()
        .map(|(name, value)| {
            let entry: ListingEntry = serde_json::from_value(value.clone())
                .with_context(|| format!("malformed listing entry for backup {}", name))?;
            Ok(BackupSnapshot {
                name: name.clone(),
                created_by: label_of(name).to_string(),
                key_fingerprints: entry.keys.into_iter().map(|k| k.sha256.to_lowercase()).collect(),
            })
        })
        .collect()
}

/// Hot backups of one server.
pub struct BackupCatalog<'a, T> {
    tools: &'a T,
    endpoint: String,
    auth: Option<Credentials>,
}

impl<'a, T: ClientTools> BackupCatalog<'a, T> {
    pub fn new(tools: &'a T, endpoint: impl Into<String>, auth: Option<Credentials>) -> Self {
        BackupCatalog {
            tools,
            endpoint: endpoint.into(),
            auth,
        }
    }

    pub async fn list(&self) -> Result<Vec<BackupSnapshot>> {
        let listing = self
            .tools
            .list_backups(&self.endpoint, self.auth.as_ref())
            .await
            .context("Failed to list hot backups")?;
        parse_listing(&listing)
    }

    /// Finds a snapshot whose name contains `label`. When several match, the
    /// last one in listing order is returned.
    pub async fn find_by_label(&self, label: &str) -> Result<Option<BackupSnapshot>> {
        let snapshots = self.list().await?;
        Ok(snapshots.into_iter().filter(|s| s.name.contains(label)).last())
    }

    /// Creates a hot backup carrying `label` and returns its name.
    pub async fn create(&self, label: &str) -> Result<String> {
        let outcome = self
            .tools
            .backup(&BackupRequest {
                action: BackupAction::Create,
                endpoint: self.endpoint.clone(),
                auth: self.auth.clone(),
                label: Some(label.to_string()),
                identifier: None,
                max_wait_for_restart: None,
            })
            .await
            .context("Failed to create hot backup")?;
        if !outcome.status {
            anyhow::bail!("hot backup creation failed: {}", outcome.message.trim());
        }
        let name = match outcome.identifier {
            Some(name) => name,
            None => self
                .find_by_label(label)
                .await?
                .map(|s| s.name)
                .with_context(|| format!("created backup with label {} is not listed", label))?,
        };
        info!(backup = %name, "hot backup created");
        Ok(name)
    }

    /// Restores the snapshot matching `label`.
    ///
    /// Every fingerprint in `key_fingerprints` must be recorded on the snapshot;
    /// otherwise the restore is not attempted and an `IntegrityMismatch` is returned.
    pub async fn restore_latest(
        &self,
        label: &str,
        key_fingerprints: &[String],
        max_wait: Duration,
    ) -> Result<BackupSnapshot> {
        let snapshot = self
            .find_by_label(label)
            .await?
            .with_context(|| format!("no hot backup matches label {}", label))?;

        if let Some(missing) = key_fingerprints
            .iter()
            .find(|fp| !snapshot.key_fingerprints.iter().any(|have| have.eq_ignore_ascii_case(fp)))
        {
            warn!(backup = %snapshot.name, fingerprint = %missing, "backup key fingerprint mismatch");
            return Err(HarnessError::IntegrityMismatch {
                snapshot: snapshot.name.clone(),
                fingerprint: missing.clone(),
            }
            .into());
        }

        info!(backup = %snapshot.name, "restoring hot backup");
        let outcome = self
            .tools
            .backup(&BackupRequest {
                action: BackupAction::Restore,
                endpoint: self.endpoint.clone(),
                auth: self.auth.clone(),
                label: None,
                identifier: Some(snapshot.name.clone()),
                max_wait_for_restart: Some(max_wait),
            })
            .await
            .context("Failed to restore hot backup")?;
        if !outcome.status {
            anyhow::bail!("hot backup restore of {} failed: {}", snapshot.name, outcome.message.trim());
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{FakeCluster, FakeTools};
    use serde_json::json;

    const KEY_H1: &str = "01234567890123456789012345678901";
    const KEY_H2: &str = "abcdefghijklmnopqrstuvwxyz012345";

    #[test]
    fn fingerprint_is_hex_sha256() {
        assert_eq!(
            key_fingerprint("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn parse_listing_reads_keys() -> Result<()> {
        let listing = json!({
            "2024-01-01T10.00.00Z_nightly": { "keys": [{ "sha256": "AA" }] },
            "2024-01-02T10.00.00Z_nightly": { "keys": [] },
            "2024-01-03T10.00.00Z_adhoc": {}
        });
        let snapshots = parse_listing(&listing)?;
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].created_by, "nightly");
        assert_eq!(snapshots[0].key_fingerprints, vec!["aa".to_string()]);
        assert!(snapshots[2].key_fingerprints.is_empty());

        assert!(parse_listing(&json!(["not", "an", "object"])).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn find_by_label_prefers_last_match() -> Result<()> {
        let cluster = FakeCluster::new();
        let tools = FakeTools::new(&cluster);
        let catalog = BackupCatalog::new(&tools, "tcp://127.0.0.1:8529", None);

        catalog.create("dumpcheck").await?;
        let second = catalog.create("dumpcheck").await?;
        catalog.create("other").await?;

        let found = catalog.find_by_label("dumpcheck").await?;
        assert_eq!(found.map(|s| s.name), Some(second));
        assert!(catalog.find_by_label("missing").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn key_mismatch_never_issues_restore() -> Result<()> {
        let cluster = FakeCluster::new();
        cluster.set_backup_key(Some(KEY_H1));
        let tools = FakeTools::new(&cluster);
        let catalog = BackupCatalog::new(&tools, "tcp://127.0.0.1:8529", None);
        catalog.create("dumpcheck").await?;

        let err = catalog
            .restore_latest("dumpcheck", &[key_fingerprint(KEY_H2)], Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(
            HarnessError::classify(&err),
            Some(HarnessError::IntegrityMismatch { .. })
        ));
        assert_eq!(cluster.backup_restores(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn matching_key_restores() -> Result<()> {
        let cluster = FakeCluster::new();
        cluster.set_backup_key(Some(KEY_H1));
        let tools = FakeTools::new(&cluster);
        let catalog = BackupCatalog::new(&tools, "tcp://127.0.0.1:8529", None);
        let name = catalog.create("dumpcheck").await?;

        let restored = catalog
            .restore_latest("dumpcheck", &[key_fingerprint(KEY_H1)], Duration::from_secs(1))
            .await?;
        assert_eq!(restored.name, name);
        assert_eq!(cluster.backup_restores(), 1);
        Ok(())
    }
}
