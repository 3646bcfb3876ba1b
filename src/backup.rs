//! Backup enumeration and retention
//!
//! Backups are identified purely by their folder name (see [`crate::naming`]).
//! Pruning keeps the newest `keep` backups of each save; ties on timestamp
//! are broken by folder name so repeated runs delete the same set.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::batch::{drain_all, settle_all};
use crate::error::{CloudSyncError, Result};
use crate::naming::decode_backup_name;
use crate::store::RemoteStore;
use crate::types::{Backup, RemoteEntry, RemoteRef};

/// Outcome of a purge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Backups left in place
    pub kept: usize,
    /// Cloud folder names deleted
    pub deleted: Vec<String>,
    /// Cloud folder names that could not be deleted, with the reason
    pub failed: Vec<(String, String)>,
}

/// Pick the items to delete so that at most `keep` backups remain per
/// logical name, keeping the most recent.
pub fn prune_plan<T, F>(items: &[T], keep: usize, backup_of: F) -> Vec<&T>
where
    F: Fn(&T) -> &Backup,
{
    let mut groups: BTreeMap<&str, Vec<&T>> = BTreeMap::new();
    for item in items {
        groups
            .entry(backup_of(item).folder_name.as_str())
            .or_default()
            .push(item);
    }

    let mut doomed = Vec::new();
    for (_, mut group) in groups {
        group.sort_by(|a, b| {
            let (a, b) = (backup_of(a), backup_of(b));
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.cloud_folder_name.cmp(&b.cloud_folder_name))
        });
        doomed.extend(group.into_iter().skip(keep));
    }
    doomed
}

/// [`prune_plan`] over plain backups
pub fn prune_backups(backups: &[Backup], keep: usize) -> Vec<&Backup> {
    prune_plan(backups, keep, |b| b)
}

/// Lists, deletes and prunes backups in a store's Backups container
pub struct BackupManager {
    store: Arc<dyn RemoteStore>,
}

impl BackupManager {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    fn require_auth(&self) -> Result<()> {
        if self.store.is_authenticated() {
            return Ok(());
        }
        Err(CloudSyncError::NotAuthenticated(format!(
            "{} credentials are missing",
            self.store.name()
        )))
    }

    /// Backups with the folder they live in
    async fn entries(&self) -> Result<Vec<(Backup, RemoteRef)>> {
        self.require_auth()?;
        let layout = self.store.ensure_layout().await?;
        let listing = self.store.list_folder(&layout.backups).await?;
        Ok(listing
            .into_iter()
            .filter(|e| e.is_folder)
            .filter_map(decode_entry)
            .collect())
    }

    /// Every backup, newest first
    pub async fn list(&self) -> Result<Vec<Backup>> {
        let mut backups: Vec<Backup> = self.entries().await?.into_iter().map(|(b, _)| b).collect();
        backups.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.cloud_folder_name.cmp(&b.cloud_folder_name))
        });
        Ok(backups)
    }

    async fn find(&self, cloud_folder_name: &str) -> Result<Vec<RemoteEntry>> {
        self.require_auth()?;
        let layout = self.store.ensure_layout().await?;
        self.store
            .find_folders(&layout.backups, cloud_folder_name)
            .await
    }

    /// Delete every backup folder with this name; missing ones succeed
    pub async fn delete_backup(&self, cloud_folder_name: &str) -> Result<()> {
        let folders = self.find(cloud_folder_name).await?;
        let tasks: Vec<BoxFuture<'_, Result<()>>> = folders
            .iter()
            .map(|f| self.store.delete(&f.reference))
            .collect();
        drain_all(tasks).await?;
        tracing::info!("Deleted backup {}", cloud_folder_name);
        Ok(())
    }

    /// Mirror a backup into `dest_parent/<cloud_folder_name>`
    pub async fn download_backup(&self, cloud_folder_name: &str, dest_parent: &Path) -> Result<()> {
        let entry = self
            .find(cloud_folder_name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CloudSyncError::NotFound(format!("Backup {}", cloud_folder_name)))?;
        self.store
            .download_tree(&entry.reference, &dest_parent.join(cloud_folder_name))
            .await
    }

    /// Delete all but the newest `keep` backups of each save
    ///
    /// Never fails: listing and deletion errors are logged and reported.
    pub async fn purge(&self, keep: usize) -> PurgeReport {
        let entries = match self.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("Failed to list backups for purge: {}", e);
                return PurgeReport::default();
            }
        };

        let doomed = prune_plan(&entries, keep, |(backup, _)| backup);
        tracing::info!(
            "Purging {} of {} backups (keeping {} per save)",
            doomed.len(),
            entries.len(),
            keep
        );

        let settled = settle_all(doomed.iter().map(|(backup, reference)| {
            (
                backup.cloud_folder_name.clone(),
                self.store.delete(reference),
            )
        }))
        .await;

        PurgeReport {
            kept: entries.len() - doomed.len(),
            deleted: settled.succeeded,
            failed: settled.failed,
        }
    }
}

fn decode_entry(entry: RemoteEntry) -> Option<(Backup, RemoteRef)> {
    match decode_backup_name(&entry.name) {
        Ok(decoded) => Some((
            Backup {
                folder_name: decoded.logical_name,
                cloud_folder_name: entry.name,
                timestamp: decoded.timestamp,
            },
            entry.reference,
        )),
        Err(e) => {
            tracing::warn!("Skipping folder in Backups: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::parse_timestamp;

    fn backup(name: &str, ts: &str) -> Backup {
        Backup {
            folder_name: name.to_string(),
            cloud_folder_name: format!("{}_[{}]", name, ts),
            timestamp: parse_timestamp(ts).unwrap(),
        }
    }

    fn names(backups: Vec<&Backup>) -> Vec<String> {
        backups
            .into_iter()
            .map(|b| b.cloud_folder_name.clone())
            .collect()
    }

    #[test]
    fn test_prune_keeps_newest_per_save() {
        let backups = vec![
            backup("Farm1", "2024-01-01T10.00.00+0000"),
            backup("Farm1", "2024-01-10T10.00.00+0000"),
            backup("Farm1", "2024-01-05T10.00.00+0000"),
            backup("Farm2", "2023-06-01T10.00.00+0000"),
        ];
        assert_eq!(
            names(prune_backups(&backups, 2)),
            vec!["Farm1_[2024-01-01T10.00.00+0000]"]
        );
        assert!(prune_backups(&backups, 3).is_empty());
        assert_eq!(prune_backups(&backups, 0).len(), 4);
    }

    #[test]
    fn test_prune_compares_instants_across_offsets() {
        // 10:00+0200 is 08:00 UTC, older than 09:00+0000
        let backups = vec![
            backup("Farm1", "2024-01-01T10.00.00+0200"),
            backup("Farm1", "2024-01-01T09.00.00+0000"),
        ];
        assert_eq!(
            names(prune_backups(&backups, 1)),
            vec!["Farm1_[2024-01-01T10.00.00+0200]"]
        );
    }

    #[test]
    fn test_prune_ties_broken_by_name() {
        let ts = "2024-01-01T10.00.00+0000";
        let mut a = backup("Farm1", ts);
        a.cloud_folder_name = "Farm1_[b]".into();
        let mut b = backup("Farm1", ts);
        b.cloud_folder_name = "Farm1_[a]".into();

        let forward = vec![a.clone(), b.clone()];
        let reverse = vec![b, a];
        assert_eq!(names(prune_backups(&forward, 1)), vec!["Farm1_[b]"]);
        assert_eq!(names(prune_backups(&reverse, 1)), vec!["Farm1_[b]"]);
    }

    #[test]
    fn test_decode_entry_skips_non_backups() {
        let entry = |name: &str| RemoteEntry {
            name: name.to_string(),
            is_folder: true,
            reference: RemoteRef::new(name),
            parents: Vec::new(),
            metadata: None,
        };
        assert!(decode_entry(entry("Farm1_random")).is_none());
        let (decoded, _) = decode_entry(entry("Farm_1_123_[2024-01-01T10.00.00+0000]")).unwrap();
        assert_eq!(decoded.folder_name, "Farm_1_123");
    }
}
