//! Caller-facing client
//!
//! [`CloudClient`] is the one contract a host talks to, whichever provider
//! is configured. It pairs a [`SyncEngine`] with a [`BackupManager`] over
//! the same store.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::backup::{BackupManager, PurgeReport};
use crate::batch::{log_error, spawn_detached};
use crate::config::{CloudSyncConfig, SyncSettings};
use crate::error::{CloudSyncError, Result};
use crate::local::LocalSaves;
use crate::store::{MemoryStore, RemoteStore};
use crate::sync::SyncEngine;
use crate::types::{Backup, SaveListing, Staleness};

/// Remote backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Dropbox,
    Drive,
    Memory,
}

impl FromStr for Provider {
    type Err = CloudSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dropbox" => Ok(Provider::Dropbox),
            "drive" | "gdrive" | "google-drive" => Ok(Provider::Drive),
            "memory" => Ok(Provider::Memory),
            other => Err(CloudSyncError::InvalidInput(format!(
                "Unknown provider: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::Dropbox => "dropbox",
            Provider::Drive => "drive",
            Provider::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Build the store for `provider` from configuration
pub fn open_store(provider: Provider, config: &CloudSyncConfig) -> Result<Arc<dyn RemoteStore>> {
    match provider {
        #[cfg(feature = "dropbox")]
        Provider::Dropbox => Ok(Arc::new(crate::store::DropboxStore::new(&config.dropbox)?)),
        #[cfg(feature = "gdrive")]
        Provider::Drive => Ok(Arc::new(crate::store::DriveStore::new(&config.drive)?)),
        Provider::Memory => Ok(Arc::new(MemoryStore::new())),
        #[allow(unreachable_patterns)]
        other => {
            let _ = config;
            Err(CloudSyncError::Config(format!(
                "Provider {} is not compiled in",
                other
            )))
        }
    }
}

/// The save/backup contract exposed to hosts
#[derive(Clone)]
pub struct CloudClient {
    engine: Arc<SyncEngine>,
    backups: Arc<BackupManager>,
}

impl CloudClient {
    pub fn new(store: Arc<dyn RemoteStore>, local: LocalSaves) -> Self {
        Self {
            backups: Arc::new(BackupManager::new(store.clone())),
            engine: Arc::new(SyncEngine::new(store, local)),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn backup_manager(&self) -> &BackupManager {
        &self.backups
    }

    pub fn is_authenticated(&self) -> bool {
        self.engine.is_authenticated()
    }

    pub async fn get_saves(&self) -> Result<SaveListing> {
        self.engine.get_saves().await
    }

    /// Saves in the local saves root
    pub fn local_saves(&self) -> Result<SaveListing> {
        self.engine.local().list()
    }

    pub async fn delete_save(&self, save_name: &str) -> Result<()> {
        self.engine.delete_save(save_name).await
    }

    pub async fn upload_save(&self, save_name: &str) -> Result<()> {
        self.engine.upload_save(save_name).await
    }

    pub async fn download_save(&self, save_name: &str, dest_parent: &Path) -> Result<()> {
        self.engine.download_save(save_name, dest_parent).await
    }

    pub async fn get_backups(&self) -> Result<Vec<Backup>> {
        self.backups.list().await
    }

    pub async fn delete_backup(&self, cloud_folder_name: &str) -> Result<()> {
        self.backups.delete_backup(cloud_folder_name).await
    }

    /// Snapshot the cloud save; a save absent from the cloud is a no-op
    pub async fn backup_save(&self, save_name: &str) -> Result<Option<String>> {
        self.engine.backup_save(save_name).await
    }

    pub async fn download_backup(&self, cloud_folder_name: &str, dest_parent: &Path) -> Result<()> {
        self.backups
            .download_backup(cloud_folder_name, dest_parent)
            .await
    }

    pub async fn purge_backups(&self, keep: usize) -> PurgeReport {
        self.backups.purge(keep).await
    }

    /// Run [`purge_backups`](Self::purge_backups) in the background
    pub fn spawn_purge(&self, keep: usize) -> JoinHandle<()> {
        let backups = self.backups.clone();
        spawn_detached(
            "purge_backups",
            async move {
                let report = backups.purge(keep).await;
                tracing::info!(
                    deleted = report.deleted.len(),
                    failed = report.failed.len(),
                    kept = report.kept,
                    "Backup purge finished"
                );
                Ok(())
            },
            log_error("purge_backups"),
        )
    }

    pub async fn replace_save(&self, save_name: &str, settings: &SyncSettings) -> Result<()> {
        self.engine.replace_save(save_name, settings).await
    }

    pub async fn replace_save_without_backup(&self, save_name: &str) -> Result<()> {
        self.engine.replace_save_without_backup(save_name).await
    }

    pub async fn restore_save(&self, save_name: &str) -> Result<()> {
        self.engine.restore_save(save_name).await
    }

    pub async fn restore_backup(&self, backup: &Backup) -> Result<()> {
        self.engine.restore_backup(backup).await
    }

    pub async fn upload_staleness(&self, save_name: &str) -> Result<Staleness> {
        self.engine.upload_staleness(save_name).await
    }

    pub async fn download_staleness(&self, save_name: &str) -> Result<Staleness> {
        self.engine.download_staleness(save_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parsing() {
        assert_eq!("Dropbox".parse::<Provider>().unwrap(), Provider::Dropbox);
        assert_eq!("gdrive".parse::<Provider>().unwrap(), Provider::Drive);
        assert_eq!("memory".parse::<Provider>().unwrap(), Provider::Memory);
        assert!("s3".parse::<Provider>().is_err());
        assert_eq!(Provider::Drive.to_string(), "drive");
    }

    #[test]
    fn test_open_memory_store() {
        let store = open_store(Provider::Memory, &CloudSyncConfig::default()).unwrap();
        assert_eq!(store.name(), "memory");
        assert!(store.is_authenticated());
    }
}
