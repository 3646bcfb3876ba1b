//! Save synchronization
//!
//! [`SyncEngine`] moves whole saves between the local saves root and a
//! [`RemoteStore`]. It never talks to a provider directly, so the same
//! workflows run against every backend.
//!
//! Transfer policies differ by direction:
//! - Upload and delete drain: every dispatched operation finishes before
//!   the first failure is reported, leaving a state that a retry can fix
//! - Download aborts: the first failure cancels the rest, since a partial
//!   local save is worse than none
//!
//! No workflow is transactional. An interrupted upload or replace leaves
//! whatever objects were already written in place.

mod upload;

pub use upload::{UploadGuard, UploadRegistry};

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::Local;
use futures::future::{join_all, BoxFuture};

use crate::batch::drain_all;
use crate::config::SyncSettings;
use crate::error::{CloudSyncError, Result};
use crate::local::LocalSaves;
use crate::naming::{backup_name, format_description};
use crate::rules::LocalTree;
use crate::store::RemoteStore;
use crate::types::{Backup, ContainerLayout, RemoteEntry, SaveInfo, SaveListing, Staleness};

/// Provider-agnostic save workflows
pub struct SyncEngine {
    store: Arc<dyn RemoteStore>,
    local: LocalSaves,
    uploading: Arc<UploadRegistry>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn RemoteStore>, local: LocalSaves) -> Self {
        Self {
            store,
            local,
            uploading: UploadRegistry::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn local(&self) -> &LocalSaves {
        &self.local
    }

    /// Saves currently being uploaded
    pub fn uploads(&self) -> &Arc<UploadRegistry> {
        &self.uploading
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
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

    async fn layout(&self) -> Result<ContainerLayout> {
        self.require_auth()?;
        self.store.ensure_layout().await
    }

    async fn find_save(&self, layout: &ContainerLayout, save_name: &str) -> Result<Option<RemoteEntry>> {
        let mut found = self.store.find_folders(&layout.saves, save_name).await?;
        if found.len() > 1 {
            tracing::warn!("{} cloud copies of save {}, using the first", found.len(), save_name);
        }
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }

    /// Every cloud save with its metadata
    ///
    /// Folders whose metadata is missing or malformed are left out and set
    /// `load_failed`.
    pub async fn get_saves(&self) -> Result<SaveListing> {
        let layout = self.layout().await?;
        let folders: Vec<RemoteEntry> = self
            .store
            .list_folder(&layout.saves)
            .await?
            .into_iter()
            .filter(|e| e.is_folder)
            .collect();

        let loaded = join_all(folders.iter().map(|entry| async move {
            (entry, self.store.folder_metadata(entry).await)
        }))
        .await;

        let mut listing = SaveListing::default();
        for (entry, result) in loaded {
            match result.and_then(|json| match json {
                Some(json) => SaveInfo::from_json(&json).map(Some),
                None => Ok(None),
            }) {
                Ok(Some(info)) => listing.saves.push(info),
                Ok(None) => {
                    tracing::warn!("No save info for cloud save {}", entry.name);
                    listing.load_failed = true;
                }
                Err(e) => {
                    tracing::error!("Failed to load save info for {}: {}", entry.name, e);
                    listing.load_failed = true;
                }
            }
        }

        listing.saves.sort_by(|a, b| a.folder_name.cmp(&b.folder_name));
        Ok(listing)
    }

    /// Metadata of one cloud save, if present
    pub async fn cloud_save_info(&self, save_name: &str) -> Result<Option<SaveInfo>> {
        let layout = self.layout().await?;
        let Some(entry) = self.find_save(&layout, save_name).await? else {
            return Ok(None);
        };
        match self.store.folder_metadata(&entry).await? {
            Some(json) => Ok(Some(SaveInfo::from_json(&json)?)),
            None => Ok(None),
        }
    }

    /// Upload a local save to a new cloud folder
    pub async fn upload_save(&self, save_name: &str) -> Result<()> {
        let _guard = self.uploading.register(save_name)?;
        self.upload_registered(save_name).await
    }

    async fn upload_registered(&self, save_name: &str) -> Result<()> {
        let info = self.local.save_info(save_name)?;
        let tree = LocalTree::scan(&self.local.save_path(save_name), save_name)?;
        let layout = self.layout().await?;

        tracing::info!(
            "Uploading save {} ({} files) to {}",
            save_name,
            tree.file_count(),
            self.store.name()
        );

        let metadata = info.to_json()?;
        let root = self
            .store
            .create_folder(&layout.saves, save_name, Some(&metadata))
            .await?;

        let failed = AtomicBool::new(false);
        upload::upload_tree(self.store.as_ref(), &tree, root, &failed).await?;

        tracing::info!("Uploaded save {}", save_name);
        Ok(())
    }

    /// Mirror a cloud save into `dest_parent/<save_name>`
    pub async fn download_save(&self, save_name: &str, dest_parent: &Path) -> Result<()> {
        self.uploading.ensure_idle(save_name)?;
        let layout = self.layout().await?;
        let entry = self
            .find_save(&layout, save_name)
            .await?
            .ok_or_else(|| CloudSyncError::NotFound(format!("Cloud save {}", save_name)))?;

        let target = dest_parent.join(save_name);
        tracing::info!("Downloading save {} to {}", save_name, target.display());
        self.store.download_tree(&entry.reference, &target).await
    }

    /// Delete every cloud copy of a save and its metadata
    pub async fn delete_save(&self, save_name: &str) -> Result<()> {
        self.uploading.ensure_idle(save_name)?;
        self.delete_registered(save_name).await
    }

    async fn delete_registered(&self, save_name: &str) -> Result<()> {
        let layout = self.layout().await?;
        let folders = self.store.find_folders(&layout.saves, save_name).await?;

        let mut tasks: Vec<BoxFuture<'_, Result<()>>> = folders
            .iter()
            .map(|f| self.store.delete(&f.reference))
            .collect();
        tasks.push(self.store.delete_folder_metadata(&layout.saves, save_name));

        drain_all(tasks).await?;
        tracing::info!("Deleted {} cloud copies of {}", folders.len(), save_name);
        Ok(())
    }

    /// Copy the cloud save into the Backups container under a timestamped
    /// name; returns that name, or `None` when there is nothing to back up.
    pub async fn backup_save(&self, save_name: &str) -> Result<Option<String>> {
        let layout = self.layout().await?;
        let Some(entry) = self.find_save(&layout, save_name).await? else {
            tracing::debug!("No cloud save {} to back up", save_name);
            return Ok(None);
        };

        let now = Local::now().fixed_offset();
        let cloud_name = backup_name(&entry.name, &now);
        let description = format_description(&now);
        self.store
            .copy_tree(&entry.reference, &cloud_name, &layout.backups, Some(&description))
            .await?;

        tracing::info!("Backed up {} as {}", save_name, cloud_name);
        Ok(Some(cloud_name))
    }

    /// Back up (when enabled), delete and re-upload a save
    ///
    /// A failed backup stops here; the caller may choose to go on with
    /// [`replace_save_without_backup`](Self::replace_save_without_backup).
    pub async fn replace_save(&self, save_name: &str, settings: &SyncSettings) -> Result<()> {
        self.replace(save_name, settings.backup_saves).await
    }

    pub async fn replace_save_without_backup(&self, save_name: &str) -> Result<()> {
        self.replace(save_name, false).await
    }

    async fn replace(&self, save_name: &str, backup: bool) -> Result<()> {
        let _guard = self.uploading.register(save_name)?;
        if backup {
            self.backup_save(save_name).await?;
        }
        self.delete_registered(save_name).await?;
        self.upload_registered(save_name).await
    }

    /// Replace the local save with its cloud copy
    pub async fn restore_save(&self, save_name: &str) -> Result<()> {
        self.uploading.ensure_idle(save_name)?;
        let temp = self.prepare_temp().await?;
        let result = async {
            self.download_save(save_name, &temp).await?;
            self.local.replace_with(save_name, &temp.join(save_name))
        }
        .await;
        self.cleanup_temp(&temp).await;
        result
    }

    /// Replace the local save a backup was taken from with that backup
    pub async fn restore_backup(&self, backup: &Backup) -> Result<()> {
        self.uploading.ensure_idle(&backup.folder_name)?;
        let layout = self.layout().await?;
        let entry = self
            .store
            .find_folders(&layout.backups, &backup.cloud_folder_name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CloudSyncError::NotFound(format!("Backup {}", backup.cloud_folder_name)))?;

        let temp = self.prepare_temp().await?;
        let staged = temp.join(&backup.folder_name);
        let result = async {
            self.store.download_tree(&entry.reference, &staged).await?;
            self.local.replace_with(&backup.folder_name, &staged)
        }
        .await;
        self.cleanup_temp(&temp).await;
        result
    }

    /// Compare the local save with the cloud copy an upload would replace
    pub async fn upload_staleness(&self, save_name: &str) -> Result<Staleness> {
        let local = self.local.save_info(save_name)?;
        let cloud = self.cloud_save_info(save_name).await?;
        Ok(Staleness::compare(&local, cloud.as_ref()))
    }

    /// Compare the cloud save with the local copy a download would replace
    pub async fn download_staleness(&self, save_name: &str) -> Result<Staleness> {
        let cloud = self
            .cloud_save_info(save_name)
            .await?
            .ok_or_else(|| CloudSyncError::NotFound(format!("Cloud save {}", save_name)))?;
        let local = match self.local.save_info(save_name) {
            Ok(info) => Some(info),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        Ok(Staleness::compare(&cloud, local.as_ref()))
    }

    async fn prepare_temp(&self) -> Result<std::path::PathBuf> {
        let temp = self.local.temp_dir();
        if tokio::fs::try_exists(&temp).await? {
            tokio::fs::remove_dir_all(&temp).await?;
        }
        tokio::fs::create_dir_all(&temp).await?;
        Ok(temp)
    }

    async fn cleanup_temp(&self, temp: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(temp).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", temp.display(), e);
            }
        }
    }
}
