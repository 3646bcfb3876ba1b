//! Tree upload and the in-flight upload registry

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::batch::drain_all;
use crate::error::{CloudSyncError, Result};
use crate::rules::LocalTree;
use crate::store::RemoteStore;
use crate::types::RemoteRef;

/// Names of saves currently being uploaded, compared case-insensitively
#[derive(Debug, Default)]
pub struct UploadRegistry {
    names: Mutex<HashSet<String>>,
}

impl UploadRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark `save_name` as uploading until the guard is dropped
    pub fn register(self: &Arc<Self>, save_name: &str) -> Result<UploadGuard> {
        let key = save_name.to_lowercase();
        if !self.names.lock().insert(key.clone()) {
            return Err(CloudSyncError::SaveBusy(save_name.to_string()));
        }
        Ok(UploadGuard {
            registry: Arc::clone(self),
            key,
        })
    }

    pub fn contains(&self, save_name: &str) -> bool {
        self.names.lock().contains(&save_name.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }

    /// Fail with `SaveBusy` if `save_name` is being uploaded
    pub fn ensure_idle(&self, save_name: &str) -> Result<()> {
        if self.contains(save_name) {
            return Err(CloudSyncError::SaveBusy(save_name.to_string()));
        }
        Ok(())
    }
}

/// Keeps a save registered as uploading
#[derive(Debug)]
pub struct UploadGuard {
    registry: Arc<UploadRegistry>,
    key: String,
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        self.registry.names.lock().remove(&self.key);
    }
}

/// Upload the files and subfolders of `tree` into `folder`
///
/// Siblings are dispatched together and all of them are awaited. Once any
/// upload fails, work that has not started yet (deeper folders) is skipped,
/// and the first failure is returned after the rest drain.
pub(crate) fn upload_tree<'a>(
    store: &'a dyn RemoteStore,
    tree: &'a LocalTree,
    folder: RemoteRef,
    failed: &'a AtomicBool,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let folder = &folder;
        let mut tasks: Vec<BoxFuture<'_, Result<()>>> = Vec::new();

        for file in &tree.files {
            tasks.push(Box::pin(async move {
                if failed.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .ok_or_else(|| {
                        CloudSyncError::InvalidInput(format!("No file name in {}", file.display()))
                    })?;
                let result = store.upload_file(file, folder, &name).await;
                if let Err(e) = &result {
                    tracing::error!("Failed to upload {}: {}", file.display(), e);
                    failed.store(true, Ordering::SeqCst);
                }
                result
            }));
        }

        for dir in &tree.dirs {
            tasks.push(Box::pin(async move {
                if failed.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let child = match store.create_folder(folder, &dir.name, None).await {
                    Ok(child) => child,
                    Err(e) => {
                        failed.store(true, Ordering::SeqCst);
                        return Err(e);
                    }
                };
                upload_tree(store, dir, child, failed).await
            }));
        }

        drain_all(tasks).await.map(|_| ())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_case_insensitive() {
        let registry = UploadRegistry::new();
        let guard = registry.register("Farm1").unwrap();

        assert!(registry.contains("FARM1"));
        assert!(matches!(
            registry.register("farm1"),
            Err(CloudSyncError::SaveBusy(_))
        ));
        assert!(registry.ensure_idle("Farm2").is_ok());

        drop(guard);
        assert!(registry.is_empty());
        assert!(registry.ensure_idle("Farm1").is_ok());
    }
}
