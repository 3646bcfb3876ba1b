//! Remote store backends
//!
//! A [`RemoteStore`] is the small capability surface the sync engine needs
//! from a provider. Two addressing models sit behind it:
//! - Path-addressed (`dropbox`): objects are named by string path, folders
//!   are implicit, copy/delete act on paths
//! - Graph-addressed (`gdrive`, `memory`): objects are named by opaque ID,
//!   names are not unique, membership is a list of parent IDs
//!
//! # Feature Flags
//!
//! - `dropbox`: Dropbox HTTP backend
//! - `gdrive`: Google Drive HTTP backend
//!
//! The in-memory backend is always available.

#[cfg(feature = "dropbox")]
pub mod dropbox;
#[cfg(feature = "gdrive")]
pub mod gdrive;
pub mod graph;
pub mod memory;

#[cfg(feature = "dropbox")]
pub use dropbox::DropboxStore;
#[cfg(feature = "gdrive")]
pub use gdrive::DriveStore;
pub use memory::MemoryStore;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::batch::abort_on_error;
use crate::error::Result;
use crate::types::{ContainerLayout, RemoteEntry, RemoteRef};

/// Capability surface every remote backend implements
///
/// # Design Principles
///
/// 1. **Uniform not-found handling**: listing a missing folder yields an
///    empty list and deleting a missing object succeeds; only reads that
///    need their target (`download_tree`, `copy_tree`) report `NotFound`.
///
/// 2. **Metadata on the save folder only**: `create_folder` and `copy_tree`
///    accept a JSON blob that is attached to that one folder, never to the
///    files below it.
///
/// 3. **Throttled**: implementations route every request through their
///    `ResiliencePipeline`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &'static str;

    /// Whether credentials are present; no request is made
    fn is_authenticated(&self) -> bool;

    /// Locate or create the root, Saves and Backups containers
    async fn ensure_layout(&self) -> Result<ContainerLayout>;

    /// Direct children of `folder`, following every page
    async fn list_folder(&self, folder: &RemoteRef) -> Result<Vec<RemoteEntry>>;

    /// Child folders of `parent` whose name matches `name` case-insensitively
    async fn find_folders(&self, parent: &RemoteRef, name: &str) -> Result<Vec<RemoteEntry>>;

    /// Create (or address) a folder under `parent`
    async fn create_folder(
        &self,
        parent: &RemoteRef,
        name: &str,
        metadata: Option<&str>,
    ) -> Result<RemoteRef>;

    /// Upload one local file into `parent`
    async fn upload_file(&self, local_path: &Path, parent: &RemoteRef, name: &str) -> Result<()>;

    /// Recreate the subtree under `folder` inside `local_dir`
    async fn download_tree(&self, folder: &RemoteRef, local_dir: &Path) -> Result<()>;

    /// Server-side copy of `folder` as `new_name` under `destination`
    async fn copy_tree(
        &self,
        folder: &RemoteRef,
        new_name: &str,
        destination: &RemoteRef,
        metadata: Option<&str>,
    ) -> Result<RemoteRef>;

    /// Delete a file or a folder with its contents; missing targets succeed
    async fn delete(&self, target: &RemoteRef) -> Result<()>;

    /// Metadata blob attached to a folder entry
    async fn folder_metadata(&self, entry: &RemoteEntry) -> Result<Option<String>> {
        Ok(entry.metadata.clone())
    }

    /// Remove metadata stored apart from the folder `name` under `parent`
    async fn delete_folder_metadata(&self, _parent: &RemoteRef, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Files and folders to materialize for a download
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadPlan {
    /// Local directories to create, parents first
    pub dirs: Vec<PathBuf>,
    /// Remote file and the local path it is written to
    pub files: Vec<(RemoteRef, PathBuf)>,
}

impl DownloadPlan {
    /// Create every directory, then fetch all files concurrently; the first
    /// failed file cancels the rest.
    pub async fn execute<F, Fut>(self, fetch: F) -> Result<()>
    where
        F: Fn(RemoteRef, PathBuf) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        for dir in &self.dirs {
            tokio::fs::create_dir_all(dir).await?;
        }
        let total = self.files.len();
        abort_on_error(
            self.files
                .into_iter()
                .map(|(remote, local)| fetch(remote, local)),
        )
        .await?;
        tracing::debug!("Downloaded {} files", total);
        Ok(())
    }
}

/// Drain a paginated listing. `fetch(None)` returns the first page and the
/// token of the next one; `fetch(Some(token))` is called until a page comes
/// back without a token.
pub async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<Output = Result<(Vec<T>, Option<String>)>>,
{
    let mut items = Vec::new();
    let mut token = None;
    loop {
        let (page, next) = fetch(token.take()).await?;
        items.extend(page);
        match next {
            Some(next) => token = Some(next),
            None => return Ok(items),
        }
    }
}

/// Case-insensitive name comparison used for folder lookup
pub(crate) fn same_name(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Write a downloaded body to `path`, creating its directory
pub(crate) async fn write_local_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}
