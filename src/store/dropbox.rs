//! Dropbox backend (path-addressed)
//!
//! Layout inside the app folder:
//! - `/Saves/<save>/...`: save contents
//! - `/Info/<save>.json`: the save's `SaveInfo`, stored apart because
//!   Dropbox folders carry no free-form description
//! - `/Backups/<save>_[<timestamp>]/...`: server-side copies

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{collect_pages, same_name, write_local_file, DownloadPlan, RemoteStore};
use crate::auth::TokenSource;
use crate::config::DropboxConfig;
use crate::error::{CloudSyncError, Result};
use crate::resilience::ResiliencePipeline;
use crate::types::{ContainerLayout, RemoteEntry, RemoteRef};

const API_URL: &str = "https://api.dropboxapi.com/2";
const CONTENT_URL: &str = "https://content.dropboxapi.com/2";

pub const SAVES_PATH: &str = "/Saves";
pub const BACKUPS_PATH: &str = "/Backups";
pub const INFO_PATH: &str = "/Info";

/// Shared by every Dropbox store in the process
static PIPELINE: Lazy<Arc<ResiliencePipeline>> =
    Lazy::new(|| Arc::new(ResiliencePipeline::for_path_store()));

#[derive(Debug, Deserialize)]
struct ListFolderResult {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

impl ListFolderResult {
    /// Entries plus the cursor to continue from, if any
    fn into_page(self) -> (Vec<Metadata>, Option<String>) {
        let next = self.has_more.then_some(self.cursor);
        (self.entries, next)
    }
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    #[serde(default)]
    path_display: Option<String>,
}

impl Metadata {
    fn is_folder(&self) -> bool {
        self.tag == "folder"
    }

    fn path(&self, parent: &str) -> String {
        self.path_display
            .clone()
            .unwrap_or_else(|| join_path(parent, &self.name))
    }

    fn into_entry(self, parent: &str) -> RemoteEntry {
        let path = self.path(parent);
        RemoteEntry {
            is_folder: self.is_folder(),
            parents: vec![RemoteRef::new(parent_path(&path))],
            reference: RemoteRef::new(path),
            name: self.name,
            metadata: None,
        }
    }
}

/// Join a folder path and a child name
pub fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    format!("{}/{}", parent, name)
}

/// Parent of a path; the app folder root is the empty string
pub fn parent_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

/// Encode a `Dropbox-API-Arg` header value; headers must be ASCII, so
/// everything above U+007F is written as a JSON `\uXXXX` escape.
pub fn api_arg_header(arg: &Value) -> String {
    let json = arg.to_string();
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Sidecar holding the `SaveInfo` of folder `name` under `parent`; only
/// live saves have one
fn sidecar_path(parent: &str, name: &str) -> Option<String> {
    same_name(parent, SAVES_PATH).then(|| format!("{}/{}.json", INFO_PATH, name))
}

/// Outcome of `create_folder_v2`; an existing folder is success
fn folder_created(path: &str, result: Result<Value>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(CloudSyncError::Api { status: 409, message }) if message.contains("conflict") => {
            tracing::debug!("Folder {} already exists", path);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Outcome of `delete_v2`; a missing target is success
fn path_deleted(path: &str, result: Result<Value>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            tracing::debug!("{} already gone", path);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Map a failed Dropbox response to an error
pub fn classify_error(status: u16, body: &str) -> CloudSyncError {
    let summary = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error_summary").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string());

    match status {
        401 => CloudSyncError::NotAuthenticated(summary),
        429 => CloudSyncError::RateLimited(summary),
        409 if summary.contains("not_found") => CloudSyncError::NotFound(summary),
        _ => CloudSyncError::Api {
            status,
            message: summary,
        },
    }
}

/// Dropbox implementation of [`RemoteStore`]
pub struct DropboxStore {
    http: reqwest::Client,
    tokens: TokenSource,
    pipeline: Arc<ResiliencePipeline>,
}

impl DropboxStore {
    pub fn new(config: &DropboxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cloudsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let tokens = TokenSource::dropbox(
            http.clone(),
            config.app_key.clone(),
            config.refresh_token.clone(),
        );
        Ok(Self {
            http,
            tokens,
            pipeline: PIPELINE.clone(),
        })
    }

    /// Use a dedicated pipeline instead of the process-wide one
    pub fn with_pipeline(mut self, pipeline: Arc<ResiliencePipeline>) -> Self {
        self.pipeline = pipeline;
        self
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_error(status.as_u16(), &body))
    }

    /// POST a JSON RPC call
    async fn rpc<T>(&self, endpoint: &str, arg: &Value) -> Result<T>
    where
        T: DeserializeOwned + Send,
    {
        let url = format!("{}/{}", API_URL, endpoint);
        self.pipeline
            .execute(endpoint, || async {
                let token = self.tokens.access_token().await?;
                let response = self
                    .http
                    .post(&url)
                    .bearer_auth(&token)
                    .json(arg)
                    .send()
                    .await?;
                let response = self.check(response).await?;
                Ok(response.json::<T>().await?)
            })
            .await
    }

    /// Every entry under `path`; `None` if the path does not exist
    async fn list_all(&self, path: &str, recursive: bool) -> Result<Option<Vec<Metadata>>> {
        let listed = collect_pages(|cursor| async move {
            let page: ListFolderResult = match cursor {
                None => {
                    self.rpc(
                        "files/list_folder",
                        &json!({ "path": path, "recursive": recursive }),
                    )
                    .await?
                }
                Some(cursor) => {
                    self.rpc("files/list_folder/continue", &json!({ "cursor": cursor }))
                        .await?
                }
            };
            Ok(page.into_page())
        })
        .await;

        match listed {
            Ok(entries) => Ok(Some(
                entries
                    .into_iter()
                    .filter(|m| m.tag == "file" || m.tag == "folder")
                    .collect(),
            )),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_path(&self, path: &str) -> Result<()> {
        let result = self
            .rpc(
                "files/create_folder_v2",
                &json!({ "path": path, "autorename": false }),
            )
            .await;
        folder_created(path, result)
    }

    async fn upload_bytes(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let url = format!("{}/files/upload", CONTENT_URL);
        let arg = api_arg_header(&json!({
            "path": path,
            "mode": "overwrite",
            "mute": true,
        }));
        self.pipeline
            .execute("files/upload", || async {
                let token = self.tokens.access_token().await?;
                let response = self
                    .http
                    .post(&url)
                    .bearer_auth(&token)
                    .header("Dropbox-API-Arg", &arg)
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone())
                    .send()
                    .await?;
                self.check(response).await?;
                Ok(())
            })
            .await
    }

    async fn download_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}/files/download", CONTENT_URL);
        let arg = api_arg_header(&json!({ "path": path }));
        self.pipeline
            .execute("files/download", || async {
                let token = self.tokens.access_token().await?;
                let response = self
                    .http
                    .post(&url)
                    .bearer_auth(&token)
                    .header("Dropbox-API-Arg", &arg)
                    .send()
                    .await?;
                let response = self.check(response).await?;
                Ok(response.bytes().await?.to_vec())
            })
            .await
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        let result = self.rpc("files/delete_v2", &json!({ "path": path })).await;
        path_deleted(path, result)
    }
}

/// Components of `path` below `folder`, compared component by component
/// so case folding never shifts byte offsets; `None` outside the folder or
/// for the folder itself.
fn relative_path(folder: &[&str], path: &str) -> Option<PathBuf> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= folder.len() {
        return None;
    }
    let inside = folder
        .iter()
        .zip(&parts)
        .all(|(want, got)| same_name(want, got));
    inside.then(|| parts[folder.len()..].iter().collect())
}

/// Lay out a recursive listing of `folder` under `local_dir`
fn plan_download(folder: &str, entries: Vec<Metadata>, local_dir: &Path) -> DownloadPlan {
    let folder_parts: Vec<&str> = folder.trim_end_matches('/').split('/').collect();
    let mut plan = DownloadPlan {
        dirs: vec![local_dir.to_path_buf()],
        files: Vec::new(),
    };

    for entry in entries {
        let path = entry.path(folder);
        let Some(relative) = relative_path(&folder_parts, &path) else {
            continue;
        };
        let local = local_dir.join(relative);
        if entry.is_folder() {
            plan.dirs.push(local);
        } else {
            plan.files.push((RemoteRef::new(path), local));
        }
    }

    plan.dirs.sort();
    plan
}

#[async_trait]
impl RemoteStore for DropboxStore {
    fn name(&self) -> &'static str {
        "dropbox"
    }

    fn is_authenticated(&self) -> bool {
        self.tokens.has_credentials()
    }

    /// Paths are implicit on Dropbox: uploads and copies create their
    /// parents, and listing a missing folder yields nothing.
    async fn ensure_layout(&self) -> Result<ContainerLayout> {
        Ok(ContainerLayout {
            root: RemoteRef::new(""),
            saves: RemoteRef::new(SAVES_PATH),
            backups: RemoteRef::new(BACKUPS_PATH),
        })
    }

    async fn list_folder(&self, folder: &RemoteRef) -> Result<Vec<RemoteEntry>> {
        let entries = self.list_all(folder.as_str(), false).await?.unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|m| m.into_entry(folder.as_str()))
            .collect())
    }

    async fn find_folders(&self, parent: &RemoteRef, name: &str) -> Result<Vec<RemoteEntry>> {
        let entries = self.list_folder(parent).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.is_folder && same_name(&e.name, name))
            .collect())
    }

    async fn create_folder(
        &self,
        parent: &RemoteRef,
        name: &str,
        metadata: Option<&str>,
    ) -> Result<RemoteRef> {
        let path = join_path(parent.as_str(), name);
        self.create_path(&path).await?;
        if let (Some(metadata), Some(sidecar)) = (metadata, sidecar_path(parent.as_str(), name)) {
            self.upload_bytes(&sidecar, metadata.as_bytes().to_vec()).await?;
        }
        Ok(RemoteRef::new(path))
    }

    async fn upload_file(&self, local_path: &Path, parent: &RemoteRef, name: &str) -> Result<()> {
        let data = tokio::fs::read(local_path).await?;
        self.upload_bytes(&join_path(parent.as_str(), name), data)
            .await
    }

    async fn download_tree(&self, folder: &RemoteRef, local_dir: &Path) -> Result<()> {
        let entries = self
            .list_all(folder.as_str(), true)
            .await?
            .ok_or_else(|| CloudSyncError::NotFound(format!("Folder {}", folder)))?;

        let plan = plan_download(folder.as_str(), entries, local_dir);
        plan.execute(|remote, path| async move {
            let data = self.download_bytes(remote.as_str()).await?;
            write_local_file(&path, &data).await
        })
        .await
    }

    async fn copy_tree(
        &self,
        folder: &RemoteRef,
        new_name: &str,
        destination: &RemoteRef,
        _metadata: Option<&str>,
    ) -> Result<RemoteRef> {
        let to_path = join_path(destination.as_str(), new_name);
        let _: Value = self
            .rpc(
                "files/copy_v2",
                &json!({
                    "from_path": folder.as_str(),
                    "to_path": to_path,
                    "autorename": false,
                }),
            )
            .await?;
        Ok(RemoteRef::new(to_path))
    }

    async fn delete(&self, target: &RemoteRef) -> Result<()> {
        self.delete_path(target.as_str()).await
    }

    async fn folder_metadata(&self, entry: &RemoteEntry) -> Result<Option<String>> {
        let Some(sidecar) = entry
            .parents
            .first()
            .and_then(|parent| sidecar_path(parent.as_str(), &entry.name))
        else {
            return Ok(None);
        };
        match self.download_bytes(&sidecar).await {
            Ok(data) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_folder_metadata(&self, parent: &RemoteRef, name: &str) -> Result<()> {
        match sidecar_path(parent.as_str(), name) {
            Some(sidecar) => self.delete_path(&sidecar).await,
            None => Ok(()),
        }
    }
}
