//! Google Drive backend (graph-addressed)
//!
//! Objects are addressed by file ID. A save folder's `SaveInfo` JSON lives
//! in the folder's `description`, and backup folders carry their timestamp
//! there too.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;

use super::graph::{copy_subtree, ChildIndex, GraphOps};
use super::{collect_pages, same_name, write_local_file, RemoteStore};
use crate::auth::TokenSource;
use crate::config::DriveConfig;
use crate::error::{CloudSyncError, Result};
use crate::resilience::ResiliencePipeline;
use crate::types::{ContainerLayout, RemoteEntry, RemoteRef};

const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const ENTRY_FIELDS: &str = "nextPageToken, files(id, name, mimeType, parents, description)";
const PAGE_SIZE: &str = "1000";

const ROOT_FOLDER: &str = "CloudSync";
const SAVES_FOLDER: &str = "Saves";
const BACKUPS_FOLDER: &str = "Backups";

/// Shared by every Drive store in the process
static PIPELINE: Lazy<Arc<ResiliencePipeline>> =
    Lazy::new(|| Arc::new(ResiliencePipeline::for_graph_store()));

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

impl FileList {
    fn into_page(self) -> (Vec<RemoteEntry>, Option<String>) {
        let entries = self.files.into_iter().map(RemoteEntry::from).collect();
        (entries, self.next_page_token)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    parents: Vec<String>,
    description: Option<String>,
}

impl From<DriveFile> for RemoteEntry {
    fn from(file: DriveFile) -> Self {
        RemoteEntry {
            is_folder: file.mime_type == FOLDER_MIME,
            reference: RemoteRef::new(file.id),
            parents: file.parents.into_iter().map(RemoteRef::new).collect(),
            name: file.name,
            metadata: file.description,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

/// Query parameters of one `files.list` page
fn list_params(query: &str, page_token: Option<&str>) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("q", query.to_string()),
        ("fields", ENTRY_FIELDS.to_string()),
        ("pageSize", PAGE_SIZE.to_string()),
        ("spaces", "drive".to_string()),
    ];
    if let Some(token) = page_token {
        params.push(("pageToken", token.to_string()));
    }
    params
}

/// Quote a value for use inside a Drive query string literal
pub fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Map a failed Drive response to an error
///
/// 403 is only a rate limit when the reason says so; other 403s are
/// permission problems and are not retried.
pub fn classify_error(status: u16, body: &str) -> CloudSyncError {
    let (message, reasons) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (
            envelope.error.message,
            envelope
                .error
                .errors
                .into_iter()
                .map(|e| e.reason)
                .collect::<Vec<_>>(),
        ),
        Err(_) => (body.to_string(), Vec::new()),
    };
    let rate_reason = reasons
        .iter()
        .any(|r| r == "rateLimitExceeded" || r == "userRateLimitExceeded");

    match status {
        401 => CloudSyncError::NotAuthenticated(message),
        429 => CloudSyncError::RateLimited(message),
        403 if rate_reason => CloudSyncError::RateLimited(message),
        404 => CloudSyncError::NotFound(message),
        _ => CloudSyncError::Api { status, message },
    }
}

/// Build a `multipart/related` upload body: JSON metadata, then content
pub fn multipart_body(boundary: &str, metadata: &Value, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 256);
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{}\r\n--{}\r\nContent-Type: application/octet-stream\r\n\r\n",
            boundary, metadata, boundary
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

/// Google Drive implementation of [`RemoteStore`]
pub struct DriveStore {
    http: reqwest::Client,
    tokens: TokenSource,
    pipeline: Arc<ResiliencePipeline>,
    layout: OnceCell<ContainerLayout>,
}

impl DriveStore {
    pub fn new(config: &DriveConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cloudsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let tokens = TokenSource::google(
            http.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
            config.refresh_token.clone(),
        );
        Ok(Self {
            http,
            tokens,
            pipeline: PIPELINE.clone(),
            layout: OnceCell::new(),
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

    /// Send an authorized request through the pipeline; `build` runs once
    /// per attempt.
    async fn send<B>(&self, operation: &str, build: B) -> Result<reqwest::Response>
    where
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        self.pipeline
            .execute(operation, || async {
                let token = self.tokens.access_token().await?;
                let response = build(&self.http).bearer_auth(&token).send().await?;
                self.check(response).await
            })
            .await
    }

    /// Every file matching `query`, following page tokens
    async fn list_all(&self, query: &str) -> Result<Vec<RemoteEntry>> {
        collect_pages(|token| async move {
            let response = self
                .send("files.list", |http| {
                    http.get(FILES_URL).query(&list_params(query, token.as_deref()))
                })
                .await?;
            let page: FileList = response.json().await?;
            Ok(page.into_page())
        })
        .await
    }

    /// Every live entry the app can see, for in-memory tree walks
    async fn snapshot(&self, folder: &RemoteRef) -> Result<Vec<RemoteEntry>> {
        let entries = self.list_all("trashed = false").await?;
        if !entries.iter().any(|e| &e.reference == folder && e.is_folder) {
            return Err(CloudSyncError::NotFound(format!("Folder {}", folder)));
        }
        Ok(entries)
    }

    async fn find_or_create(&self, parent: &RemoteRef, name: &str) -> Result<RemoteRef> {
        let found = self.find_folders(parent, name).await?;
        if found.len() > 1 {
            tracing::warn!("{} folders named {} in {}, using the first", found.len(), name, parent);
        }
        match found.into_iter().next() {
            Some(entry) => Ok(entry.reference),
            None => {
                tracing::info!("Creating Drive folder {}", name);
                self.create_folder_node(parent, name, None).await
            }
        }
    }

    async fn create_layout(&self) -> Result<ContainerLayout> {
        let root = self.find_or_create(&RemoteRef::new("root"), ROOT_FOLDER).await?;
        let saves = self.find_or_create(&root, SAVES_FOLDER).await?;
        let backups = self.find_or_create(&root, BACKUPS_FOLDER).await?;
        Ok(ContainerLayout {
            root,
            saves,
            backups,
        })
    }
}

#[async_trait]
impl GraphOps for DriveStore {
    async fn create_folder_node(
        &self,
        parent: &RemoteRef,
        name: &str,
        description: Option<&str>,
    ) -> Result<RemoteRef> {
        let mut body = json!({
            "name": name,
            "mimeType": FOLDER_MIME,
            "parents": [parent.as_str()],
        });
        if let Some(description) = description {
            body["description"] = Value::String(description.to_string());
        }

        let response = self
            .send("files.create", |http| {
                http.post(FILES_URL).query(&[("fields", "id")]).json(&body)
            })
            .await?;
        let created: CreatedFile = response.json().await?;
        Ok(RemoteRef::new(created.id))
    }

    async fn copy_file_node(&self, file: &RemoteRef, parent: &RemoteRef, name: &str) -> Result<()> {
        let url = format!("{}/{}/copy", FILES_URL, file);
        let body = json!({ "name": name, "parents": [parent.as_str()] });
        self.send("files.copy", |http| {
            http.post(&url).query(&[("fields", "id")]).json(&body)
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for DriveStore {
    fn name(&self) -> &'static str {
        "gdrive"
    }

    fn is_authenticated(&self) -> bool {
        self.tokens.has_credentials()
    }

    async fn ensure_layout(&self) -> Result<ContainerLayout> {
        self.layout
            .get_or_try_init(|| self.create_layout())
            .await
            .cloned()
    }

    async fn list_folder(&self, folder: &RemoteRef) -> Result<Vec<RemoteEntry>> {
        let query = format!("'{}' in parents and trashed = false", escape_query(folder.as_str()));
        match self.list_all(&query).await {
            Ok(entries) => Ok(entries),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn find_folders(&self, parent: &RemoteRef, name: &str) -> Result<Vec<RemoteEntry>> {
        let query = format!(
            "'{}' in parents and name = '{}' and mimeType = '{}' and trashed = false",
            escape_query(parent.as_str()),
            escape_query(name),
            FOLDER_MIME
        );
        let entries = match self.list_all(&query).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
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
        self.create_folder_node(parent, name, metadata).await
    }

    async fn upload_file(&self, local_path: &Path, parent: &RemoteRef, name: &str) -> Result<()> {
        let data = tokio::fs::read(local_path).await?;
        let metadata = json!({ "name": name, "parents": [parent.as_str()] });
        let boundary = uuid::Uuid::new_v4().simple().to_string();
        let body = multipart_body(&boundary, &metadata, &data);
        let content_type = format!("multipart/related; boundary={}", boundary);

        self.send("files.upload", |http| {
            http.post(UPLOAD_URL)
                .query(&[("uploadType", "multipart"), ("fields", "id")])
                .header(reqwest::header::CONTENT_TYPE, &content_type)
                .body(body.clone())
        })
        .await?;
        Ok(())
    }

    async fn download_tree(&self, folder: &RemoteRef, local_dir: &Path) -> Result<()> {
        let entries = self.snapshot(folder).await?;
        let index = ChildIndex::new(&entries);
        let plan = index.plan_download(folder, local_dir);

        plan.execute(|remote, path| async move {
            let url = format!("{}/{}", FILES_URL, remote);
            let response = self
                .send("files.download", |http| {
                    http.get(&url).query(&[("alt", "media")])
                })
                .await?;
            let data = response.bytes().await?;
            write_local_file(&path, &data).await
        })
        .await
    }

    async fn copy_tree(
        &self,
        folder: &RemoteRef,
        new_name: &str,
        destination: &RemoteRef,
        metadata: Option<&str>,
    ) -> Result<RemoteRef> {
        let entries = self.snapshot(folder).await?;
        let index = ChildIndex::new(&entries);
        copy_subtree(self, &index, folder, new_name, destination, metadata).await
    }

    async fn delete(&self, target: &RemoteRef) -> Result<()> {
        let url = format!("{}/{}", FILES_URL, target);
        match self.send("files.delete", |http| http.delete(&url)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!("Drive file {} already gone", target);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_params_carry_page_token() {
        let first = list_params("trashed = false", None);
        assert!(first.iter().all(|(key, _)| *key != "pageToken"));
        assert!(first.contains(&("q", "trashed = false".to_string())));

        let next = list_params("trashed = false", Some("tok-2"));
        assert!(next.contains(&("pageToken", "tok-2".to_string())));
    }

    #[tokio::test]
    async fn test_file_list_pages_collected_until_token_ends() {
        let pages = vec![
            json!({ "files": [{ "id": "a", "name": "Farm1", "mimeType": FOLDER_MIME, "parents": ["s"] }], "nextPageToken": "t1" }),
            json!({ "nextPageToken": "t2" }),
            json!({ "files": [{ "id": "b", "name": "Farm1", "mimeType": "text/plain", "parents": ["a"] }] }),
        ];
        let mut tokens = Vec::new();
        let entries = collect_pages(|token| {
            let index = tokens.len();
            tokens.push(token);
            let page = pages[index].clone();
            async move {
                let page: FileList = serde_json::from_value(page)?;
                Ok(page.into_page())
            }
        })
        .await
        .unwrap();

        let ids: Vec<&str> = entries.iter().map(|e| e.reference.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(entries[0].is_folder && !entries[1].is_folder);
        assert_eq!(tokens, vec![None, Some("t1".to_string()), Some("t2".to_string())]);
    }

    #[test]
    fn test_escape_query() {
        assert_eq!(escape_query("Farm's"), "Farm\\'s");
        assert_eq!(escape_query(r"a\b"), r"a\\b");
        assert_eq!(escape_query("plain"), "plain");
    }

    #[test]
    fn test_classify_error_rate_limit_reasons() {
        let user_limit = r#"{"error":{"code":403,"message":"User rate limit","errors":[{"reason":"userRateLimitExceeded"}]}}"#;
        assert!(classify_error(403, user_limit).is_rate_limited());

        let forbidden = r#"{"error":{"code":403,"message":"Insufficient permissions","errors":[{"reason":"insufficientFilePermissions"}]}}"#;
        assert!(matches!(
            classify_error(403, forbidden),
            CloudSyncError::Api { status: 403, .. }
        ));

        assert!(classify_error(429, "").is_rate_limited());
        assert!(classify_error(404, r#"{"error":{"message":"File not found"}}"#).is_not_found());
        assert!(matches!(
            classify_error(401, "{}"),
            CloudSyncError::NotAuthenticated(_)
        ));
    }

    #[test]
    fn test_multipart_body_layout() {
        let body = multipart_body("xyz", &json!({ "name": "a" }), b"DATA");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--xyz\r\nContent-Type: application/json"));
        assert!(text.contains("{\"name\":\"a\"}\r\n--xyz\r\n"));
        assert!(text.ends_with("DATA\r\n--xyz--\r\n"));
    }

    #[test]
    fn test_drive_file_to_entry() {
        let file: DriveFile = serde_json::from_value(json!({
            "id": "abc",
            "name": "Farm1",
            "mimeType": FOLDER_MIME,
            "parents": ["p1", "p2"],
            "description": "{}"
        }))
        .unwrap();
        let entry = RemoteEntry::from(file);
        assert!(entry.is_folder);
        assert!(entry.is_child_of(&RemoteRef::new("p2")));
        assert_eq!(entry.metadata.as_deref(), Some("{}"));
    }
}
