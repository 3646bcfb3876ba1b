//! In-process graph store
//!
//! Behaves like the Drive backend (opaque IDs, duplicate names, parent
//! lists, folder descriptions) without a network. Used by the integration
//! tests and the CLI's `memory` provider, with hooks to inject failures.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::graph::{copy_subtree, ChildIndex, GraphOps};
use super::{same_name, write_local_file, RemoteStore};
use crate::error::{CloudSyncError, Result};
use crate::resilience::{ResiliencePipeline, Throttle};
use crate::types::{ContainerLayout, RemoteEntry, RemoteRef};

const ROOT_FOLDER: &str = "CloudSync";
const SAVES_FOLDER: &str = "Saves";
const BACKUPS_FOLDER: &str = "Backups";

#[derive(Debug, Clone)]
struct Node {
    name: String,
    is_folder: bool,
    parents: Vec<RemoteRef>,
    description: Option<String>,
    data: Vec<u8>,
}

impl Node {
    fn entry(&self, id: &RemoteRef) -> RemoteEntry {
        RemoteEntry {
            name: self.name.clone(),
            is_folder: self.is_folder,
            reference: id.clone(),
            parents: self.parents.clone(),
            metadata: self.description.clone(),
        }
    }
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<RemoteRef, Node>,
    next_id: u64,
    layout: Option<ContainerLayout>,
    failing_uploads: HashSet<String>,
    failing_deletes: HashSet<String>,
    rate_limited_calls: usize,
    requests: usize,
}

impl State {
    fn insert(&mut self, node: Node) -> RemoteRef {
        self.next_id += 1;
        let id = RemoteRef::new(format!("mem-{:06}", self.next_id));
        self.nodes.insert(id.clone(), node);
        id
    }

    fn insert_folder(&mut self, parent: Option<&RemoteRef>, name: &str, description: Option<&str>) -> RemoteRef {
        self.insert(Node {
            name: name.to_string(),
            is_folder: true,
            parents: parent.into_iter().cloned().collect(),
            description: description.map(str::to_string),
            data: Vec::new(),
        })
    }

    fn require_folder(&self, id: &RemoteRef) -> Result<()> {
        match self.nodes.get(id) {
            Some(node) if node.is_folder => Ok(()),
            _ => Err(CloudSyncError::NotFound(format!("Folder {}", id))),
        }
    }

    fn entries(&self) -> Vec<RemoteEntry> {
        self.nodes.iter().map(|(id, node)| node.entry(id)).collect()
    }

    /// Remove `id` from the graph along with every node left without a parent
    fn remove(&mut self, id: &RemoteRef) {
        let mut pending = vec![id.clone()];
        while let Some(current) = pending.pop() {
            if self.nodes.remove(&current).is_none() {
                continue;
            }
            for (child_id, child) in self.nodes.iter_mut() {
                if child.parents.contains(&current) {
                    child.parents.retain(|p| p != &current);
                    if child.parents.is_empty() {
                        pending.push(child_id.clone());
                    }
                }
            }
        }
    }
}

/// Graph store kept entirely in memory
pub struct MemoryStore {
    state: Mutex<State>,
    pipeline: ResiliencePipeline,
    authenticated: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            pipeline: ResiliencePipeline::new(Throttle::Unlimited).with_max_jitter(Duration::ZERO),
            authenticated: true,
        }
    }

    /// A store that reports missing credentials
    pub fn signed_out() -> Self {
        Self {
            authenticated: false,
            ..Self::new()
        }
    }

    /// Fail every upload of a file with this name
    pub fn fail_uploads_named(&self, name: &str) {
        self.state.lock().failing_uploads.insert(name.to_string());
    }

    /// Fail every delete of an object with this name
    pub fn fail_deletes_named(&self, name: &str) {
        self.state.lock().failing_deletes.insert(name.to_string());
    }

    /// Answer the next `calls` requests with a rate-limit error
    pub fn rate_limit_next(&self, calls: usize) {
        self.state.lock().rate_limited_calls = calls;
    }

    /// Requests received so far, including rejected ones
    pub fn request_count(&self) -> usize {
        self.state.lock().requests
    }

    /// Add a folder directly, bypassing the request path
    pub fn insert_folder(&self, parent: &RemoteRef, name: &str, description: Option<&str>) -> RemoteRef {
        self.state.lock().insert_folder(Some(parent), name, description)
    }

    /// Add a file directly, bypassing the request path
    pub fn insert_file(&self, parent: &RemoteRef, name: &str, data: &[u8]) -> RemoteRef {
        self.state.lock().insert(Node {
            name: name.to_string(),
            is_folder: false,
            parents: vec![parent.clone()],
            description: None,
            data: data.to_vec(),
        })
    }

    /// Contents of the file `name` directly under `parent`
    pub fn file_data(&self, parent: &RemoteRef, name: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state
            .nodes
            .values()
            .find(|n| !n.is_folder && n.name == name && n.parents.contains(parent))
            .map(|n| n.data.clone())
    }

    /// Names of the direct children of `parent`, sorted
    pub fn child_names(&self, parent: &RemoteRef) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .nodes
            .values()
            .filter(|n| n.parents.contains(parent))
            .map(|n| n.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of objects held, containers included
    pub fn object_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    fn begin_request(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.requests += 1;
        if state.rate_limited_calls > 0 {
            state.rate_limited_calls -= 1;
            return Err(CloudSyncError::RateLimited("Injected rate limit".to_string()));
        }
        Ok(())
    }

    fn read_file(&self, id: &RemoteRef) -> Result<Vec<u8>> {
        let state = self.state.lock();
        match state.nodes.get(id) {
            Some(node) if !node.is_folder => Ok(node.data.clone()),
            _ => Err(CloudSyncError::NotFound(format!("File {}", id))),
        }
    }
}

#[async_trait]
impl GraphOps for MemoryStore {
    async fn create_folder_node(
        &self,
        parent: &RemoteRef,
        name: &str,
        description: Option<&str>,
    ) -> Result<RemoteRef> {
        self.pipeline
            .execute("create_folder", || async {
                self.begin_request()?;
                let mut state = self.state.lock();
                state.require_folder(parent)?;
                Ok(state.insert_folder(Some(parent), name, description))
            })
            .await
    }

    async fn copy_file_node(&self, file: &RemoteRef, parent: &RemoteRef, name: &str) -> Result<()> {
        self.pipeline
            .execute("copy_file", || async {
                self.begin_request()?;
                let data = self.read_file(file)?;
                let mut state = self.state.lock();
                state.require_folder(parent)?;
                state.insert(Node {
                    name: name.to_string(),
                    is_folder: false,
                    parents: vec![parent.clone()],
                    description: None,
                    data,
                });
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn ensure_layout(&self) -> Result<ContainerLayout> {
        let mut state = self.state.lock();
        if let Some(layout) = &state.layout {
            return Ok(layout.clone());
        }
        let root = state.insert_folder(None, ROOT_FOLDER, None);
        let saves = state.insert_folder(Some(&root), SAVES_FOLDER, None);
        let backups = state.insert_folder(Some(&root), BACKUPS_FOLDER, None);
        let layout = ContainerLayout {
            root,
            saves,
            backups,
        };
        state.layout = Some(layout.clone());
        Ok(layout)
    }

    async fn list_folder(&self, folder: &RemoteRef) -> Result<Vec<RemoteEntry>> {
        self.pipeline
            .execute("list_folder", || async {
                self.begin_request()?;
                let state = self.state.lock();
                Ok(state
                    .nodes
                    .iter()
                    .filter(|(_, node)| node.parents.contains(folder))
                    .map(|(id, node)| node.entry(id))
                    .collect())
            })
            .await
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
        self.create_folder_node(parent, name, metadata).await
    }

    async fn upload_file(&self, local_path: &Path, parent: &RemoteRef, name: &str) -> Result<()> {
        let data = tokio::fs::read(local_path).await?;
        self.pipeline
            .execute("upload_file", || async {
                self.begin_request()?;
                let mut state = self.state.lock();
                if state.failing_uploads.contains(name) {
                    return Err(CloudSyncError::Api {
                        status: 500,
                        message: format!("Injected upload failure for {}", name),
                    });
                }
                state.require_folder(parent)?;
                state.insert(Node {
                    name: name.to_string(),
                    is_folder: false,
                    parents: vec![parent.clone()],
                    description: None,
                    data: data.clone(),
                });
                Ok(())
            })
            .await
    }

    async fn download_tree(&self, folder: &RemoteRef, local_dir: &Path) -> Result<()> {
        let entries = {
            let state = self.state.lock();
            state.require_folder(folder)?;
            state.entries()
        };
        let index = ChildIndex::new(&entries);
        let plan = index.plan_download(folder, local_dir);

        plan.execute(|remote, path| async move {
            let data = self
                .pipeline
                .execute("download_file", || async {
                    self.begin_request()?;
                    self.read_file(&remote)
                })
                .await?;
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
        let entries = {
            let state = self.state.lock();
            state.require_folder(folder)?;
            state.entries()
        };
        let index = ChildIndex::new(&entries);
        copy_subtree(self, &index, folder, new_name, destination, metadata).await
    }

    async fn delete(&self, target: &RemoteRef) -> Result<()> {
        self.pipeline
            .execute("delete", || async {
                self.begin_request()?;
                let mut state = self.state.lock();
                let Some(node) = state.nodes.get(target) else {
                    return Ok(());
                };
                if state.failing_deletes.contains(&node.name) {
                    return Err(CloudSyncError::Api {
                        status: 500,
                        message: format!("Injected delete failure for {}", node.name),
                    });
                }
                state.remove(target);
                Ok(())
            })
            .await
    }
}
