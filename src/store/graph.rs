//! Algorithms shared by graph-addressed stores
//!
//! Multi-step workflows on a graph store fetch every entry once and walk the
//! tree in memory, grouping entries by parent ID, instead of listing each
//! folder separately. This keeps a whole save tree to a handful of list
//! calls regardless of its depth.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::DownloadPlan;
use crate::batch::drain_all;
use crate::error::Result;
use crate::types::{RemoteEntry, RemoteRef};

/// Entries grouped by parent; an entry with several parents appears under
/// each of them.
pub struct ChildIndex<'a> {
    children: HashMap<&'a RemoteRef, Vec<&'a RemoteEntry>>,
}

impl<'a> ChildIndex<'a> {
    pub fn new(entries: &'a [RemoteEntry]) -> Self {
        let mut children: HashMap<&'a RemoteRef, Vec<&'a RemoteEntry>> = HashMap::new();
        for entry in entries {
            for parent in &entry.parents {
                children.entry(parent).or_default().push(entry);
            }
        }
        Self { children }
    }

    pub fn children(&self, parent: &RemoteRef) -> &[&'a RemoteEntry] {
        self.children.get(parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Build the local layout for the subtree under `root`
    pub fn plan_download(&self, root: &RemoteRef, local_dir: &Path) -> DownloadPlan {
        let mut plan = DownloadPlan::default();
        let mut visited: HashSet<&RemoteRef> = HashSet::new();
        let mut stack = vec![(root, local_dir.to_path_buf())];

        while let Some((folder, dir)) = stack.pop() {
            plan.dirs.push(dir.clone());
            for child in self.children(folder) {
                let path = dir.join(&child.name);
                if !child.is_folder {
                    plan.files.push((child.reference.clone(), path));
                } else if visited.insert(&child.reference) {
                    stack.push((&child.reference, path));
                } else {
                    tracing::warn!("Folder {} reached twice, skipping", child.reference);
                }
            }
        }

        plan
    }
}

/// Single-object operations a graph store provides for tree copies
#[async_trait]
pub trait GraphOps: Send + Sync {
    async fn create_folder_node(
        &self,
        parent: &RemoteRef,
        name: &str,
        description: Option<&str>,
    ) -> Result<RemoteRef>;

    async fn copy_file_node(&self, file: &RemoteRef, parent: &RemoteRef, name: &str) -> Result<()>;
}

/// Copy the subtree under `source` to a new folder `name` in `destination`
///
/// Files and folders at each level are copied concurrently; all of them are
/// awaited before the first failure is reported. A failure leaves the
/// partially copied folder in place.
pub async fn copy_subtree<G>(
    ops: &G,
    index: &ChildIndex<'_>,
    source: &RemoteRef,
    name: &str,
    destination: &RemoteRef,
    description: Option<&str>,
) -> Result<RemoteRef>
where
    G: GraphOps + ?Sized,
{
    let root = ops.create_folder_node(destination, name, description).await?;
    copy_children(ops, index, source, root.clone()).await?;
    Ok(root)
}

fn copy_children<'a, G>(
    ops: &'a G,
    index: &'a ChildIndex<'a>,
    source: &'a RemoteRef,
    target: RemoteRef,
) -> BoxFuture<'a, Result<()>>
where
    G: GraphOps + ?Sized,
{
    Box::pin(async move {
        let target = &target;
        let mut tasks: Vec<BoxFuture<'_, Result<()>>> = Vec::new();

        for child in index.children(source) {
            if child.is_folder {
                tasks.push(Box::pin(async move {
                    let folder = ops.create_folder_node(target, &child.name, None).await?;
                    copy_children(ops, index, &child.reference, folder).await
                }));
            } else {
                tasks.push(Box::pin(ops.copy_file_node(
                    &child.reference,
                    target,
                    &child.name,
                )));
            }
        }

        drain_all(tasks).await.map(|_| ())
    })
}
