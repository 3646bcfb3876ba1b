//! Upload exclusion rules and local tree planning
//!
//! The game writes rollback copies next to the real save files. These are
//! never uploaded, but only when they sit directly in the save folder; a
//! file with the same name deeper in the tree is ordinary content.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{CloudSyncError, Result};
use crate::store::same_name;

/// Whether a top-level file of save `save_name` is left out of uploads
pub fn is_excluded_name(file_name: &str, save_name: &str) -> bool {
    same_name(file_name, "BACKUP_SAVE")
        || same_name(file_name, "SaveGameInfo_old")
        || same_name(file_name, &format!("{}_old", save_name))
        || same_name(file_name, &format!("{}_SVBAK", save_name))
}

/// A local directory laid out for upload: files to send and subfolders to
/// create, in file-name order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTree {
    pub name: String,
    pub path: PathBuf,
    pub files: Vec<PathBuf>,
    pub dirs: Vec<LocalTree>,
}

impl LocalTree {
    fn empty(name: String, path: PathBuf) -> Self {
        Self {
            name,
            path,
            files: Vec::new(),
            dirs: Vec::new(),
        }
    }

    /// Walk a save folder, applying the exclusion rules to its top level
    pub fn scan(save_dir: &Path, save_name: &str) -> Result<Self> {
        if !save_dir.is_dir() {
            return Err(CloudSyncError::NotFound(format!(
                "Local save folder {}",
                save_dir.display()
            )));
        }

        let mut root = Self::empty(save_name.to_string(), save_dir.to_path_buf());

        for entry in WalkDir::new(save_dir).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().is_dir();

            if entry.depth() == 1 && !is_dir && is_excluded_name(&name, save_name) {
                tracing::debug!("Skipping excluded file {}", entry.path().display());
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(save_dir)
                .map_err(|e| CloudSyncError::Internal(e.to_string()))?;
            root.insert(relative, entry.path(), is_dir);
        }

        Ok(root)
    }

    fn insert(&mut self, relative: &Path, full: &Path, is_dir: bool) {
        let mut components = relative.components();
        let Some(first) = components.next() else {
            return;
        };
        let rest = components.as_path();
        let first = first.as_os_str().to_string_lossy().to_string();

        if rest.as_os_str().is_empty() {
            if is_dir {
                if !self.dirs.iter().any(|d| d.name == first) {
                    self.dirs.push(Self::empty(first, full.to_path_buf()));
                }
            } else {
                self.files.push(full.to_path_buf());
            }
            return;
        }

        let child_path = self.path.join(&first);
        let position = self.dirs.iter().position(|d| d.name == first);
        let child = match position {
            Some(index) => &mut self.dirs[index],
            None => {
                self.dirs.push(Self::empty(first, child_path));
                let last = self.dirs.len() - 1;
                &mut self.dirs[last]
            }
        };
        child.insert(rest, full, is_dir);
    }

    /// Total number of files in this tree
    pub fn file_count(&self) -> usize {
        self.files.len() + self.dirs.iter().map(LocalTree::file_count).sum::<usize>()
    }

    /// Every file path relative to the tree root, depth first
    pub fn relative_files(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        self.collect_relative(Path::new(""), &mut out);
        out
    }

    fn collect_relative(&self, prefix: &Path, out: &mut Vec<PathBuf>) {
        for file in &self.files {
            if let Some(name) = file.file_name() {
                out.push(prefix.join(name));
            }
        }
        for dir in &self.dirs {
            dir.collect_relative(&prefix.join(&dir.name), out);
        }
    }
}
