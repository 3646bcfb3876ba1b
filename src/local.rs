//! Local saves root
//!
//! The host owns the save folders and their binary format. This module only
//! needs to find them and obtain a [`SaveInfo`] for each, which it does
//! through a [`SaveInfoReader`] supplied by the host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{CloudSyncError, Result};
use crate::types::{SaveInfo, SaveListing};

/// Per-save metadata file, relative to the save folder
pub const SAVE_INFO_FILE: &str = "SaveGameInfo";

/// Staging folder inside the saves root used while restoring
pub const TEMP_FOLDER: &str = "cstemp";

/// Host hook that turns a save folder into a [`SaveInfo`]
pub trait SaveInfoReader: Send + Sync {
    fn read_save_info(&self, save_dir: &Path, folder_name: &str) -> Result<SaveInfo>;
}

/// Reads the metadata file as a JSON farmer summary
/// (`farmerName`, `farmName`, `daysPlayed`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSaveInfoReader;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FarmerSummary {
    farmer_name: String,
    farm_name: String,
    days_played: u32,
}

impl SaveInfoReader for JsonSaveInfoReader {
    fn read_save_info(&self, save_dir: &Path, folder_name: &str) -> Result<SaveInfo> {
        let text = std::fs::read_to_string(save_dir.join(SAVE_INFO_FILE))?;
        let summary: FarmerSummary = serde_json::from_str(&text)?;
        Ok(SaveInfo::new(
            folder_name,
            summary.farmer_name,
            summary.farm_name,
            summary.days_played,
        ))
    }
}

/// The host's saves root
#[derive(Clone)]
pub struct LocalSaves {
    root: PathBuf,
    reader: Arc<dyn SaveInfoReader>,
}

impl LocalSaves {
    pub fn new(root: impl Into<PathBuf>, reader: Arc<dyn SaveInfoReader>) -> Self {
        Self {
            root: root.into(),
            reader,
        }
    }

    /// Saves root whose metadata files are JSON summaries
    pub fn with_json_reader(root: impl Into<PathBuf>) -> Self {
        Self::new(root, Arc::new(JsonSaveInfoReader))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save_path(&self, save_name: &str) -> PathBuf {
        self.root.join(save_name)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_FOLDER)
    }

    pub fn exists(&self, save_name: &str) -> bool {
        self.save_path(save_name).is_dir()
    }

    /// Metadata of one local save
    pub fn save_info(&self, save_name: &str) -> Result<SaveInfo> {
        let save_dir = self.save_path(save_name);
        if !save_dir.join(SAVE_INFO_FILE).is_file() {
            return Err(CloudSyncError::NotFound(format!(
                "{} in {}",
                SAVE_INFO_FILE,
                save_dir.display()
            )));
        }
        self.reader.read_save_info(&save_dir, save_name)
    }

    /// Every save in the root; unreadable saves are skipped and flagged
    pub fn list(&self) -> Result<SaveListing> {
        let mut listing = SaveListing::default();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(listing),
            Err(e) => return Err(e.into()),
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let Some(name) = dir.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if name.eq_ignore_ascii_case(TEMP_FOLDER) {
                continue;
            }
            if !dir.join(SAVE_INFO_FILE).is_file() {
                tracing::warn!("No {} file in {}", SAVE_INFO_FILE, dir.display());
                listing.load_failed = true;
                continue;
            }
            match self.reader.read_save_info(&dir, &name) {
                Ok(info) => listing.saves.push(info),
                Err(e) => {
                    tracing::error!("Failed to read save info from {}: {}", dir.display(), e);
                    listing.load_failed = true;
                }
            }
        }

        Ok(listing)
    }

    /// Swap a fully staged save folder in place of the current one
    pub fn replace_with(&self, save_name: &str, staged: &Path) -> Result<()> {
        let target = self.save_path(save_name);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(staged, &target)?;
        tracing::info!("Replaced local save {}", target.display());
        Ok(())
    }
}
