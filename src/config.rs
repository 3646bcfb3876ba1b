//! Configuration for CloudSync
//!
//! Settings are read from a JSON file and overlaid with environment
//! variables. Writing configuration back is left to the host.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CloudSyncError, Result};

/// Behaviour of the automatic upload/backup cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// Upload the current save at the end of each in-game day
    #[serde(default = "default_true")]
    pub auto_upload: bool,
    /// Snapshot the cloud copy before overwriting it
    #[serde(default = "default_true")]
    pub backup_saves: bool,
    /// Prune old backups on startup
    #[serde(default = "default_true")]
    pub purge_backups: bool,
    /// Backups retained per save when pruning
    #[serde(default = "default_backups_to_keep")]
    pub backups_to_keep: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            auto_upload: true,
            backup_saves: true,
            purge_backups: true,
            backups_to_keep: default_backups_to_keep(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_backups_to_keep() -> usize {
    2
}

/// Dropbox credentials (PKCE app, no secret)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropboxConfig {
    #[serde(default)]
    pub app_key: String,
    #[serde(default)]
    pub refresh_token: String,
}

impl DropboxConfig {
    /// All credentials needed to talk to Dropbox are present
    pub fn is_complete(&self) -> bool {
        !self.app_key.is_empty() && !self.refresh_token.is_empty()
    }
}

/// Google Drive credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub refresh_token: String,
}

impl DriveConfig {
    /// All credentials needed to talk to Google Drive are present
    pub fn is_complete(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty() && !self.refresh_token.is_empty()
    }
}

/// Where the game keeps its saves when nothing else is configured
pub fn default_saves_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("StardewValley").join("Saves"))
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudSyncConfig {
    #[serde(default)]
    pub settings: SyncSettings,
    #[serde(default)]
    pub dropbox: DropboxConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    /// Local saves root; `~` is expanded
    #[serde(default)]
    pub saves_dir: Option<String>,
}

impl CloudSyncConfig {
    /// Default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cloudsync").join("config.json"))
    }

    /// Load from a JSON file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                CloudSyncError::Config(format!("Invalid config file {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Overlay values from environment variables
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *target = value;
            }
        };
        set(&mut self.dropbox.app_key, "CLOUDSYNC_DROPBOX_APP_KEY");
        set(&mut self.dropbox.refresh_token, "CLOUDSYNC_DROPBOX_REFRESH_TOKEN");
        set(&mut self.drive.client_id, "CLOUDSYNC_DRIVE_CLIENT_ID");
        set(&mut self.drive.client_secret, "CLOUDSYNC_DRIVE_CLIENT_SECRET");
        set(&mut self.drive.refresh_token, "CLOUDSYNC_DRIVE_REFRESH_TOKEN");

        if let Some(dir) = lookup("CLOUDSYNC_SAVES_DIR").filter(|v| !v.is_empty()) {
            self.saves_dir = Some(dir);
        }
    }

    /// Resolved saves root, if configured
    pub fn saves_path(&self) -> Option<PathBuf> {
        self.saves_dir
            .as_deref()
            .map(|dir| PathBuf::from(shellexpand::tilde(dir).to_string()))
    }

    /// Configured saves root, else the game's default location
    pub fn saves_path_or_default(&self) -> Option<PathBuf> {
        self.saves_path().or_else(default_saves_dir)
    }
}
