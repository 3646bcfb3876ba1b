//! Core types for CloudSync

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Summary of a save, uploaded beside every save so cloud saves can be
/// listed without downloading their content.
///
/// All four fields are required on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveInfo {
    /// Name of the save folder, unique within the saves root
    pub folder_name: String,
    pub farmer_name: String,
    pub farm_name: String,
    /// In-game days played; only ever grows over the life of a save
    pub days_played: u32,
}

impl SaveInfo {
    pub fn new(
        folder_name: impl Into<String>,
        farmer_name: impl Into<String>,
        farm_name: impl Into<String>,
        days_played: u32,
    ) -> Self {
        Self {
            folder_name: folder_name.into(),
            farmer_name: farmer_name.into(),
            farm_name: farm_name.into(),
            days_played,
        }
    }

    /// Label shown to players when picking a save
    pub fn display_name(&self) -> String {
        format!("{} | {} Farm", self.farmer_name, self.farm_name)
    }

    /// Serialize to the sidecar/description JSON shape
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the sidecar/description JSON shape
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Result of comparing the copy about to be written against the copy it
/// would replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// Nothing to replace, or the incoming copy is at least as far along
    UpToDate,
    /// The copy that would be overwritten has more days played
    OtherIsNewer { current_days: u32, incoming_days: u32 },
}

impl Staleness {
    /// Compare an incoming save against the copy it would overwrite
    pub fn compare(incoming: &SaveInfo, current: Option<&SaveInfo>) -> Self {
        match current {
            Some(current) if current.days_played > incoming.days_played => {
                Staleness::OtherIsNewer {
                    current_days: current.days_played,
                    incoming_days: incoming.days_played,
                }
            }
            _ => Staleness::UpToDate,
        }
    }
}

/// Cloud saves listing plus whether any entry failed to load
#[derive(Debug, Clone, Default)]
pub struct SaveListing {
    pub saves: Vec<SaveInfo>,
    pub load_failed: bool,
}

/// A timestamped server-side snapshot of a save folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    /// Logical name: the save folder the backup was taken from
    pub folder_name: String,
    /// Name of the backup folder in the Backups container
    pub cloud_folder_name: String,
    pub timestamp: DateTime<FixedOffset>,
}

impl Backup {
    pub fn display_name(&self) -> String {
        format!(
            "{}\n{}",
            self.folder_name,
            self.timestamp.format("%Y-%m-%d %I:%M:%S %p %:z")
        )
    }
}

/// Opaque handle to a remote object: a path for path-addressed stores, an
/// ID for graph-addressed ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteRef(String);

impl RemoteRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of a remote listing, projected to what every store can provide
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_folder: bool,
    /// Handle used to address this entry in later calls
    pub reference: RemoteRef,
    /// Containing folders; may hold several entries on graph stores
    pub parents: Vec<RemoteRef>,
    /// Provider-native metadata field (folder description), if fetched
    pub metadata: Option<String>,
}

impl RemoteEntry {
    /// Whether `parent` is one of this entry's containing folders
    pub fn is_child_of(&self, parent: &RemoteRef) -> bool {
        self.parents.iter().any(|p| p == parent)
    }
}

/// The well-known top-level containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLayout {
    pub root: RemoteRef,
    pub saves: RemoteRef,
    pub backups: RemoteRef,
}
