//! CloudSync - save synchronization and backup retention
//!
//! Uploads, downloads and snapshots game save folders on a cloud provider
//! (Dropbox or Google Drive), and prunes old snapshots per save.

#[cfg(any(feature = "dropbox", feature = "gdrive"))]
pub mod auth;
pub mod backup;
pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod local;
pub mod naming;
pub mod resilience;
pub mod rules;
pub mod store;
pub mod sync;
pub mod types;

pub use backup::{BackupManager, PurgeReport};
pub use client::{open_store, CloudClient, Provider};
pub use config::CloudSyncConfig;
pub use error::{CloudSyncError, Result};
pub use store::RemoteStore;
pub use sync::SyncEngine;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
