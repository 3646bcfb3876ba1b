//! Error types for CloudSync

use thiserror::Error;

/// Result type alias for CloudSync operations
pub type Result<T> = std::result::Result<T, CloudSyncError>;

/// Main error type for CloudSync
#[derive(Error, Debug)]
pub enum CloudSyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(any(feature = "dropbox", feature = "gdrive"))]
    Http(#[from] reqwest::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(not(any(feature = "dropbox", feature = "gdrive")))]
    Http(String),

    #[error("Provider API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Save \"{0}\" is currently being uploaded")]
    SaveBusy(String),

    #[error("{failed} of {total} operations failed, first error: {first}")]
    Batch {
        failed: usize,
        total: usize,
        first: Box<CloudSyncError>,
    },

    #[error("Task error: {0}")]
    Task(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CloudSyncError {
    /// Whether the provider throttled this request
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, CloudSyncError::RateLimited(_))
    }

    /// Whether the target of the request does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            CloudSyncError::NotFound(_) => true,
            CloudSyncError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if error is retryable
    ///
    /// Only throttling is retried; every other failure is surfaced on the
    /// first attempt.
    pub fn is_retryable(&self) -> bool {
        self.is_rate_limited()
    }

    /// The error that started a failed batch, or `self` for single failures
    pub fn root(&self) -> &CloudSyncError {
        match self {
            CloudSyncError::Batch { first, .. } => first.root(),
            other => other,
        }
    }
}

impl From<walkdir::Error> for CloudSyncError {
    fn from(e: walkdir::Error) -> Self {
        CloudSyncError::Io(e.into())
    }
}

impl From<tokio::task::JoinError> for CloudSyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        CloudSyncError::Task(e.to_string())
    }
}
