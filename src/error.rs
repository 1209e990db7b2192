//! Error taxonomy shared by the tracker components.
//!
//! Local failures ([StorageError]) stay inside the operation that produced them and are reported
//! through the status reporter. Sync failures ([SyncError]) are classified so the engine can tell
//! whether to back off, count a rejection or stop trying altogether.

use std::{fmt::Display, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no api key configured")]
    MissingApiKey,
    #[error("invalid api url '{0}', expected an http(s) url")]
    InvalidApiUrl(String),
    #[error("option '{option}' must be greater than zero")]
    NotPositive { option: &'static str },
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io failure on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path:?} is held by another beatkeeper process")]
    Locked { path: PathBuf },
    #[error("failed to serialize record for {path:?}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("request timed out")]
    Timeout,
    #[error("remote responded with status {0}")]
    ServerStatus(u16),
    #[error("remote rejected the api key (status {0})")]
    Unauthorized(u16),
    #[error("remote rejected the payload (status {status}): {message}")]
    InvalidPayload { status: u16, message: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Unreachable(_)
            | SyncError::Timeout
            | SyncError::ServerStatus(_)
            | SyncError::MalformedResponse(_) => ErrorCategory::TransientNetwork,
            SyncError::Unauthorized(_) | SyncError::InvalidPayload { .. } => {
                ErrorCategory::RemoteRejection
            }
            SyncError::Storage(_) => ErrorCategory::LocalStorage,
        }
    }

    /// Rejections count towards dead-lettering, everything else is only retried.
    pub fn is_rejection(&self) -> bool {
        self.category() == ErrorCategory::RemoteRejection
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    TransientNetwork,
    RemoteRejection,
    LocalStorage,
}

/// Error as it is shown to the host. Only keeps the rendered message so it can be cloned freely
/// into status snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportedError {
    pub category: ErrorCategory,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ReportedError {
    pub fn new(category: ErrorCategory, message: impl Display, at: DateTime<Utc>) -> Self {
        Self {
            category,
            message: message.to_string(),
            at,
        }
    }
}

impl From<(&SyncError, DateTime<Utc>)> for ReportedError {
    fn from((error, at): (&SyncError, DateTime<Utc>)) -> Self {
        ReportedError::new(error.category(), error, at)
    }
}
