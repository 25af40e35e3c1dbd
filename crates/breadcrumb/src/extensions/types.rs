use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use ts_rs::TS;

use crate::host::HostError;
use crate::manifest::Manifest;

/// Lifecycle status of an extension.
///
/// ```text
/// dormant ──> activating ──> active ──> deactivating ──> inactive
///                  │                                        │
///                  └──> failed <── (host crash) ──          └──> activating
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum ExtensionStatus {
    /// Discovered, waiting for an activation trigger.
    Dormant,
    Activating,
    Active,
    Failed,
    Deactivating,
    Inactive,
}

impl ExtensionStatus {
    /// Running, or on its way there.
    pub fn is_live(self) -> bool {
        matches!(self, ExtensionStatus::Active | ExtensionStatus::Activating)
    }
}

/// Where an extension was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum ExtensionSource {
    User,
    Workspace,
    Bundled,
}

/// One discovered extension.
#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ExtensionInfo {
    pub id: String,
    pub manifest: Manifest,
    /// Absolute install directory.
    #[ts(type = "string")]
    pub path: PathBuf,
    pub source: ExtensionSource,
    pub status: ExtensionStatus,
    pub error: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    /// Bumped on every activation attempt so a stale completion can tell it
    /// has been superseded.
    #[serde(skip)]
    #[ts(skip)]
    pub(crate) attempt: u64,
    /// Activation was cut short by a worker crash; replayed on restart.
    #[serde(skip)]
    #[ts(skip)]
    pub(crate) awaiting_restart: bool,
    /// Worker generation the in-flight activation was sent to.
    #[serde(skip)]
    #[ts(skip)]
    pub(crate) sent_to: Option<u64>,
}

impl ExtensionInfo {
    pub fn new(manifest: Manifest, path: PathBuf, source: ExtensionSource) -> Self {
        Self {
            id: manifest.id().to_string(),
            manifest,
            path,
            source,
            status: ExtensionStatus::Dormant,
            error: None,
            activated_at: None,
            attempt: 0,
            awaiting_restart: false,
            sent_to: None,
        }
    }
}

/// Notifications for the shell.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[serde(tag = "type", rename_all = "camelCase")]
#[ts(export)]
pub enum ManagerEvent {
    /// The set of known extensions changed.
    Changed,
    StatusChanged { id: String, status: ExtensionStatus },
    Error { id: String, message: String },
    /// The worker exhausted its restarts. Extensions stay failed until the
    /// manager is re-created.
    HostFailed,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtensionError {
    #[error("Extension not found: {0}")]
    NotFound(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error(transparent)]
    Host(#[from] HostError),
}
