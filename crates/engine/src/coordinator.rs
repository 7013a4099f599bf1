use fieldsync_core::{MutationId, WorkOrderId};
use serde::Serialize;
use thiserror::Error;

use crate::error::EngineError;
use crate::remote::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Downloading,
    Syncing,
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Downloading | Self::Syncing)
    }
}

/// What the UI renders. Scoped to the logged-in user.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SyncState {
    pub is_online: bool,
    pub sync_status: SyncStatus,
    /// Every queued mutation, stuck ones included.
    pub pending_sync_count: u64,
    pub last_sync_time: Option<u64>,
    pub cached_count: u64,
    pub is_downloading: bool,
    pub stuck_count: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    pub synced: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    pub count: usize,
}

/// Outcome of a drain or download. Clone so every caller joined on the same
/// drain gets the same answer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("device is offline")]
    Offline,

    #[error("engine not initialized")]
    NotInitialized,

    #[error("another sync or download is running")]
    Busy,

    #[error("mutation {mutation_id} on {entity_id} is stuck and needs attention")]
    Stuck {
        mutation_id: MutationId,
        entity_id: WorkOrderId,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("local store: {0}")]
    Local(String),
}

impl From<EngineError> for SyncError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotInitialized => Self::NotInitialized,
            other => Self::Local(other.to_string()),
        }
    }
}

/// Transient events for toasts. Persistent status lives in [`SyncState`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotification {
    SyncCompleted {
        synced: u64,
        dead_lettered: u64,
    },
    SyncFailed {
        error: String,
    },
    MutationStuck {
        mutation_id: MutationId,
        entity_id: WorkOrderId,
        attempts: u32,
        error: String,
    },
    MutationDeadLettered {
        mutation_id: MutationId,
        entity_id: WorkOrderId,
        error: String,
    },
    DownloadCompleted {
        count: usize,
    },
    DownloadFailed {
        error: String,
    },
    /// Logout wiped mutations that never reached the server.
    PendingDiscarded {
        count: u64,
    },
}
