use fieldsync_core::{CoreError, MutationId, WorkOrderId};
use fieldsync_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("engine not initialized")]
    NotInitialized,

    #[error("work order not cached: {0}")]
    WorkOrderNotCached(WorkOrderId),

    #[error("mutation not found: {0}")]
    MutationNotFound(MutationId),

    #[error("local store lock poisoned")]
    LockPoisoned,
}
