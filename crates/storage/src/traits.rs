use fieldsync_core::{
    ids::*,
    mutation::{MutationOp, PendingMutation},
    work_order::WorkOrderSnapshot,
};

use crate::error::StorageError;

/// A queue row as read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEntry {
    Ready(PendingMutation),
    /// The stored payload no longer decodes or fails its checksum.
    Corrupt {
        mutation_id: MutationId,
        seq: i64,
        entity_id: WorkOrderId,
        error: String,
    },
}

impl QueueEntry {
    pub fn mutation_id(&self) -> MutationId {
        match self {
            Self::Ready(m) => m.mutation_id,
            Self::Corrupt { mutation_id, .. } => *mutation_id,
        }
    }

    pub fn seq(&self) -> i64 {
        match self {
            Self::Ready(m) => m.seq,
            Self::Corrupt { seq, .. } => *seq,
        }
    }

    pub fn entity_id(&self) -> &WorkOrderId {
        match self {
            Self::Ready(m) => &m.entity_id,
            Self::Corrupt { entity_id, .. } => entity_id,
        }
    }

    pub fn as_ready(&self) -> Option<&PendingMutation> {
        match self {
            Self::Ready(m) => Some(m),
            Self::Corrupt { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub mutation: PendingMutation,
    /// True only on the call that crossed the stuck threshold.
    pub became_stuck: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub mutation_id: MutationId,
    pub seq: i64,
    pub entity_id: WorkOrderId,
    pub op_type: String,
    /// None when the payload itself was what could not be decoded.
    pub op: Option<MutationOp>,
    pub error: String,
    pub failed_at: u64,
}

/// Durable cache of work-order snapshots, namespaced by user.
pub trait LocalStore {
    /// Replace the whole cached set with a fresh download. Atomic: either
    /// every row is replaced or nothing changes.
    fn replace_all(
        &mut self,
        user: &UserId,
        snapshots: &[WorkOrderSnapshot],
        synced_at: u64,
    ) -> Result<(), StorageError>;

    fn get_work_order(
        &self,
        user: &UserId,
        entity_id: &WorkOrderId,
    ) -> Result<Option<WorkOrderSnapshot>, StorageError>;

    fn list_work_orders(
        &self,
        user: &UserId,
        completed: bool,
    ) -> Result<Vec<WorkOrderSnapshot>, StorageError>;

    fn cached_count(&self, user: &UserId) -> Result<u64, StorageError>;

    fn last_sync_time(&self, user: &UserId) -> Result<Option<u64>, StorageError>;

    fn set_last_sync_time(&mut self, user: &UserId, at: u64) -> Result<(), StorageError>;
}

/// Durable FIFO of mutations awaiting remote application, namespaced by user.
pub trait MutationQueue {
    /// Append a mutation and apply it to the cached snapshot in one
    /// transaction. Returns the queued mutation and the updated snapshot.
    /// Fails with `NotFound` when the work order is not cached.
    fn enqueue(
        &mut self,
        user: &UserId,
        entity_id: &WorkOrderId,
        op: &MutationOp,
        author: &str,
        created_at: u64,
    ) -> Result<(PendingMutation, WorkOrderSnapshot), StorageError>;

    /// Oldest mutation whose work order has no stuck mutation at or before
    /// it. Everything queued behind a stuck mutation for the same work order
    /// stays put; other work orders keep flowing.
    fn next_in_order(&self, user: &UserId) -> Result<Option<QueueEntry>, StorageError>;

    /// Remove an acknowledged mutation and store the server state it
    /// produced. Whatever is still pending for the entity is re-rendered on
    /// top, so `locally_modified` clears only with the last one.
    fn dequeue(
        &mut self,
        user: &UserId,
        mutation_id: MutationId,
        server_state: &WorkOrderSnapshot,
        synced_at: u64,
    ) -> Result<WorkOrderSnapshot, StorageError>;

    fn mark_failed(
        &mut self,
        user: &UserId,
        mutation_id: MutationId,
        error: &str,
        stuck_threshold: u32,
    ) -> Result<FailureRecord, StorageError>;

    /// Put a stuck mutation back on the retry path with a fresh attempt count.
    fn reset_stuck(&mut self, user: &UserId, mutation_id: MutationId)
    -> Result<bool, StorageError>;

    /// Move a mutation off the active path. The entity it targeted is
    /// re-rendered without it.
    fn dead_letter(
        &mut self,
        user: &UserId,
        mutation_id: MutationId,
        error: &str,
        failed_at: u64,
    ) -> Result<Option<DeadLetter>, StorageError>;

    fn pending_count(&self, user: &UserId) -> Result<u64, StorageError>;

    fn stuck_count(&self, user: &UserId) -> Result<u64, StorageError>;

    fn list_pending(&self, user: &UserId) -> Result<Vec<QueueEntry>, StorageError>;

    fn list_dead_letters(&self, user: &UserId) -> Result<Vec<DeadLetter>, StorageError>;
}
