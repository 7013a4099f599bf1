use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use fieldsync_core::{
    ids::*,
    mutation::{MutationOp, MutationState, PendingMutation, payload_checksum},
    work_order::WorkOrderSnapshot,
};

use crate::error::StorageError;
use crate::traits::{DeadLetter, FailureRecord, LocalStore, MutationQueue, QueueEntry};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Wipe every row belonging to `user`: cache, queue, dead letters, metadata.
    pub fn clear_user(&mut self, user: &UserId) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        for table in ["work_orders", "mutation_queue", "dead_letters", "sync_meta"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE user_id = ?1"),
                params![user.as_str()],
            )?;
        }
        tx.commit()?;
        info!(user = %user, "cleared offline state");
        Ok(())
    }
}

struct CachedRow {
    server: WorkOrderSnapshot,
    local: WorkOrderSnapshot,
}

fn load_row(
    conn: &Connection,
    user: &UserId,
    wo_id: &WorkOrderId,
) -> Result<Option<CachedRow>, StorageError> {
    let row: Option<(Vec<u8>, Vec<u8>)> = conn
        .query_row(
            "SELECT server_state, local_state FROM work_orders WHERE user_id = ?1 AND wo_id = ?2",
            params![user.as_str(), wo_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((server, local)) => Ok(Some(CachedRow {
            server: WorkOrderSnapshot::from_msgpack(&server)?,
            local: WorkOrderSnapshot::from_msgpack(&local)?,
        })),
        None => Ok(None),
    }
}

fn write_row(
    conn: &Connection,
    user: &UserId,
    server: &WorkOrderSnapshot,
    local: &WorkOrderSnapshot,
    cached_at: u64,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO work_orders (user_id, wo_id, status, server_state, local_state, locally_modified, last_synced_at, cached_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(user_id, wo_id) DO UPDATE SET status = excluded.status, server_state = excluded.server_state,
             local_state = excluded.local_state, locally_modified = excluded.locally_modified,
             last_synced_at = excluded.last_synced_at, cached_at = excluded.cached_at",
        params![
            user.as_str(),
            local.id.as_str(),
            local.status.as_str(),
            server.to_msgpack()?,
            local.to_msgpack()?,
            local.locally_modified,
            local.last_synced_at.map(|t| t as i64),
            cached_at as i64,
        ],
    )?;
    Ok(())
}

fn write_local(
    conn: &Connection,
    user: &UserId,
    local: &WorkOrderSnapshot,
    cached_at: u64,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE work_orders SET status = ?3, local_state = ?4, locally_modified = ?5, cached_at = ?6
         WHERE user_id = ?1 AND wo_id = ?2",
        params![
            user.as_str(),
            local.id.as_str(),
            local.status.as_str(),
            local.to_msgpack()?,
            local.locally_modified,
            cached_at as i64,
        ],
    )?;
    Ok(())
}

/// Server state with every pending patch for the entity applied in queue order.
fn render(server: &WorkOrderSnapshot, pending: &[QueueEntry]) -> WorkOrderSnapshot {
    let mut local = server.clone();
    for mutation in pending.iter().filter_map(QueueEntry::as_ready) {
        local.apply(&mutation.patch());
    }
    local.locally_modified = !pending.is_empty();
    local
}

fn store_server_state(
    conn: &Connection,
    user: &UserId,
    server_state: &WorkOrderSnapshot,
    synced_at: u64,
) -> Result<WorkOrderSnapshot, StorageError> {
    let mut server = server_state.clone();
    server.locally_modified = false;
    server.last_synced_at = Some(synced_at);
    let pending = entity_entries(conn, user, &server.id)?;
    let local = render(&server, &pending);
    write_row(conn, user, &server, &local, synced_at)?;
    Ok(local)
}

fn rerender(
    conn: &Connection,
    user: &UserId,
    wo_id: &WorkOrderId,
    cached_at: u64,
) -> Result<Option<WorkOrderSnapshot>, StorageError> {
    let Some(row) = load_row(conn, user, wo_id)? else {
        return Ok(None);
    };
    let pending = entity_entries(conn, user, wo_id)?;
    let local = render(&row.server, &pending);
    write_row(conn, user, &row.server, &local, cached_at)?;
    Ok(Some(local))
}

fn insert_mutation(
    conn: &Connection,
    user: &UserId,
    entity_id: &WorkOrderId,
    op: &MutationOp,
    author: &str,
    created_at: u64,
) -> Result<PendingMutation, StorageError> {
    let mutation_id = MutationId::new();
    let payload = op.to_msgpack()?;
    let checksum = payload_checksum(&payload);
    conn.execute(
        "INSERT INTO mutation_queue (user_id, mutation_id, entity_id, op_type, payload, checksum, author, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            user.as_str(),
            mutation_id.as_bytes().as_slice(),
            entity_id.as_str(),
            op.op_type_name(),
            payload,
            &checksum[..],
            author,
            created_at as i64,
        ],
    )?;
    let seq = conn.last_insert_rowid();
    debug!(
        %mutation_id,
        seq,
        entity = %entity_id,
        op = op.op_type_name(),
        "mutation enqueued"
    );
    Ok(PendingMutation {
        mutation_id,
        seq,
        entity_id: entity_id.clone(),
        op: op.clone(),
        author: author.to_string(),
        created_at,
        attempt_count: 0,
        last_error: None,
        state: MutationState::Pending,
    })
}

const QUEUE_COLUMNS: &str =
    "seq, mutation_id, entity_id, payload, checksum, author, created_at, attempt_count, last_error, state";

struct RawQueueRow {
    seq: i64,
    mutation_id: Vec<u8>,
    entity_id: String,
    payload: Vec<u8>,
    checksum: Vec<u8>,
    author: String,
    created_at: i64,
    attempt_count: i64,
    last_error: Option<String>,
    state: String,
}

fn raw_queue_row(row: &rusqlite::Row) -> rusqlite::Result<RawQueueRow> {
    Ok(RawQueueRow {
        seq: row.get(0)?,
        mutation_id: row.get(1)?,
        entity_id: row.get(2)?,
        payload: row.get(3)?,
        checksum: row.get(4)?,
        author: row.get(5)?,
        created_at: row.get(6)?,
        attempt_count: row.get(7)?,
        last_error: row.get(8)?,
        state: row.get(9)?,
    })
}

fn decode_entry(raw: RawQueueRow) -> Result<QueueEntry, StorageError> {
    let mutation_id = MutationId::from_bytes(to_array::<16>(raw.mutation_id, "mutation_id")?);
    let entity_id = WorkOrderId::new(raw.entity_id);

    let decoded = if raw.checksum.as_slice() != payload_checksum(&raw.payload).as_slice() {
        Err("payload checksum mismatch".to_string())
    } else {
        MutationOp::from_msgpack(&raw.payload).map_err(|e| e.to_string())
    };
    let op = match decoded {
        Ok(op) => op,
        Err(error) => {
            warn!(%mutation_id, seq = raw.seq, %error, "corrupt queue entry");
            return Ok(QueueEntry::Corrupt {
                mutation_id,
                seq: raw.seq,
                entity_id,
                error,
            });
        }
    };

    Ok(QueueEntry::Ready(PendingMutation {
        mutation_id,
        seq: raw.seq,
        entity_id,
        op,
        author: raw.author,
        created_at: raw.created_at as u64,
        attempt_count: raw.attempt_count as u32,
        last_error: raw.last_error,
        state: MutationState::parse(&raw.state)?,
    }))
}

fn read_entries<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Vec<QueueEntry>, StorageError> {
    let sql = format!("SELECT {QUEUE_COLUMNS} FROM mutation_queue WHERE {filter}");
    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
        .query_map(params, raw_queue_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(decode_entry).collect()
}

fn entity_entries(
    conn: &Connection,
    user: &UserId,
    entity_id: &WorkOrderId,
) -> Result<Vec<QueueEntry>, StorageError> {
    read_entries(
        conn,
        "user_id = ?1 AND entity_id = ?2 ORDER BY seq",
        params![user.as_str(), entity_id.as_str()],
    )
}

fn entry_by_id(
    conn: &Connection,
    user: &UserId,
    mutation_id: MutationId,
) -> Result<Option<QueueEntry>, StorageError> {
    Ok(read_entries(
        conn,
        "user_id = ?1 AND mutation_id = ?2",
        params![user.as_str(), mutation_id.as_bytes().as_slice()],
    )?
    .into_iter()
    .next())
}

impl LocalStore for SqliteStorage {
    fn replace_all(
        &mut self,
        user: &UserId,
        snapshots: &[WorkOrderSnapshot],
        synced_at: u64,
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;

        // Entities with queued work survive a download even if the server
        // stopped listing them; their mutations still need a verdict.
        let pending_entities: BTreeSet<String> = {
            let mut stmt =
                tx.prepare("SELECT DISTINCT entity_id FROM mutation_queue WHERE user_id = ?1")?;
            let ids = stmt
                .query_map(params![user.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<_, _>>()?;
            ids
        };
        let mut carried = Vec::new();
        for wo_id in &pending_entities {
            if let Some(row) = load_row(&tx, user, &WorkOrderId::new(wo_id.as_str()))? {
                carried.push(row.server);
            }
        }

        tx.execute("DELETE FROM work_orders WHERE user_id = ?1", params![user.as_str()])?;

        let incoming: BTreeSet<&str> = snapshots.iter().map(|s| s.id.as_str()).collect();
        for snapshot in snapshots {
            store_server_state(&tx, user, snapshot, synced_at)?;
        }
        for server in carried
            .iter()
            .filter(|s| !incoming.contains(s.id.as_str()))
        {
            let pending = entity_entries(&tx, user, &server.id)?;
            write_row(&tx, user, server, &render(server, &pending), synced_at)?;
        }

        tx.execute(
            "INSERT INTO sync_meta (user_id, last_sync_time) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET last_sync_time = excluded.last_sync_time",
            params![user.as_str(), synced_at as i64],
        )?;
        tx.commit()?;
        info!(
            user = %user,
            downloaded = snapshots.len(),
            pending_entities = pending_entities.len(),
            "replaced cached work orders"
        );
        Ok(())
    }

    fn get_work_order(
        &self,
        user: &UserId,
        entity_id: &WorkOrderId,
    ) -> Result<Option<WorkOrderSnapshot>, StorageError> {
        Ok(load_row(&self.conn, user, entity_id)?.map(|row| row.local))
    }

    fn list_work_orders(
        &self,
        user: &UserId,
        completed: bool,
    ) -> Result<Vec<WorkOrderSnapshot>, StorageError> {
        let sql = if completed {
            "SELECT local_state FROM work_orders WHERE user_id = ?1 AND status = 'completed' ORDER BY wo_id"
        } else {
            "SELECT local_state FROM work_orders WHERE user_id = ?1 AND status != 'completed' ORDER BY wo_id"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let blobs = stmt
            .query_map(params![user.as_str()], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut result = Vec::with_capacity(blobs.len());
        for blob in blobs {
            result.push(WorkOrderSnapshot::from_msgpack(&blob)?);
        }
        Ok(result)
    }

    fn cached_count(&self, user: &UserId) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM work_orders WHERE user_id = ?1",
            params![user.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn last_sync_time(&self, user: &UserId) -> Result<Option<u64>, StorageError> {
        let at: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT last_sync_time FROM sync_meta WHERE user_id = ?1",
                params![user.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(at.flatten().map(|t| t as u64))
    }

    fn set_last_sync_time(&mut self, user: &UserId, at: u64) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO sync_meta (user_id, last_sync_time) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET last_sync_time = excluded.last_sync_time",
            params![user.as_str(), at as i64],
        )?;
        Ok(())
    }
}

impl MutationQueue for SqliteStorage {
    fn enqueue(
        &mut self,
        user: &UserId,
        entity_id: &WorkOrderId,
        op: &MutationOp,
        author: &str,
        created_at: u64,
    ) -> Result<(PendingMutation, WorkOrderSnapshot), StorageError> {
        let tx = self.conn.transaction()?;
        let row = load_row(&tx, user, entity_id)?
            .ok_or_else(|| StorageError::NotFound(format!("work order {entity_id}")))?;
        let mutation = insert_mutation(&tx, user, entity_id, op, author, created_at)?;
        let mut local = row.local;
        local.apply(&mutation.patch());
        local.locally_modified = true;
        write_local(&tx, user, &local, created_at)?;
        tx.commit()?;
        Ok((mutation, local))
    }

    fn next_in_order(&self, user: &UserId) -> Result<Option<QueueEntry>, StorageError> {
        Ok(read_entries(
            &self.conn,
            "user_id = ?1 AND NOT EXISTS (
                 SELECT 1 FROM mutation_queue AS blocker
                 WHERE blocker.user_id = mutation_queue.user_id
                   AND blocker.entity_id = mutation_queue.entity_id
                   AND blocker.state = 'stuck'
                   AND blocker.seq <= mutation_queue.seq)
             ORDER BY seq LIMIT 1",
            params![user.as_str()],
        )?
        .into_iter()
        .next())
    }

    fn dequeue(
        &mut self,
        user: &UserId,
        mutation_id: MutationId,
        server_state: &WorkOrderSnapshot,
        synced_at: u64,
    ) -> Result<WorkOrderSnapshot, StorageError> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM mutation_queue WHERE user_id = ?1 AND mutation_id = ?2",
            params![user.as_str(), mutation_id.as_bytes().as_slice()],
        )?;
        if removed == 0 {
            warn!(%mutation_id, "confirmed mutation was no longer queued");
        }
        let local = store_server_state(&tx, user, server_state, synced_at)?;
        tx.commit()?;
        debug!(
            %mutation_id,
            entity = %server_state.id,
            still_modified = local.locally_modified,
            "mutation confirmed"
        );
        Ok(local)
    }

    fn mark_failed(
        &mut self,
        user: &UserId,
        mutation_id: MutationId,
        error: &str,
        stuck_threshold: u32,
    ) -> Result<FailureRecord, StorageError> {
        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE mutation_queue SET attempt_count = attempt_count + 1, last_error = ?3
             WHERE user_id = ?1 AND mutation_id = ?2",
            params![user.as_str(), mutation_id.as_bytes().as_slice(), error],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("mutation {mutation_id}")));
        }

        let mut mutation = match entry_by_id(&tx, user, mutation_id)? {
            Some(QueueEntry::Ready(m)) => m,
            Some(QueueEntry::Corrupt { error, .. }) => {
                return Err(StorageError::Serialization(error));
            }
            None => return Err(StorageError::NotFound(format!("mutation {mutation_id}"))),
        };

        let became_stuck = !mutation.is_stuck() && mutation.attempt_count >= stuck_threshold;
        if became_stuck {
            tx.execute(
                "UPDATE mutation_queue SET state = ?3 WHERE user_id = ?1 AND mutation_id = ?2",
                params![
                    user.as_str(),
                    mutation_id.as_bytes().as_slice(),
                    MutationState::Stuck.as_str(),
                ],
            )?;
            mutation.state = MutationState::Stuck;
        }
        tx.commit()?;
        Ok(FailureRecord {
            mutation,
            became_stuck,
        })
    }

    fn reset_stuck(
        &mut self,
        user: &UserId,
        mutation_id: MutationId,
    ) -> Result<bool, StorageError> {
        let updated = self.conn.execute(
            "UPDATE mutation_queue SET state = 'pending', attempt_count = 0
             WHERE user_id = ?1 AND mutation_id = ?2 AND state = 'stuck'",
            params![user.as_str(), mutation_id.as_bytes().as_slice()],
        )?;
        Ok(updated > 0)
    }

    fn dead_letter(
        &mut self,
        user: &UserId,
        mutation_id: MutationId,
        error: &str,
        failed_at: u64,
    ) -> Result<Option<DeadLetter>, StorageError> {
        let tx = self.conn.transaction()?;
        let row: Option<(i64, String, String, Vec<u8>)> = tx
            .query_row(
                "SELECT seq, entity_id, op_type, payload FROM mutation_queue WHERE user_id = ?1 AND mutation_id = ?2",
                params![user.as_str(), mutation_id.as_bytes().as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((seq, entity, op_type, payload)) = row else {
            return Ok(None);
        };

        tx.execute(
            "INSERT OR REPLACE INTO dead_letters (mutation_id, user_id, seq, entity_id, op_type, payload, error, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                mutation_id.as_bytes().as_slice(),
                user.as_str(),
                seq,
                entity,
                op_type,
                payload,
                error,
                failed_at as i64,
            ],
        )?;
        tx.execute(
            "DELETE FROM mutation_queue WHERE user_id = ?1 AND mutation_id = ?2",
            params![user.as_str(), mutation_id.as_bytes().as_slice()],
        )?;
        let entity_id = WorkOrderId::new(entity);
        rerender(&tx, user, &entity_id, failed_at)?;
        tx.commit()?;

        warn!(%mutation_id, seq, entity = %entity_id, %error, "mutation dead-lettered");
        Ok(Some(DeadLetter {
            mutation_id,
            seq,
            entity_id,
            op_type,
            op: MutationOp::from_msgpack(&payload).ok(),
            error: error.to_string(),
            failed_at,
        }))
    }

    fn pending_count(&self, user: &UserId) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM mutation_queue WHERE user_id = ?1",
            params![user.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn stuck_count(&self, user: &UserId) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM mutation_queue WHERE user_id = ?1 AND state = 'stuck'",
            params![user.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn list_pending(&self, user: &UserId) -> Result<Vec<QueueEntry>, StorageError> {
        read_entries(&self.conn, "user_id = ?1 ORDER BY seq", params![user.as_str()])
    }

    fn list_dead_letters(&self, user: &UserId) -> Result<Vec<DeadLetter>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT mutation_id, seq, entity_id, op_type, payload, error, failed_at
             FROM dead_letters WHERE user_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![user.as_str()], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut result = Vec::with_capacity(rows.len());
        for (mutation_id, seq, entity_id, op_type, payload, error, failed_at) in rows {
            result.push(DeadLetter {
                mutation_id: MutationId::from_bytes(to_array::<16>(mutation_id, "mutation_id")?),
                seq,
                entity_id: WorkOrderId::new(entity_id),
                op_type,
                op: MutationOp::from_msgpack(&payload).ok(),
                error,
                failed_at: failed_at as u64,
            });
        }
        Ok(result)
    }
}
