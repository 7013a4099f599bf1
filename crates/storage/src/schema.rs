use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = FULL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -8000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

// Every table is namespaced by user_id so one device can hold several
// technicians' caches without them ever seeing each other's rows.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS work_orders (
    user_id TEXT NOT NULL,
    wo_id TEXT NOT NULL,
    status TEXT NOT NULL,
    server_state BLOB NOT NULL,
    local_state BLOB NOT NULL,
    locally_modified INTEGER NOT NULL DEFAULT 0,
    last_synced_at INTEGER,
    cached_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, wo_id)
);
CREATE INDEX IF NOT EXISTS idx_work_orders_status ON work_orders (user_id, status);

CREATE TABLE IF NOT EXISTS mutation_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    mutation_id BLOB NOT NULL UNIQUE CHECK (length(mutation_id) = 16),
    entity_id TEXT NOT NULL,
    op_type TEXT NOT NULL,
    payload BLOB NOT NULL,
    checksum BLOB NOT NULL CHECK (length(checksum) = 32),
    author TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    state TEXT NOT NULL DEFAULT 'pending'
);
CREATE INDEX IF NOT EXISTS idx_queue_user_seq ON mutation_queue (user_id, seq);
CREATE INDEX IF NOT EXISTS idx_queue_entity ON mutation_queue (user_id, entity_id, seq);

CREATE TABLE IF NOT EXISTS dead_letters (
    mutation_id BLOB PRIMARY KEY CHECK (length(mutation_id) = 16),
    user_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    entity_id TEXT NOT NULL,
    op_type TEXT NOT NULL,
    payload BLOB NOT NULL,
    error TEXT NOT NULL,
    failed_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_user ON dead_letters (user_id, seq);

CREATE TABLE IF NOT EXISTS sync_meta (
    user_id TEXT PRIMARY KEY,
    last_sync_time INTEGER
);
";
