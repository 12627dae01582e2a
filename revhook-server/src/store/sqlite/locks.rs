//! `distributed_locks` table operations.
//!
//! Acquisition is a single upsert: the conflicting row is only overwritten
//! when it has expired or already belongs to the caller, and `changes()`
//! reports whether that happened. There is no read-then-write window for two
//! instances to race through.

use rusqlite::{params, Connection};

use crate::error::StoreError;

pub(super) fn try_acquire_sync(
    conn: &mut Connection,
    name: &str,
    key: &str,
    owner: &str,
    now_ms: i64,
    ttl_ms: i64,
) -> Result<bool, StoreError> {
    conn.execute(
        "INSERT INTO distributed_locks (lock_name, lock_key, locked_by, locked_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(lock_name, lock_key) DO UPDATE SET
             locked_by = excluded.locked_by,
             locked_at = excluded.locked_at,
             expires_at = excluded.expires_at
         WHERE distributed_locks.expires_at < excluded.locked_at
            OR distributed_locks.locked_by = excluded.locked_by",
        params![name, key, owner, now_ms, now_ms.saturating_add(ttl_ms)],
    )
    .map_err(|e| StoreError::storage("acquire lock", e))?;

    Ok(conn.changes() > 0)
}

pub(super) fn release_sync(
    conn: &mut Connection,
    name: &str,
    key: &str,
    owner: &str,
) -> Result<bool, StoreError> {
    let deleted = conn
        .execute(
            "DELETE FROM distributed_locks
             WHERE lock_name = ?1 AND lock_key = ?2 AND locked_by = ?3",
            params![name, key, owner],
        )
        .map_err(|e| StoreError::storage("release lock", e))?;
    Ok(deleted > 0)
}
