//! SQLite implementation of `JobStore` and `DistributedLock`.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.
//!
//! Several server instances may point at the same database file; the lock
//! table is what keeps their retry sweeps apart.

mod jobs;
mod locks;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use revhook_core::{JobId, JobStatus, NewJob, ReviewJob};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::{CreateOutcome, DistributedLock, JobStore};
use crate::error::StoreError;

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 2;

/// SQLite-backed store.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteStore {
    /// Exposed to tests so they can rewrite timestamps.
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` so readers do not block the writer
    /// - `busy_timeout = 5000ms` so concurrent instances wait instead of failing
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref).map_err(|e| StoreError::storage("open database", e))?;

        #[cfg(unix)]
        if !is_in_memory {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!("Failed to set restrictive permissions on database file: {}", e);
            }
        }

        // SQLite may silently keep DELETE mode on filesystems without shared
        // memory support; in-memory databases report "memory".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!(
                    "SQLite returned '{}' instead of 'wal'; the database directory \
                     must be on a filesystem that supports shared memory",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create schema_version table", e))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS review_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL,
                    commit_hash TEXT NOT NULL,
                    base_commit TEXT,
                    event_type TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    author_name TEXT NOT NULL,
                    author_email TEXT,
                    author_avatar_url TEXT,
                    author_profile_url TEXT,
                    commit_message TEXT NOT NULL,
                    mr_number INTEGER,
                    mr_url TEXT,
                    mr_target_branch TEXT,
                    diff TEXT,
                    files_changed INTEGER NOT NULL DEFAULT 0,
                    additions INTEGER NOT NULL DEFAULT 0,
                    deletions INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL,
                    score REAL,
                    review_result TEXT,
                    error_message TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    CHECK ((status = 'completed') = (score IS NOT NULL))
                );

                CREATE INDEX IF NOT EXISTS idx_review_jobs_commit
                    ON review_jobs(project_id, commit_hash);
                CREATE INDEX IF NOT EXISTS idx_review_jobs_status
                    ON review_jobs(status, created_at);
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e))?;
        }

        if from_version < 2 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS distributed_locks (
                    lock_name TEXT NOT NULL,
                    lock_key TEXT NOT NULL,
                    locked_by TEXT NOT NULL,
                    locked_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL,
                    PRIMARY KEY (lock_name, lock_key)
                );
                "#,
            )
            .map_err(|e| StoreError::storage("migration v2", e))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::storage(operation, "connection mutex poisoned"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::storage(operation, e))?
    }
}

/// Convert a usize limit to i64 for a SQLite LIMIT clause.
///
/// Very large usize values would otherwise wrap to a negative LIMIT, which
/// SQLite reads as "no limit".
fn usize_to_i64_limit(limit: usize, operation: &'static str) -> Result<i64, StoreError> {
    i64::try_from(limit).map_err(|_| {
        StoreError::storage(
            operation,
            format!("limit {} exceeds maximum storable value ({})", limit, i64::MAX),
        )
    })
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_unless_active(&self, new: NewJob) -> Result<CreateOutcome, StoreError> {
        self.with_conn("create job", move |conn| {
            jobs::create_unless_active_sync(conn, new, Utc::now())
        })
        .await
    }

    async fn get(&self, id: JobId) -> Result<Option<ReviewJob>, StoreError> {
        self.with_conn("get job", move |conn| jobs::get_sync(conn, id))
            .await
    }

    async fn update(&self, job: &ReviewJob) -> Result<(), StoreError> {
        let job = job.clone();
        self.with_conn("update job", move |conn| jobs::update_sync(conn, &job))
            .await
    }

    async fn find_by_commit(
        &self,
        project_id: i64,
        commit_hash: &str,
    ) -> Result<Option<ReviewJob>, StoreError> {
        let commit_hash = commit_hash.to_string();
        self.with_conn("find job by commit", move |conn| {
            jobs::find_by_commit_sync(conn, project_id, &commit_hash)
        })
        .await
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<ReviewJob>, StoreError> {
        let limit = usize_to_i64_limit(limit, "list jobs by status")?;
        self.with_conn("list jobs by status", move |conn| {
            jobs::list_by_status_sync(conn, status, limit)
        })
        .await
    }

    async fn list_retryable(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<ReviewJob>, StoreError> {
        let limit = usize_to_i64_limit(limit, "list retryable jobs")?;
        self.with_conn("list retryable jobs", move |conn| {
            jobs::list_retryable_sync(conn, max_attempts, limit)
        })
        .await
    }

    async fn list_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReviewJob>, StoreError> {
        let limit = usize_to_i64_limit(limit, "list stale jobs")?;
        let cutoff_ms = cutoff.timestamp_millis();
        self.with_conn("list stale jobs", move |conn| {
            jobs::list_stale_sync(conn, cutoff_ms, limit)
        })
        .await
    }
}

#[async_trait]
impl DistributedLock for SqliteStore {
    async fn try_acquire(
        &self,
        name: &str,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let (name, key, owner) = (name.to_string(), key.to_string(), owner.to_string());
        let ttl_ms = i64::try_from(ttl.as_millis())
            .map_err(|_| StoreError::storage("acquire lock", "ttl out of range"))?;
        self.with_conn("acquire lock", move |conn| {
            locks::try_acquire_sync(
                conn,
                &name,
                &key,
                &owner,
                Utc::now().timestamp_millis(),
                ttl_ms,
            )
        })
        .await
    }

    async fn release(&self, name: &str, key: &str, owner: &str) -> Result<bool, StoreError> {
        let (name, key, owner) = (name.to_string(), key.to_string(), owner.to_string());
        self.with_conn("release lock", move |conn| {
            locks::release_sync(conn, &name, &key, &owner)
        })
        .await
    }
}
