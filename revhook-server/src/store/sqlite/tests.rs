//! Tests for the SQLite store.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;

use super::super::{contract, CreateOutcome, DistributedLock, JobStore};
use super::{SqliteStore, CURRENT_SCHEMA_VERSION};
use revhook_core::JobStatus;

fn store() -> SqliteStore {
    SqliteStore::new_in_memory().unwrap()
}

#[tokio::test]
async fn test_duplicate_suppressed() {
    contract::duplicate_suppressed(&store()).await;
}

#[tokio::test]
async fn test_failed_job_allows_new_delivery() {
    contract::failed_job_allows_new_delivery(&store()).await;
}

#[tokio::test]
async fn test_empty_commit_never_deduplicated() {
    contract::empty_commit_never_deduplicated(&store()).await;
}

#[tokio::test]
async fn test_update_roundtrips_fields() {
    contract::update_roundtrips_fields(&store()).await;
}

#[tokio::test]
async fn test_update_missing_job_is_not_found() {
    contract::update_missing_job_is_not_found(&store()).await;
}

#[tokio::test]
async fn test_retryable_respects_cap_and_order() {
    contract::retryable_respects_cap_and_order(&store()).await;
}

#[tokio::test]
async fn test_stale_jobs_listed_by_age() {
    contract::stale_jobs_listed_by_age(&store()).await;
}

#[tokio::test]
async fn test_lock_excludes_other_owners() {
    contract::lock_excludes_other_owners(&store()).await;
}

#[tokio::test]
async fn test_lock_expires() {
    contract::lock_expires(&store()).await;
}

#[tokio::test]
async fn test_schema_version_recorded() {
    let store = store();
    let conn = store.conn.lock().unwrap();
    let version: i64 = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(version, CURRENT_SCHEMA_VERSION);
}

#[tokio::test]
async fn test_newer_schema_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    {
        let store = SqliteStore::new(&path).unwrap();
        let conn = store.conn.lock().unwrap();
        conn.execute(
            "UPDATE schema_version SET version = ?1 WHERE id = 1",
            params![CURRENT_SCHEMA_VERSION + 1],
        )
        .unwrap();
    }
    assert!(SqliteStore::new(&path).is_err());
}

#[tokio::test]
async fn test_score_without_completed_violates_check() {
    let store = store();
    let job = store
        .create_unless_active(contract::new_job(1, "abc"))
        .await
        .unwrap()
        .job()
        .clone();

    let conn = store.conn.lock().unwrap();
    let result = conn.execute(
        "UPDATE review_jobs SET score = 50.0 WHERE id = ?1",
        params![job.id.0],
    );
    assert!(result.is_err(), "a pending job must not carry a score");
}

#[tokio::test]
async fn test_corrupt_status_reported() {
    let store = store();
    let job = store
        .create_unless_active(contract::new_job(1, "abc"))
        .await
        .unwrap()
        .job()
        .clone();
    {
        let conn = store.conn.lock().unwrap();
        conn.execute(
            "UPDATE review_jobs SET status = 'exploded' WHERE id = ?1",
            params![job.id.0],
        )
        .unwrap();
    }
    let err = store.get(job.id).await.unwrap_err();
    assert!(matches!(err, crate::error::StoreError::Corruption(_)));
}

#[tokio::test]
async fn test_on_disk_persistence_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("revhook.db");

    let id = {
        let store = SqliteStore::new(&path).unwrap();
        let mut job = store
            .create_unless_active(contract::new_job(3, "cafe"))
            .await
            .unwrap()
            .job()
            .clone();
        job.mark_failed("network unreachable");
        store.update(&job).await.unwrap();
        job.id
    };

    let store = SqliteStore::new(&path).unwrap();
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("network unreachable"));
    assert_eq!(store.list_retryable(3, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_two_instances_share_dedup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("revhook.db");
    let a = SqliteStore::new(&path).unwrap();
    let b = SqliteStore::new(&path).unwrap();

    let first = a.create_unless_active(contract::new_job(1, "f00d")).await.unwrap();
    let second = b.create_unless_active(contract::new_job(1, "f00d")).await.unwrap();

    assert!(matches!(first, CreateOutcome::Created(_)));
    assert!(matches!(second, CreateOutcome::Duplicate(_)));
}

#[tokio::test]
async fn test_two_instances_race_for_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("revhook.db");
    let a = Arc::new(SqliteStore::new(&path).unwrap());
    let b = Arc::new(SqliteStore::new(&path).unwrap());
    let ttl = Duration::from_secs(60);

    let (got_a, got_b) = tokio::join!(
        a.try_acquire("retry-scheduler", "global", "instance-a", ttl),
        b.try_acquire("retry-scheduler", "global", "instance-b", ttl),
    );
    let winners = [got_a.unwrap(), got_b.unwrap()]
        .iter()
        .filter(|won| **won)
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_expired_lock_taken_over_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("revhook.db");
    let a = SqliteStore::new(&path).unwrap();
    let b = SqliteStore::new(&path).unwrap();

    assert!(a
        .try_acquire("retry-scheduler", "global", "a", Duration::from_secs(60))
        .await
        .unwrap());
    {
        // Pretend instance a crashed long ago.
        let conn = a.conn.lock().unwrap();
        conn.execute("UPDATE distributed_locks SET expires_at = 0", [])
            .unwrap();
    }
    assert!(b
        .try_acquire("retry-scheduler", "global", "b", Duration::from_secs(60))
        .await
        .unwrap());
    assert!(!a.release("retry-scheduler", "global", "a").await.unwrap());
}
