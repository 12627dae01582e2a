//! `review_jobs` table operations.

use chrono::{DateTime, Utc};
use revhook_core::{
    Author, ChangeStats, JobEventType, JobId, JobStatus, MergeRequestRef, NewJob, ReviewJob,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::super::CreateOutcome;
use crate::error::StoreError;

const JOB_COLUMNS: &str = "id, project_id, commit_hash, base_commit, event_type, branch, \
     author_name, author_email, author_avatar_url, author_profile_url, commit_message, \
     mr_number, mr_url, mr_target_branch, diff, files_changed, additions, deletions, \
     status, score, review_result, error_message, retry_count, created_at, updated_at";

/// A row as SQLite hands it back, before validation.
struct JobRow {
    id: i64,
    project_id: i64,
    commit_hash: String,
    base_commit: Option<String>,
    event_type: String,
    branch: String,
    author_name: String,
    author_email: Option<String>,
    author_avatar_url: Option<String>,
    author_profile_url: Option<String>,
    commit_message: String,
    mr_number: Option<i64>,
    mr_url: Option<String>,
    mr_target_branch: Option<String>,
    diff: Option<String>,
    files_changed: i64,
    additions: i64,
    deletions: i64,
    status: String,
    score: Option<f64>,
    review_result: Option<String>,
    error_message: Option<String>,
    retry_count: i64,
    created_at: i64,
    updated_at: i64,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        commit_hash: row.get(2)?,
        base_commit: row.get(3)?,
        event_type: row.get(4)?,
        branch: row.get(5)?,
        author_name: row.get(6)?,
        author_email: row.get(7)?,
        author_avatar_url: row.get(8)?,
        author_profile_url: row.get(9)?,
        commit_message: row.get(10)?,
        mr_number: row.get(11)?,
        mr_url: row.get(12)?,
        mr_target_branch: row.get(13)?,
        diff: row.get(14)?,
        files_changed: row.get(15)?,
        additions: row.get(16)?,
        deletions: row.get(17)?,
        status: row.get(18)?,
        score: row.get(19)?,
        review_result: row.get(20)?,
        error_message: row.get(21)?,
        retry_count: row.get(22)?,
        created_at: row.get(23)?,
        updated_at: row.get(24)?,
    })
}

fn counter(value: i64, column: &str, id: i64) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Corruption(format!("job {}: {} = {}", id, column, value)))
}

fn timestamp(millis: i64, column: &str, id: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corruption(format!("job {}: {} = {}", id, column, millis)))
}

impl JobRow {
    fn into_job(self) -> Result<ReviewJob, StoreError> {
        let id = self.id;
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|e| StoreError::Corruption(format!("job {}: {}", id, e)))?;
        let event_type: JobEventType = self
            .event_type
            .parse()
            .map_err(|e| StoreError::Corruption(format!("job {}: {}", id, e)))?;
        let merge_request = match self.mr_number {
            Some(number) => Some(MergeRequestRef {
                number: u64::try_from(number).map_err(|_| {
                    StoreError::Corruption(format!("job {}: mr_number = {}", id, number))
                })?,
                url: self.mr_url,
                target_branch: self.mr_target_branch,
            }),
            None => None,
        };

        Ok(ReviewJob {
            id: JobId(id),
            project_id: self.project_id,
            commit_hash: self.commit_hash,
            base_commit: self.base_commit,
            event_type,
            branch: self.branch,
            author: Author {
                name: self.author_name,
                email: self.author_email,
                avatar_url: self.author_avatar_url,
                profile_url: self.author_profile_url,
            },
            commit_message: self.commit_message,
            merge_request,
            diff: self.diff,
            stats: ChangeStats {
                files_changed: counter(self.files_changed, "files_changed", id)?,
                additions: counter(self.additions, "additions", id)?,
                deletions: counter(self.deletions, "deletions", id)?,
            },
            status,
            score: self.score,
            review_result: self.review_result,
            error_message: self.error_message,
            retry_count: counter(self.retry_count, "retry_count", id)?,
            created_at: timestamp(self.created_at, "created_at", id)?,
            updated_at: timestamp(self.updated_at, "updated_at", id)?,
        })
    }
}

fn mr_number(job_id: JobId, mr: Option<&MergeRequestRef>) -> Result<Option<i64>, StoreError> {
    mr.map(|mr| {
        i64::try_from(mr.number).map_err(|_| {
            StoreError::storage(
                "store merge request number",
                format!("job {}: {} exceeds i64", job_id, mr.number),
            )
        })
    })
    .transpose()
}

fn query_jobs(
    conn: &Connection,
    operation: &'static str,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ReviewJob>, StoreError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| StoreError::storage(operation, e))?;
    let rows = stmt
        .query_map(params, read_row)
        .map_err(|e| StoreError::storage(operation, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::storage(operation, e))?;
    rows.into_iter().map(JobRow::into_job).collect()
}

pub(super) fn create_unless_active_sync(
    conn: &mut Connection,
    new: NewJob,
    now: DateTime<Utc>,
) -> Result<CreateOutcome, StoreError> {
    // IMMEDIATE takes the write lock up front, so two instances cannot both
    // see "no active job" and both insert.
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| StoreError::storage("begin create job", e))?;

    if !new.commit_hash.is_empty() {
        let existing = tx
            .query_row(
                &format!(
                    "SELECT {} FROM review_jobs
                     WHERE project_id = ?1 AND commit_hash = ?2 AND status != 'failed'
                     ORDER BY id DESC LIMIT 1",
                    JOB_COLUMNS
                ),
                params![new.project_id, new.commit_hash],
                read_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("find active job", e))?;
        if let Some(row) = existing {
            return Ok(CreateOutcome::Duplicate(row.into_job()?));
        }
    }

    let now_ms = now.timestamp_millis();
    let mr = new.merge_request.as_ref();
    let mr_num = mr_number(JobId(0), mr)?;
    tx.execute(
        "INSERT INTO review_jobs (
            project_id, commit_hash, base_commit, event_type, branch,
            author_name, author_email, author_avatar_url, author_profile_url, commit_message,
            mr_number, mr_url, mr_target_branch, diff, files_changed, additions, deletions,
            status, retry_count, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                   'pending', 0, ?18, ?18)",
        params![
            new.project_id,
            new.commit_hash,
            new.base_commit,
            new.event_type.as_str(),
            new.branch,
            new.author.name,
            new.author.email,
            new.author.avatar_url,
            new.author.profile_url,
            new.commit_message,
            mr_num,
            mr.and_then(|m| m.url.as_deref()),
            mr.and_then(|m| m.target_branch.as_deref()),
            new.diff,
            new.stats.files_changed,
            new.stats.additions,
            new.stats.deletions,
            now_ms,
        ],
    )
    .map_err(|e| StoreError::storage("insert job", e))?;
    let id = JobId(tx.last_insert_rowid());

    tx.commit()
        .map_err(|e| StoreError::storage("commit create job", e))?;

    // Round-trip through millis so the returned job matches what a later
    // `get` will read.
    let now = timestamp(now_ms, "created_at", id.0)?;
    Ok(CreateOutcome::Created(ReviewJob::from_new(id, new, now)))
}

pub(super) fn get_sync(conn: &mut Connection, id: JobId) -> Result<Option<ReviewJob>, StoreError> {
    conn.query_row(
        &format!("SELECT {} FROM review_jobs WHERE id = ?1", JOB_COLUMNS),
        params![id.0],
        read_row,
    )
    .optional()
    .map_err(|e| StoreError::storage("get job", e))?
    .map(JobRow::into_job)
    .transpose()
}

pub(super) fn update_sync(conn: &mut Connection, job: &ReviewJob) -> Result<(), StoreError> {
    let mr = job.merge_request.as_ref();
    let mr_num = mr_number(job.id, mr)?;
    let changed = conn
        .execute(
            "UPDATE review_jobs SET
                base_commit = ?2, branch = ?3, commit_message = ?4,
                mr_number = ?5, mr_url = ?6, mr_target_branch = ?7, diff = ?8,
                files_changed = ?9, additions = ?10, deletions = ?11,
                status = ?12, score = ?13, review_result = ?14, error_message = ?15,
                retry_count = ?16, updated_at = ?17
             WHERE id = ?1",
            params![
                job.id.0,
                job.base_commit,
                job.branch,
                job.commit_message,
                mr_num,
                mr.and_then(|m| m.url.as_deref()),
                mr.and_then(|m| m.target_branch.as_deref()),
                job.diff,
                job.stats.files_changed,
                job.stats.additions,
                job.stats.deletions,
                job.status.as_str(),
                job.score,
                job.review_result,
                job.error_message,
                job.retry_count,
                job.updated_at.timestamp_millis(),
            ],
        )
        .map_err(|e| StoreError::storage("update job", e))?;

    if changed == 0 {
        return Err(StoreError::NotFound(job.id.0));
    }
    Ok(())
}

pub(super) fn find_by_commit_sync(
    conn: &mut Connection,
    project_id: i64,
    commit_hash: &str,
) -> Result<Option<ReviewJob>, StoreError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM review_jobs WHERE project_id = ?1 AND commit_hash = ?2
             ORDER BY id DESC LIMIT 1",
            JOB_COLUMNS
        ),
        params![project_id, commit_hash],
        read_row,
    )
    .optional()
    .map_err(|e| StoreError::storage("find job by commit", e))?
    .map(JobRow::into_job)
    .transpose()
}

pub(super) fn list_by_status_sync(
    conn: &mut Connection,
    status: JobStatus,
    limit: i64,
) -> Result<Vec<ReviewJob>, StoreError> {
    query_jobs(
        conn,
        "list jobs by status",
        &format!(
            "SELECT {} FROM review_jobs WHERE status = ?1
             ORDER BY created_at ASC, id ASC LIMIT ?2",
            JOB_COLUMNS
        ),
        params![status.as_str(), limit],
    )
}

pub(super) fn list_retryable_sync(
    conn: &mut Connection,
    max_attempts: u32,
    limit: i64,
) -> Result<Vec<ReviewJob>, StoreError> {
    query_jobs(
        conn,
        "list retryable jobs",
        &format!(
            "SELECT {} FROM review_jobs j
             WHERE j.status = 'failed' AND j.retry_count < ?1
               AND (j.commit_hash = '' OR NOT EXISTS (
                   SELECT 1 FROM review_jobs n
                   WHERE n.project_id = j.project_id
                     AND n.commit_hash = j.commit_hash
                     AND n.id > j.id))
             ORDER BY j.created_at ASC, j.id ASC LIMIT ?2",
            JOB_COLUMNS
        ),
        params![max_attempts, limit],
    )
}

pub(super) fn list_stale_sync(
    conn: &mut Connection,
    cutoff_ms: i64,
    limit: i64,
) -> Result<Vec<ReviewJob>, StoreError> {
    query_jobs(
        conn,
        "list stale jobs",
        &format!(
            "SELECT {} FROM review_jobs
             WHERE status IN ('pending', 'analyzing') AND updated_at < ?1
             ORDER BY updated_at ASC, id ASC LIMIT ?2",
            JOB_COLUMNS
        ),
        params![cutoff_ms, limit],
    )
}
