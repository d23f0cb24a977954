//! Durable job store: the atomic claim, lease sweep, and every status
//! transition of the job state machine.
//!
//! At-most-one-running-per-job comes from the claim UPDATE's `status='pending'`
//! guard; at-least-once execution comes from the lease sweep returning stale
//! `running` rows to `pending` with their attempt preserved.

use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::entities::JobRow;

const JOB_COLUMNS: &str = "id, type, status, priority, run_after, attempt, max_attempts, \
     payload_json, last_error, locked_by, locked_at, ref_type, ref_id, added_at, updated_at";

pub const DEFAULT_LOCK_TTL_S: i64 = 60;
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

/// Priority used by opportunistic hydrations so they pre-empt backfill.
pub const OPPORTUNISTIC_PRIORITY: i64 = -10;

#[derive(Debug, Clone, Default)]
pub struct NewJob<'a> {
    pub job_type: &'a str,
    pub payload_json: &'a str,
    pub priority: i64,
    pub run_after: Option<&'a str>,
    pub max_attempts: Option<i64>,
    pub ref_type: Option<&'a str>,
    pub ref_id: Option<&'a str>,
}

pub async fn enqueue_job(pool: &SqlitePool, job: &NewJob<'_>, now_iso: &str) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO jobs (type, status, priority, run_after, max_attempts, payload_json,
                          ref_type, ref_id, added_at, updated_at)
        VALUES (?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(job.job_type)
    .bind(job.priority)
    .bind(job.run_after)
    .bind(job.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS))
    .bind(job.payload_json)
    .bind(job.ref_type)
    .bind(job.ref_id)
    .bind(now_iso)
    .bind(now_iso)
    .fetch_one(pool)
    .await
    .context("enqueue_job failed")?;
    Ok(id)
}

/// Conditional enqueue keyed on `(type, ref_type, ref_id)`: a no-op while a
/// pending or running job with the same reference exists. Select-then-insert
/// inside one writer transaction; the single-writer store makes it atomic.
pub async fn enqueue_job_unique_ref(
    pool: &SqlitePool,
    job: &NewJob<'_>,
    now_iso: &str,
) -> Result<Option<i64>> {
    let ref_type = job.ref_type.unwrap_or_default();
    let ref_id = job.ref_id.unwrap_or_default();

    let mut tx = pool.begin().await.context("enqueue_job_unique_ref begin failed")?;

    let existing: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT id FROM jobs
        WHERE type = ? AND ref_type = ? AND ref_id = ?
          AND status IN ('pending', 'running')
        LIMIT 1
        "#,
    )
    .bind(job.job_type)
    .bind(ref_type)
    .bind(ref_id)
    .fetch_optional(&mut *tx)
    .await
    .context("enqueue_job_unique_ref select failed")?;

    if existing.is_some() {
        tx.rollback().await.ok();
        return Ok(None);
    }

    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO jobs (type, status, priority, run_after, max_attempts, payload_json,
                          ref_type, ref_id, added_at, updated_at)
        VALUES (?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(job.job_type)
    .bind(job.priority)
    .bind(job.run_after)
    .bind(job.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS))
    .bind(job.payload_json)
    .bind(ref_type)
    .bind(ref_id)
    .bind(now_iso)
    .bind(now_iso)
    .fetch_one(&mut *tx)
    .await
    .context("enqueue_job_unique_ref insert failed")?;

    tx.commit().await.context("enqueue_job_unique_ref commit failed")?;
    Ok(Some(id))
}

/// Promote `failed` jobs whose `run_after` has passed back to `pending`.
/// Runs ahead of the claim each scheduler tick.
pub async fn promote_due_failed(pool: &SqlitePool, now_iso: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'pending', updated_at = ?
        WHERE status = 'failed' AND run_after IS NOT NULL AND run_after <= ?
        "#,
    )
    .bind(now_iso)
    .bind(now_iso)
    .execute(pool)
    .await
    .context("promote_due_failed failed")?;
    Ok(result.rows_affected())
}

/// Return `running` jobs whose lease expired before `cutoff_iso` to
/// `pending`. Attempt is preserved; the job will be re-claimed.
pub async fn sweep_stale_leases(pool: &SqlitePool, cutoff_iso: &str, now_iso: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'pending', locked_by = NULL, locked_at = NULL, updated_at = ?
        WHERE status = 'running' AND locked_at IS NOT NULL AND locked_at < ?
        "#,
    )
    .bind(now_iso)
    .bind(cutoff_iso)
    .execute(pool)
    .await
    .context("sweep_stale_leases failed")?;
    Ok(result.rows_affected())
}

/// Atomically claim the next eligible job for `worker_id`.
///
/// Eligibility: `pending` with no future `run_after`; order: priority then id
/// (smaller first). The conditional UPDATE is the classic atomic claim: the
/// inner select and the `status='pending'` guard flip exactly one row per
/// call, so two workers can never claim the same job.
pub async fn claim_next_job(
    pool: &SqlitePool,
    worker_id: &str,
    now_iso: &str,
) -> Result<Option<JobRow>> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        UPDATE jobs
        SET status = 'running', locked_by = ?1, locked_at = ?2, updated_at = ?2
        WHERE id = (
            SELECT id FROM jobs
            WHERE status = 'pending' AND (run_after IS NULL OR run_after <= ?2)
            ORDER BY priority ASC, id ASC
            LIMIT 1
        ) AND status = 'pending'
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(worker_id)
    .bind(now_iso)
    .fetch_optional(pool)
    .await
    .context("claim_next_job failed")?;
    Ok(row)
}

/// `running → completed`, conditional on still holding the lease.
pub async fn complete_job(
    pool: &SqlitePool,
    job_id: i64,
    worker_id: &str,
    now_iso: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'completed', last_error = NULL, locked_by = NULL, locked_at = NULL,
            updated_at = ?
        WHERE id = ? AND status = 'running' AND locked_by = ?
        "#,
    )
    .bind(now_iso)
    .bind(job_id)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("complete_job failed")?;
    Ok(result.rows_affected() == 1)
}

/// `running → failed` with the incremented attempt and a retry time.
pub async fn fail_job_recoverable(
    pool: &SqlitePool,
    job_id: i64,
    worker_id: &str,
    attempt: i64,
    run_after_iso: &str,
    error: &str,
    now_iso: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed', attempt = ?, run_after = ?, last_error = ?,
            locked_by = NULL, locked_at = NULL, updated_at = ?
        WHERE id = ? AND status = 'running' AND locked_by = ?
        "#,
    )
    .bind(attempt)
    .bind(run_after_iso)
    .bind(error)
    .bind(now_iso)
    .bind(job_id)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("fail_job_recoverable failed")?;
    Ok(result.rows_affected() == 1)
}

/// `running → dlq` for permanent errors and exhausted attempts.
pub async fn fail_job_dlq(
    pool: &SqlitePool,
    job_id: i64,
    worker_id: &str,
    attempt: i64,
    error: &str,
    now_iso: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'dlq', attempt = ?, run_after = NULL, last_error = ?,
            locked_by = NULL, locked_at = NULL, updated_at = ?
        WHERE id = ? AND status = 'running' AND locked_by = ?
        "#,
    )
    .bind(attempt)
    .bind(error)
    .bind(now_iso)
    .bind(job_id)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("fail_job_dlq failed")?;
    Ok(result.rows_affected() == 1)
}

/// Defer: release the lease without consuming an attempt. Target status is
/// `pending` (re-queue, e.g. run batches) or `failed` (scheduler picks it up
/// once `run_after` passes).
pub async fn release_job_lock(
    pool: &SqlitePool,
    job_id: i64,
    worker_id: &str,
    status: &str,
    run_after_iso: Option<&str>,
    last_error: Option<&str>,
    now_iso: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = ?, run_after = ?, last_error = ?, locked_by = NULL, locked_at = NULL,
            updated_at = ?
        WHERE id = ? AND status = 'running' AND locked_by = ?
        "#,
    )
    .bind(status)
    .bind(run_after_iso)
    .bind(last_error)
    .bind(now_iso)
    .bind(job_id)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("release_job_lock failed")?;
    Ok(result.rows_affected() == 1)
}

/// Admin retry: any terminal/parked status back to `pending` with the attempt
/// counter preserved and `run_after` cleared.
pub async fn retry_job(pool: &SqlitePool, job_id: i64, now_iso: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'pending', run_after = NULL, locked_by = NULL, locked_at = NULL,
            updated_at = ?
        WHERE id = ? AND status IN ('completed', 'failed', 'dlq', 'canceled')
        "#,
    )
    .bind(now_iso)
    .bind(job_id)
    .execute(pool)
    .await
    .context("retry_job failed")?;
    Ok(result.rows_affected() == 1)
}

pub async fn cancel_job(pool: &SqlitePool, job_id: i64, now_iso: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'canceled', locked_by = NULL, locked_at = NULL, updated_at = ?
        WHERE id = ? AND status IN ('pending', 'running', 'paused')
        "#,
    )
    .bind(now_iso)
    .bind(job_id)
    .execute(pool)
    .await
    .context("cancel_job failed")?;
    Ok(result.rows_affected() == 1)
}

pub async fn get_job(pool: &SqlitePool, job_id: i64) -> Result<Option<JobRow>> {
    let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .context("get_job failed")?;
    Ok(row)
}

pub async fn list_jobs(
    pool: &SqlitePool,
    status: Option<&str>,
    job_type: Option<&str>,
    limit: i64,
) -> Result<Vec<JobRow>> {
    let mut qb: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1=1"));
    if let Some(status) = status {
        qb.push(" AND status = ").push_bind(status.to_string());
    }
    if let Some(job_type) = job_type {
        qb.push(" AND type = ").push_bind(job_type.to_string());
    }
    qb.push(" ORDER BY id DESC LIMIT ").push_bind(limit.clamp(1, 500));
    let rows = qb
        .build_query_as()
        .fetch_all(pool)
        .await
        .context("list_jobs failed")?;
    Ok(rows)
}

/// Existing `ref_id`s for a (type, ref_type) with the given prefix; used by
/// the import handler to avoid re-enqueueing per-illust hydrations.
pub async fn list_ref_ids_with_prefix(
    pool: &SqlitePool,
    job_type: &str,
    ref_type: &str,
    ref_id_prefix: &str,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT ref_id FROM jobs
        WHERE type = ? AND ref_type = ? AND ref_id LIKE ?
        "#,
    )
    .bind(job_type)
    .bind(ref_type)
    .bind(format!("{ref_id_prefix}%"))
    .fetch_all(pool)
    .await
    .context("list_ref_ids_with_prefix failed")?;
    Ok(rows.into_iter().map(|(r,)| r).collect())
}

pub async fn count_jobs_by_status(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .fetch_all(pool)
            .await
            .context("count_jobs_by_status failed")?;
    Ok(rows)
}
