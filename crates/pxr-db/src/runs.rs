//! Hydration run store: criteria-driven backfill state with a monotonically
//! advancing image-id cursor.

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::entities::HydrationRunRow;

const RUN_COLUMNS: &str = "id, type, status, criteria_json, cursor_json, total, processed, \
     success, failed, started_at, finished_at, last_error, added_at, updated_at";

/// Field-sets whose absence qualifies an image for a run. Unknown names are
/// ignored; an empty or missing list means all of them.
pub const MISSING_FIELD_SETS: &[&str] = &[
    "tags",
    "geometry",
    "r18",
    "ai",
    "illust_type",
    "user",
    "title",
    "created_at",
    "popularity",
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunCriteria {
    #[serde(default)]
    pub missing: Vec<String>,
}

/// Normalize criteria to the effective missing set.
pub fn missing_set_from_criteria(criteria: &RunCriteria) -> Vec<&'static str> {
    let wants_all = criteria.missing.is_empty()
        || criteria
            .missing
            .iter()
            .any(|m| matches!(m.trim(), "all" | "*"));

    let mut out: Vec<&'static str> = Vec::new();
    for known in MISSING_FIELD_SETS {
        let selected = wants_all
            || criteria
                .missing
                .iter()
                .any(|m| m.trim().eq_ignore_ascii_case(known));
        if selected {
            out.push(known);
        }
    }
    // Only unknown names selects nothing useful; fall back to everything.
    if out.is_empty() {
        out.extend_from_slice(MISSING_FIELD_SETS);
    }
    out
}

/// OR-predicate over the image row for the given missing set.
pub fn missing_predicate_sql(missing: &[&str]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for name in missing {
        match *name {
            "geometry" => parts.push(
                "(width IS NULL OR height IS NULL OR orientation IS NULL OR aspect_ratio IS NULL)",
            ),
            "r18" => parts.push("(x_restrict IS NULL)"),
            "ai" => parts.push("(ai_type IS NULL)"),
            "illust_type" => parts.push("(illust_type IS NULL)"),
            "user" => parts.push("(user_id IS NULL)"),
            "title" => parts.push("(title IS NULL)"),
            "created_at" => parts.push("(created_at_pixiv IS NULL)"),
            "tags" => parts
                .push("NOT EXISTS (SELECT 1 FROM image_tags it WHERE it.image_id = images.id)"),
            "popularity" => parts.push(
                "(bookmark_count IS NULL OR view_count IS NULL OR comment_count IS NULL)",
            ),
            _ => {}
        }
    }
    if parts.is_empty() {
        "(1=1)".to_string()
    } else {
        format!("({})", parts.join(" OR "))
    }
}

pub async fn create_run(
    pool: &SqlitePool,
    run_type: &str,
    criteria_json: &str,
    now_iso: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO hydration_runs (type, status, criteria_json, cursor_json, added_at, updated_at)
        VALUES (?, 'pending', ?, '{}', ?, ?)
        RETURNING id
        "#,
    )
    .bind(run_type)
    .bind(criteria_json)
    .bind(now_iso)
    .bind(now_iso)
    .fetch_one(pool)
    .await
    .context("create_run failed")?;
    Ok(id)
}

pub async fn get_run(pool: &SqlitePool, run_id: i64) -> Result<Option<HydrationRunRow>> {
    let row = sqlx::query_as::<_, HydrationRunRow>(&format!(
        "SELECT {RUN_COLUMNS} FROM hydration_runs WHERE id = ?"
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("get_run failed")?;
    Ok(row)
}

pub async fn list_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<HydrationRunRow>> {
    let rows = sqlx::query_as::<_, HydrationRunRow>(&format!(
        "SELECT {RUN_COLUMNS} FROM hydration_runs ORDER BY id DESC LIMIT ?"
    ))
    .bind(limit.clamp(1, 500))
    .fetch_all(pool)
    .await
    .context("list_runs failed")?;
    Ok(rows)
}

/// `pending|running → running`, stamping `started_at` on the first call.
pub async fn mark_run_running(pool: &SqlitePool, run_id: i64, now_iso: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE hydration_runs
        SET status = 'running', started_at = COALESCE(started_at, ?), last_error = NULL,
            updated_at = ?
        WHERE id = ? AND status IN ('pending', 'running')
        "#,
    )
    .bind(now_iso)
    .bind(now_iso)
    .bind(run_id)
    .execute(pool)
    .await
    .context("mark_run_running failed")?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn update_run_progress(
    pool: &SqlitePool,
    run_id: i64,
    cursor_json: &str,
    processed_inc: i64,
    success_inc: i64,
    failed_inc: i64,
    last_error: Option<&str>,
    now_iso: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE hydration_runs
        SET cursor_json = ?, processed = processed + ?, success = success + ?,
            failed = failed + ?, last_error = COALESCE(?, last_error), updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(cursor_json)
    .bind(processed_inc)
    .bind(success_inc)
    .bind(failed_inc)
    .bind(last_error)
    .bind(now_iso)
    .bind(run_id)
    .execute(pool)
    .await
    .context("update_run_progress failed")?;
    Ok(())
}

pub async fn mark_run_completed(pool: &SqlitePool, run_id: i64, now_iso: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE hydration_runs
        SET status = 'completed', finished_at = COALESCE(finished_at, ?), last_error = NULL,
            updated_at = ?
        WHERE id = ? AND status IN ('pending', 'running')
        "#,
    )
    .bind(now_iso)
    .bind(now_iso)
    .bind(run_id)
    .execute(pool)
    .await
    .context("mark_run_completed failed")?;
    Ok(())
}

/// Admin transition to `paused` / `canceled` / back to `pending` (resume).
pub async fn set_run_status(
    pool: &SqlitePool,
    run_id: i64,
    from: &[&str],
    to: &str,
    now_iso: &str,
) -> Result<bool> {
    let mut qb: sqlx::QueryBuilder<'_, sqlx::Sqlite> =
        sqlx::QueryBuilder::new("UPDATE hydration_runs SET status = ");
    qb.push_bind(to.to_string());
    qb.push(", updated_at = ").push_bind(now_iso.to_string());
    qb.push(" WHERE id = ").push_bind(run_id);
    qb.push(" AND status IN (");
    let mut sep = qb.separated(", ");
    for status in from {
        sep.push_bind(status.to_string());
    }
    qb.push(")");
    let result = qb.build().execute(pool).await.context("set_run_status failed")?;
    Ok(result.rows_affected() == 1)
}

/// Next enabled image past the cursor matching the missing predicate.
/// `predicate_sql` comes from [`missing_predicate_sql`] (trusted input).
pub async fn pick_next_candidate(
    pool: &SqlitePool,
    cursor_image_id: i64,
    predicate_sql: &str,
) -> Result<Option<(i64, i64)>> {
    let sql = format!(
        "SELECT id, illust_id FROM images \
         WHERE status = 1 AND id > ? AND {predicate_sql} \
         ORDER BY id ASC LIMIT 1"
    );
    let row: Option<(i64, i64)> = sqlx::query_as(&sql)
        .bind(cursor_image_id)
        .fetch_optional(pool)
        .await
        .context("pick_next_candidate failed")?;
    Ok(row)
}
