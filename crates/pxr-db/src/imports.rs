//! Import bookkeeping. Counters only move up (`MAX(existing, new)`) so a
//! re-run of a partially-complete import never regresses them.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::entities::ImportRow;

const IMPORT_COLUMNS: &str =
    "id, created_by, source, total, accepted, success, failed, detail_json, added_at";

pub async fn create_import(
    pool: &SqlitePool,
    created_by: &str,
    source: &str,
    now_iso: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO imports (created_by, source, added_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(created_by)
    .bind(source)
    .bind(now_iso)
    .fetch_one(pool)
    .await
    .context("create_import failed")?;
    Ok(id)
}

pub async fn get_import(pool: &SqlitePool, import_id: i64) -> Result<Option<ImportRow>> {
    let row = sqlx::query_as::<_, ImportRow>(&format!(
        "SELECT {IMPORT_COLUMNS} FROM imports WHERE id = ?"
    ))
    .bind(import_id)
    .fetch_optional(pool)
    .await
    .context("get_import failed")?;
    Ok(row)
}

pub async fn list_imports(pool: &SqlitePool, limit: i64) -> Result<Vec<ImportRow>> {
    let rows = sqlx::query_as::<_, ImportRow>(&format!(
        "SELECT {IMPORT_COLUMNS} FROM imports ORDER BY id DESC LIMIT ?"
    ))
    .bind(limit.clamp(1, 500))
    .fetch_all(pool)
    .await
    .context("list_imports failed")?;
    Ok(rows)
}

/// Monotonic counter update.
pub async fn update_import_counters(
    pool: &SqlitePool,
    import_id: i64,
    total: i64,
    accepted: i64,
    success: i64,
    failed: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE imports
        SET total = MAX(total, ?), accepted = MAX(accepted, ?),
            success = MAX(success, ?), failed = MAX(failed, ?)
        WHERE id = ?
        "#,
    )
    .bind(total)
    .bind(accepted)
    .bind(success)
    .bind(failed)
    .bind(import_id)
    .execute(pool)
    .await
    .context("update_import_counters failed")?;
    Ok(())
}

pub async fn set_import_detail(pool: &SqlitePool, import_id: i64, detail_json: &str) -> Result<()> {
    sqlx::query("UPDATE imports SET detail_json = ? WHERE id = ?")
        .bind(detail_json)
        .bind(import_id)
        .execute(pool)
        .await
        .context("set_import_detail failed")?;
    Ok(())
}
