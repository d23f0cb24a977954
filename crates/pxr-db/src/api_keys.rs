//! Public API keys (hash-at-rest; the plaintext is shown once at creation).

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::entities::ApiKeyRow;

pub async fn create_api_key(
    pool: &SqlitePool,
    label: &str,
    key_hash: &str,
    now_iso: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO api_keys (label, key_hash, added_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(label)
    .bind(key_hash)
    .bind(now_iso)
    .fetch_one(pool)
    .await
    .context("create_api_key failed")?;
    Ok(id)
}

pub async fn list_api_keys(pool: &SqlitePool) -> Result<Vec<ApiKeyRow>> {
    let rows = sqlx::query_as::<_, ApiKeyRow>(
        "SELECT id, label, key_hash, enabled, added_at FROM api_keys ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await
    .context("list_api_keys failed")?;
    Ok(rows)
}

pub async fn delete_api_key(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("delete_api_key failed")?;
    Ok(result.rows_affected() == 1)
}

pub async fn api_key_hash_exists(pool: &SqlitePool, key_hash: &str) -> Result<bool> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM api_keys WHERE key_hash = ? AND enabled = 1 LIMIT 1")
            .bind(key_hash)
            .fetch_optional(pool)
            .await
            .context("api_key_hash_exists failed")?;
    Ok(row.is_some())
}
