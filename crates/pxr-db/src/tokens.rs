//! Pixiv token store. Tokens carry an encrypted refresh token plus the
//! selection-relevant health fields (`error_count`, `backoff_until`).

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::entities::PixivTokenRow;

const TOKEN_COLUMNS: &str = "id, label, enabled, refresh_token_enc, refresh_token_masked, weight, \
     error_count, backoff_until, last_ok_at, last_fail_at, last_error_code, last_error_msg, \
     added_at, updated_at";

pub async fn list_tokens(pool: &SqlitePool) -> Result<Vec<PixivTokenRow>> {
    let rows = sqlx::query_as::<_, PixivTokenRow>(&format!(
        "SELECT {TOKEN_COLUMNS} FROM pixiv_tokens ORDER BY id ASC"
    ))
    .fetch_all(pool)
    .await
    .context("list_tokens failed")?;
    Ok(rows)
}

pub async fn get_token(pool: &SqlitePool, token_id: i64) -> Result<Option<PixivTokenRow>> {
    let row = sqlx::query_as::<_, PixivTokenRow>(&format!(
        "SELECT {TOKEN_COLUMNS} FROM pixiv_tokens WHERE id = ?"
    ))
    .bind(token_id)
    .fetch_optional(pool)
    .await
    .context("get_token failed")?;
    Ok(row)
}

/// Tokens that participate in proxy binding: enabled with positive weight,
/// ascending id (the rendezvous walk relies on this ordering).
pub async fn list_bindable_token_ids(pool: &SqlitePool) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM pixiv_tokens WHERE enabled = 1 AND weight > 0 ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await
    .context("list_bindable_token_ids failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn count_enabled_tokens(pool: &SqlitePool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pixiv_tokens WHERE enabled = 1")
        .fetch_one(pool)
        .await
        .context("count_enabled_tokens failed")?;
    Ok(n)
}

pub async fn insert_token(
    pool: &SqlitePool,
    label: Option<&str>,
    refresh_token_enc: &str,
    refresh_token_masked: &str,
    weight: i64,
    enabled: bool,
    now_iso: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO pixiv_tokens (label, enabled, refresh_token_enc, refresh_token_masked,
                                  weight, added_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(label)
    .bind(enabled)
    .bind(refresh_token_enc)
    .bind(refresh_token_masked)
    .bind(weight)
    .bind(now_iso)
    .bind(now_iso)
    .fetch_one(pool)
    .await
    .context("insert_token failed")?;
    Ok(id)
}

/// Admin update. `refresh_token_enc`/`_masked` travel together or not at all.
pub async fn update_token(
    pool: &SqlitePool,
    token_id: i64,
    label: Option<Option<&str>>,
    enabled: Option<bool>,
    weight: Option<i64>,
    refresh_token: Option<(&str, &str)>,
    now_iso: &str,
) -> Result<bool> {
    let mut qb: sqlx::QueryBuilder<'_, sqlx::Sqlite> =
        sqlx::QueryBuilder::new("UPDATE pixiv_tokens SET updated_at = ");
    qb.push_bind(now_iso);
    if let Some(label) = label {
        qb.push(", label = ").push_bind(label.map(str::to_string));
    }
    if let Some(enabled) = enabled {
        qb.push(", enabled = ").push_bind(enabled);
    }
    if let Some(weight) = weight {
        qb.push(", weight = ").push_bind(weight);
    }
    if let Some((enc, masked)) = refresh_token {
        qb.push(", refresh_token_enc = ")
            .push_bind(enc.to_string())
            .push(", refresh_token_masked = ")
            .push_bind(masked.to_string());
    }
    qb.push(" WHERE id = ").push_bind(token_id);
    let result = qb.build().execute(pool).await.context("update_token failed")?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete_token(pool: &SqlitePool, token_id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM pixiv_tokens WHERE id = ?")
        .bind(token_id)
        .execute(pool)
        .await
        .context("delete_token failed")?;
    Ok(result.rows_affected() == 1)
}

/// Success clears the whole failure trail: `error_count` back to zero,
/// backoff lifted.
pub async fn mark_token_ok(pool: &SqlitePool, token_id: i64, now_iso: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE pixiv_tokens
        SET error_count = 0, backoff_until = NULL, last_ok_at = ?, last_fail_at = NULL,
            last_error_code = NULL, last_error_msg = NULL, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(now_iso)
    .bind(now_iso)
    .bind(token_id)
    .execute(pool)
    .await
    .context("mark_token_ok failed")?;
    Ok(())
}

/// Record one classified failure: sets `error_count` to `attempt` and gates
/// selection until `backoff_until` (NULL for no gate).
#[allow(clippy::too_many_arguments)]
pub async fn mark_token_backoff(
    pool: &SqlitePool,
    token_id: i64,
    attempt: i64,
    backoff_until: Option<&str>,
    code: &str,
    message: &str,
    now_iso: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE pixiv_tokens
        SET error_count = ?, backoff_until = ?, last_fail_at = ?,
            last_error_code = ?, last_error_msg = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(attempt)
    .bind(backoff_until)
    .bind(now_iso)
    .bind(code)
    .bind(message)
    .bind(now_iso)
    .bind(token_id)
    .execute(pool)
    .await
    .context("mark_token_backoff failed")?;
    Ok(())
}

/// Persist a rotated refresh token (upstream handed back a new one).
pub async fn rotate_refresh_token(
    pool: &SqlitePool,
    token_id: i64,
    refresh_token_enc: &str,
    refresh_token_masked: &str,
    now_iso: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE pixiv_tokens
        SET refresh_token_enc = ?, refresh_token_masked = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(refresh_token_enc)
    .bind(refresh_token_masked)
    .bind(now_iso)
    .bind(token_id)
    .execute(pool)
    .await
    .context("rotate_refresh_token failed")?;
    Ok(())
}
