//! Token→proxy binding store. Primary assignments are derived state written
//! by the rendezvous recompute; override fields are observation- or
//! admin-authored and expire on their own TTL.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::entities::TokenProxyBindingRow;

const BINDING_COLUMNS: &str =
    "token_id, pool_id, primary_proxy_id, override_proxy_id, override_expires_at, updated_at";

pub async fn load_binding(
    pool: &SqlitePool,
    token_id: i64,
    pool_id: i64,
) -> Result<Option<TokenProxyBindingRow>> {
    let row = sqlx::query_as::<_, TokenProxyBindingRow>(&format!(
        "SELECT {BINDING_COLUMNS} FROM token_proxy_bindings WHERE token_id = ? AND pool_id = ?"
    ))
    .bind(token_id)
    .bind(pool_id)
    .fetch_optional(pool)
    .await
    .context("load_binding failed")?;
    Ok(row)
}

pub async fn list_bindings(pool: &SqlitePool, pool_id: Option<i64>) -> Result<Vec<TokenProxyBindingRow>> {
    let rows = match pool_id {
        Some(pool_id) => {
            sqlx::query_as::<_, TokenProxyBindingRow>(&format!(
                "SELECT {BINDING_COLUMNS} FROM token_proxy_bindings WHERE pool_id = ? \
                 ORDER BY token_id ASC"
            ))
            .bind(pool_id)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, TokenProxyBindingRow>(&format!(
                "SELECT {BINDING_COLUMNS} FROM token_proxy_bindings ORDER BY pool_id ASC, token_id ASC"
            ))
            .fetch_all(pool)
            .await
        }
    }
    .context("list_bindings failed")?;
    Ok(rows)
}

/// Recompute upsert: sets the primary and clears any override when the
/// primary moved (a stale override would pin the token to an endpoint the
/// recompute just steered it away from).
pub async fn upsert_binding_primary(
    pool: &SqlitePool,
    token_id: i64,
    pool_id: i64,
    primary_proxy_id: i64,
    now_iso: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO token_proxy_bindings
            (token_id, pool_id, primary_proxy_id, override_proxy_id, override_expires_at, updated_at)
        VALUES (?1, ?2, ?3, NULL, NULL, ?4)
        ON CONFLICT (token_id, pool_id) DO UPDATE SET
            override_proxy_id = CASE
                WHEN token_proxy_bindings.primary_proxy_id = excluded.primary_proxy_id
                THEN token_proxy_bindings.override_proxy_id ELSE NULL END,
            override_expires_at = CASE
                WHEN token_proxy_bindings.primary_proxy_id = excluded.primary_proxy_id
                THEN token_proxy_bindings.override_expires_at ELSE NULL END,
            primary_proxy_id = excluded.primary_proxy_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(token_id)
    .bind(pool_id)
    .bind(primary_proxy_id)
    .bind(now_iso)
    .execute(pool)
    .await
    .context("upsert_binding_primary failed")?;
    Ok(())
}

/// Sticky override: bias the next selections for this (token, pool) to a
/// known-good endpoint until `expires_at_iso`. Last writer wins.
pub async fn set_override(
    pool: &SqlitePool,
    token_id: i64,
    pool_id: i64,
    endpoint_id: i64,
    expires_at_iso: &str,
    now_iso: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE token_proxy_bindings
        SET override_proxy_id = ?, override_expires_at = ?, updated_at = ?
        WHERE token_id = ? AND pool_id = ?
        "#,
    )
    .bind(endpoint_id)
    .bind(expires_at_iso)
    .bind(now_iso)
    .bind(token_id)
    .bind(pool_id)
    .execute(pool)
    .await
    .context("set_override failed")?;
    Ok(result.rows_affected() == 1)
}

pub async fn clear_override(
    pool: &SqlitePool,
    token_id: i64,
    pool_id: i64,
    now_iso: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE token_proxy_bindings
        SET override_proxy_id = NULL, override_expires_at = NULL, updated_at = ?
        WHERE token_id = ? AND pool_id = ?
        "#,
    )
    .bind(now_iso)
    .bind(token_id)
    .bind(pool_id)
    .execute(pool)
    .await
    .context("clear_override failed")?;
    Ok(result.rows_affected() == 1)
}
