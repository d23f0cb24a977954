//! Proxy pool / endpoint store: membership-joined candidate queries for the
//! selector, health accounting for the circuit breaker, and admin CRUD.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::entities::{PoolMemberRow, ProxyEndpointRow, ProxyPoolRow};

const ENDPOINT_COLUMNS: &str = "id, scheme, host, port, username, password_enc, enabled, source, \
     source_ref, last_latency_ms, last_ok_at, last_fail_at, blacklisted_until, success_count, \
     failure_count, last_error, added_at, updated_at";

// ---------------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------------

pub async fn create_pool(
    pool: &SqlitePool,
    name: &str,
    description: Option<&str>,
    now_iso: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO proxy_pools (name, description, added_at, updated_at) \
         VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(description)
    .bind(now_iso)
    .bind(now_iso)
    .fetch_one(pool)
    .await
    .context("create_pool failed")?;
    Ok(id)
}

pub async fn list_pools(pool: &SqlitePool) -> Result<Vec<ProxyPoolRow>> {
    let rows = sqlx::query_as::<_, ProxyPoolRow>(
        "SELECT id, name, enabled, description, added_at, updated_at \
         FROM proxy_pools ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await
    .context("list_pools failed")?;
    Ok(rows)
}

pub async fn update_pool(
    pool: &SqlitePool,
    pool_id: i64,
    enabled: Option<bool>,
    description: Option<Option<&str>>,
    now_iso: &str,
) -> Result<bool> {
    let mut qb: sqlx::QueryBuilder<'_, sqlx::Sqlite> =
        sqlx::QueryBuilder::new("UPDATE proxy_pools SET updated_at = ");
    qb.push_bind(now_iso);
    if let Some(enabled) = enabled {
        qb.push(", enabled = ").push_bind(enabled);
    }
    if let Some(description) = description {
        qb.push(", description = ")
            .push_bind(description.map(str::to_string));
    }
    qb.push(" WHERE id = ").push_bind(pool_id);
    let result = qb.build().execute(pool).await.context("update_pool failed")?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete_pool(pool: &SqlitePool, pool_id: i64) -> Result<bool> {
    sqlx::query("DELETE FROM proxy_pool_endpoints WHERE pool_id = ?")
        .bind(pool_id)
        .execute(pool)
        .await
        .context("delete_pool memberships failed")?;
    sqlx::query("DELETE FROM token_proxy_bindings WHERE pool_id = ?")
        .bind(pool_id)
        .execute(pool)
        .await
        .context("delete_pool bindings failed")?;
    let result = sqlx::query("DELETE FROM proxy_pools WHERE id = ?")
        .bind(pool_id)
        .execute(pool)
        .await
        .context("delete_pool failed")?;
    Ok(result.rows_affected() == 1)
}

/// Enabled pool ids, ascending. Ordering matters: the selector walks pools in
/// this order after the preferred pool.
pub async fn list_enabled_pool_ids(pool: &SqlitePool) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT id FROM proxy_pools WHERE enabled = 1 ORDER BY id ASC")
            .fetch_all(pool)
            .await
            .context("list_enabled_pool_ids failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub async fn create_endpoint(
    pool: &SqlitePool,
    scheme: &str,
    host: &str,
    port: i64,
    username: &str,
    password_enc: &str,
    source: &str,
    source_ref: Option<&str>,
    now_iso: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO proxy_endpoints (scheme, host, port, username, password_enc, source,
                                     source_ref, added_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(scheme)
    .bind(host)
    .bind(port)
    .bind(username)
    .bind(password_enc)
    .bind(source)
    .bind(source_ref)
    .bind(now_iso)
    .bind(now_iso)
    .fetch_one(pool)
    .await
    .context("create_endpoint failed")?;
    Ok(id)
}

pub async fn list_endpoints(pool: &SqlitePool) -> Result<Vec<ProxyEndpointRow>> {
    let rows = sqlx::query_as::<_, ProxyEndpointRow>(&format!(
        "SELECT {ENDPOINT_COLUMNS} FROM proxy_endpoints ORDER BY id ASC"
    ))
    .fetch_all(pool)
    .await
    .context("list_endpoints failed")?;
    Ok(rows)
}

pub async fn list_enabled_endpoints(pool: &SqlitePool) -> Result<Vec<ProxyEndpointRow>> {
    let rows = sqlx::query_as::<_, ProxyEndpointRow>(&format!(
        "SELECT {ENDPOINT_COLUMNS} FROM proxy_endpoints WHERE enabled = 1 ORDER BY id ASC"
    ))
    .fetch_all(pool)
    .await
    .context("list_enabled_endpoints failed")?;
    Ok(rows)
}

pub async fn get_endpoint(pool: &SqlitePool, endpoint_id: i64) -> Result<Option<ProxyEndpointRow>> {
    let row = sqlx::query_as::<_, ProxyEndpointRow>(&format!(
        "SELECT {ENDPOINT_COLUMNS} FROM proxy_endpoints WHERE id = ?"
    ))
    .bind(endpoint_id)
    .fetch_optional(pool)
    .await
    .context("get_endpoint failed")?;
    Ok(row)
}

pub async fn update_endpoint_enabled(
    pool: &SqlitePool,
    endpoint_id: i64,
    enabled: bool,
    now_iso: &str,
) -> Result<bool> {
    let result = sqlx::query("UPDATE proxy_endpoints SET enabled = ?, updated_at = ? WHERE id = ?")
        .bind(enabled)
        .bind(now_iso)
        .bind(endpoint_id)
        .execute(pool)
        .await
        .context("update_endpoint_enabled failed")?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete_endpoint(pool: &SqlitePool, endpoint_id: i64) -> Result<bool> {
    sqlx::query("DELETE FROM proxy_pool_endpoints WHERE endpoint_id = ?")
        .bind(endpoint_id)
        .execute(pool)
        .await
        .context("delete_endpoint memberships failed")?;
    let result = sqlx::query("DELETE FROM proxy_endpoints WHERE id = ?")
        .bind(endpoint_id)
        .execute(pool)
        .await
        .context("delete_endpoint failed")?;
    Ok(result.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Pool membership
// ---------------------------------------------------------------------------

pub async fn attach_endpoint(
    pool: &SqlitePool,
    pool_id: i64,
    endpoint_id: i64,
    weight: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO proxy_pool_endpoints (pool_id, endpoint_id, enabled, weight)
        VALUES (?, ?, 1, ?)
        ON CONFLICT (pool_id, endpoint_id) DO UPDATE SET enabled = 1, weight = excluded.weight
        "#,
    )
    .bind(pool_id)
    .bind(endpoint_id)
    .bind(weight)
    .execute(pool)
    .await
    .context("attach_endpoint failed")?;
    Ok(())
}

pub async fn detach_endpoint(pool: &SqlitePool, pool_id: i64, endpoint_id: i64) -> Result<bool> {
    let result =
        sqlx::query("DELETE FROM proxy_pool_endpoints WHERE pool_id = ? AND endpoint_id = ?")
            .bind(pool_id)
            .bind(endpoint_id)
            .execute(pool)
            .await
            .context("detach_endpoint failed")?;
    Ok(result.rows_affected() == 1)
}

pub async fn list_pool_members(pool: &SqlitePool, pool_id: i64) -> Result<Vec<PoolMemberRow>> {
    let rows = sqlx::query_as::<_, PoolMemberRow>(
        "SELECT pool_id, endpoint_id, enabled, weight FROM proxy_pool_endpoints \
         WHERE pool_id = ? ORDER BY endpoint_id ASC",
    )
    .bind(pool_id)
    .fetch_all(pool)
    .await
    .context("list_pool_members failed")?;
    Ok(rows)
}

/// Enabled members of an enabled pool with their membership weight, ascending
/// endpoint id (the rendezvous walk relies on this ordering).
pub async fn list_weighted_members(
    pool: &SqlitePool,
    pool_id: i64,
) -> Result<Vec<(i64, i64)>> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT ppe.endpoint_id, ppe.weight
        FROM proxy_pool_endpoints ppe
        JOIN proxy_endpoints pe ON pe.id = ppe.endpoint_id AND pe.enabled = 1
        WHERE ppe.pool_id = ? AND ppe.enabled = 1
        ORDER BY ppe.endpoint_id ASC
        "#,
    )
    .bind(pool_id)
    .fetch_all(pool)
    .await
    .context("list_weighted_members failed")?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Selection queries
// ---------------------------------------------------------------------------

/// A selectable endpoint within a pool: connection fields plus the health
/// markers the selector partitions on.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CandidateEndpoint {
    pub id: i64,
    pub scheme: String,
    pub host: String,
    pub port: i64,
    pub username: String,
    pub password_enc: String,
    pub weight: i64,
    pub last_ok_at: Option<String>,
    pub last_fail_at: Option<String>,
}

/// All eligible (enabled, un-blacklisted) endpoints of an enabled pool.
pub async fn eligible_endpoints_in_pool(
    pool: &SqlitePool,
    pool_id: i64,
    now_iso: &str,
) -> Result<Vec<CandidateEndpoint>> {
    let rows = sqlx::query_as::<_, CandidateEndpoint>(
        r#"
        SELECT pe.id, pe.scheme, pe.host, pe.port, pe.username, pe.password_enc,
               ppe.weight, pe.last_ok_at, pe.last_fail_at
        FROM proxy_pools pp
        JOIN proxy_pool_endpoints ppe ON ppe.pool_id = pp.id AND ppe.enabled = 1
        JOIN proxy_endpoints pe ON pe.id = ppe.endpoint_id AND pe.enabled = 1
        WHERE pp.id = ? AND pp.enabled = 1
          AND (pe.blacklisted_until IS NULL OR pe.blacklisted_until <= ?)
        ORDER BY pe.id ASC
        "#,
    )
    .bind(pool_id)
    .bind(now_iso)
    .fetch_all(pool)
    .await
    .context("eligible_endpoints_in_pool failed")?;
    Ok(rows)
}

/// One specific endpoint, but only if it is currently eligible in the pool.
pub async fn load_eligible_endpoint(
    pool: &SqlitePool,
    pool_id: i64,
    endpoint_id: i64,
    now_iso: &str,
) -> Result<Option<CandidateEndpoint>> {
    let row = sqlx::query_as::<_, CandidateEndpoint>(
        r#"
        SELECT pe.id, pe.scheme, pe.host, pe.port, pe.username, pe.password_enc,
               ppe.weight, pe.last_ok_at, pe.last_fail_at
        FROM proxy_pools pp
        JOIN proxy_pool_endpoints ppe ON ppe.pool_id = pp.id AND ppe.enabled = 1
        JOIN proxy_endpoints pe ON pe.id = ppe.endpoint_id AND pe.enabled = 1
        WHERE pp.id = ? AND pp.enabled = 1 AND pe.id = ?
          AND (pe.blacklisted_until IS NULL OR pe.blacklisted_until <= ?)
        LIMIT 1
        "#,
    )
    .bind(pool_id)
    .bind(endpoint_id)
    .bind(now_iso)
    .fetch_optional(pool)
    .await
    .context("load_eligible_endpoint failed")?;
    Ok(row)
}

/// Fail-closed diagnostics for one pool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolHealthStats {
    pub pool_id: i64,
    pub endpoints_total: i64,
    pub endpoints_eligible: i64,
    pub next_available_at: Option<String>,
}

pub async fn pool_health_stats(
    pool: &SqlitePool,
    pool_id: i64,
    now_iso: &str,
) -> Result<PoolHealthStats> {
    let row: Option<(i64, i64, Option<String>)> = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COALESCE(SUM(CASE WHEN pe.blacklisted_until IS NULL
                                   OR pe.blacklisted_until <= ? THEN 1 ELSE 0 END), 0),
               MIN(CASE WHEN pe.blacklisted_until > ? THEN pe.blacklisted_until ELSE NULL END)
        FROM proxy_pools pp
        JOIN proxy_pool_endpoints ppe ON ppe.pool_id = pp.id AND ppe.enabled = 1
        JOIN proxy_endpoints pe ON pe.id = ppe.endpoint_id AND pe.enabled = 1
        WHERE pp.id = ? AND pp.enabled = 1
        "#,
    )
    .bind(now_iso)
    .bind(now_iso)
    .bind(pool_id)
    .fetch_optional(pool)
    .await
    .context("pool_health_stats failed")?;

    let (total, eligible, next_available_at) = row.unwrap_or((0, 0, None));
    Ok(PoolHealthStats {
        pool_id,
        endpoints_total: total.max(0),
        endpoints_eligible: eligible.max(0),
        next_available_at: next_available_at.filter(|s| !s.trim().is_empty()),
    })
}

// ---------------------------------------------------------------------------
// Health accounting (circuit breaker writes)
// ---------------------------------------------------------------------------

/// Success: bump the counter, stamp `last_ok_at`, clear error + blacklist.
pub async fn mark_endpoint_ok(
    pool: &SqlitePool,
    endpoint_id: i64,
    latency_ms: Option<f64>,
    now_iso: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE proxy_endpoints
        SET last_latency_ms = ?, last_ok_at = ?, success_count = success_count + 1,
            last_error = NULL, blacklisted_until = NULL, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(latency_ms)
    .bind(now_iso)
    .bind(now_iso)
    .bind(endpoint_id)
    .execute(pool)
    .await
    .context("mark_endpoint_ok failed")?;
    Ok(())
}

/// Failure: bump the counter and extend (never shorten) the blacklist window
/// to `blacklist_until_iso` when given.
pub async fn mark_endpoint_fail(
    pool: &SqlitePool,
    endpoint_id: i64,
    latency_ms: Option<f64>,
    blacklist_until_iso: Option<&str>,
    error: &str,
    now_iso: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE proxy_endpoints
        SET last_latency_ms = ?1, last_fail_at = ?2, failure_count = failure_count + 1,
            blacklisted_until = CASE
                WHEN ?3 IS NULL THEN blacklisted_until
                WHEN blacklisted_until IS NOT NULL AND blacklisted_until > ?3 THEN blacklisted_until
                ELSE ?3
            END,
            last_error = ?4, updated_at = ?2
        WHERE id = ?5
        "#,
    )
    .bind(latency_ms)
    .bind(now_iso)
    .bind(blacklist_until_iso)
    .bind(error)
    .bind(endpoint_id)
    .execute(pool)
    .await
    .context("mark_endpoint_fail failed")?;
    Ok(())
}

/// Probe failure: blacklist only once the consecutive failure count reaches
/// `threshold`.
pub async fn mark_endpoint_fail_threshold(
    pool: &SqlitePool,
    endpoint_id: i64,
    latency_ms: Option<f64>,
    blacklist_until_iso: &str,
    threshold: i64,
    error: &str,
    now_iso: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE proxy_endpoints
        SET last_latency_ms = ?1, last_fail_at = ?2, failure_count = failure_count + 1,
            blacklisted_until = CASE
                WHEN (failure_count + 1) >= ?3 THEN ?4
                ELSE blacklisted_until
            END,
            last_error = ?5, updated_at = ?2
        WHERE id = ?6
        "#,
    )
    .bind(latency_ms)
    .bind(now_iso)
    .bind(threshold)
    .bind(blacklist_until_iso)
    .bind(error)
    .bind(endpoint_id)
    .execute(pool)
    .await
    .context("mark_endpoint_fail_threshold failed")?;
    Ok(())
}
