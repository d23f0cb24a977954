//! Circuit-breaker accounting around proxy endpoints, plus the sticky
//! override written after a successful call.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use pxr_types::iso_utc_ms;

/// TTLs for blacklist and override windows. Hydration uses a shorter
/// blacklist than the probe path so one flaky fetch does not bench an
/// endpoint for half an hour.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub blacklist_ttl_s: i64,
    pub override_ttl_s: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            blacklist_ttl_s: 30 * 60,
            override_ttl_s: 30 * 60,
        }
    }
}

impl BreakerConfig {
    pub fn hydrate_default() -> Self {
        Self {
            blacklist_ttl_s: 5 * 60,
            ..Default::default()
        }
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut cut = max_len.saturating_sub(3);
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

/// Success observation: clears error + blacklist, bumps the counter.
pub async fn mark_ok(
    pool: &SqlitePool,
    endpoint_id: i64,
    latency_ms: Option<f64>,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    if endpoint_id <= 0 {
        return Ok(());
    }
    pxr_db::proxies::mark_endpoint_ok(pool, endpoint_id, latency_ms, &iso_utc_ms(now)).await
}

/// Failure observation: records the (pre-redacted) error and extends the
/// blacklist window by the configured TTL, never shortening an existing one.
pub async fn mark_fail(
    pool: &SqlitePool,
    config: &BreakerConfig,
    endpoint_id: i64,
    latency_ms: Option<f64>,
    error: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    if endpoint_id <= 0 {
        return Ok(());
    }
    let blacklist_until = if config.blacklist_ttl_s > 0 {
        Some(iso_utc_ms(now + Duration::seconds(config.blacklist_ttl_s)))
    } else {
        None
    };
    pxr_db::proxies::mark_endpoint_fail(
        pool,
        endpoint_id,
        latency_ms,
        blacklist_until.as_deref(),
        &truncate(error, 500),
        &iso_utc_ms(now),
    )
    .await
}

/// Sticky override after a success through `endpoint_id` for `(token, pool)`:
/// bias subsequent calls to the known-good endpoint for the override TTL.
pub async fn set_sticky_override(
    pool: &SqlitePool,
    config: &BreakerConfig,
    token_id: i64,
    pool_id: i64,
    endpoint_id: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    if config.override_ttl_s <= 0 || token_id <= 0 || pool_id <= 0 || endpoint_id <= 0 {
        return Ok(());
    }
    let expires_at = iso_utc_ms(now + Duration::seconds(config.override_ttl_s));
    pxr_db::bindings::set_override(
        pool,
        token_id,
        pool_id,
        endpoint_id,
        &expires_at,
        &iso_utc_ms(now),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::truncate;

    #[test]
    fn truncation_is_bounded_and_utf8_safe() {
        assert_eq!(truncate("short", 500), "short");
        let long = "x".repeat(600);
        let cut = truncate(&long, 500);
        assert_eq!(cut.len(), 500);
        assert!(cut.ends_with("..."));
        // Multi-byte content must not split a char.
        let multi = "é".repeat(300);
        let cut = truncate(&multi, 100);
        assert!(cut.len() <= 100);
    }
}
