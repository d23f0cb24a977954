//! Runtime settings: JSON values keyed by dotted names, editable at runtime
//! through the admin API, plus the typed [`RuntimeConfig`] snapshot the
//! serving and hydration paths read.
//!
//! Invalid stored values never fail a request; they fall back to defaults
//! (the admin may have written anything).

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::entities::RuntimeSettingRow;

pub const DEFAULT_PXIMG_MIRROR_HOST: &str = "i.pixiv.cat";

/// Typed snapshot of the runtime-settings table.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub proxy_enabled: bool,
    pub proxy_fail_closed: bool,
    /// `off | all | pixiv_only | allowlist`.
    pub proxy_route_mode: String,
    pub proxy_allowlist_domains: Vec<String>,
    /// Host-suffix → pool id, longest suffix wins.
    pub proxy_route_pools: HashMap<String, i64>,
    pub proxy_default_pool_id: Option<i64>,
    pub image_proxy_use_pixiv_cat: bool,
    pub image_proxy_pximg_mirror_host: String,
    pub random_defaults: Value,
    pub hide_origin_url_in_public_json: bool,
    pub rate_limit: HashMap<String, Value>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            proxy_enabled: false,
            proxy_fail_closed: true,
            proxy_route_mode: "pixiv_only".to_string(),
            proxy_allowlist_domains: Vec::new(),
            proxy_route_pools: HashMap::new(),
            proxy_default_pool_id: None,
            image_proxy_use_pixiv_cat: false,
            image_proxy_pximg_mirror_host: DEFAULT_PXIMG_MIRROR_HOST.to_string(),
            random_defaults: Value::Null,
            hide_origin_url_in_public_json: true,
            rate_limit: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Clamped integer lookup under `rate_limit.*`.
    pub fn rate_limit_int(&self, key: &str, default: i64, min: i64, max: i64) -> i64 {
        let value = match self.rate_limit.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        };
        value.clamp(min, max)
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Some(true),
            "false" | "0" | "no" | "n" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn normalize_host_key(raw: &str) -> String {
    raw.trim().trim_matches('.').to_ascii_lowercase()
}

/// Build the typed snapshot from raw `key → value` pairs.
pub fn runtime_config_from_values(values: &HashMap<String, Value>) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();

    if let Some(v) = values.get("proxy.enabled").and_then(as_bool) {
        config.proxy_enabled = v;
    }
    if let Some(v) = values.get("proxy.fail_closed").and_then(as_bool) {
        config.proxy_fail_closed = v;
    }
    if let Some(Value::String(raw)) = values.get("proxy.route_mode") {
        let candidate = raw.trim().to_ascii_lowercase();
        if matches!(candidate.as_str(), "off" | "all" | "pixiv_only" | "allowlist") {
            config.proxy_route_mode = candidate;
        }
    }
    if let Some(Value::Array(items)) = values.get("proxy.allowlist_domains") {
        let mut seen = std::collections::HashSet::new();
        for item in items {
            if let Value::String(s) = item {
                let host = normalize_host_key(s);
                if !host.is_empty() && seen.insert(host.clone()) {
                    config.proxy_allowlist_domains.push(host);
                }
            }
        }
    }
    if let Some(Value::Object(map)) = values.get("proxy.route_pools") {
        for (key, value) in map {
            let host = normalize_host_key(key);
            if host.is_empty() || host.len() > 200 {
                continue;
            }
            let pool_id = match value {
                Value::Number(n) => n.as_i64().unwrap_or(0),
                Value::String(s) => s.trim().parse().unwrap_or(0),
                _ => 0,
            };
            if pool_id > 0 {
                config.proxy_route_pools.insert(host, pool_id);
            }
        }
    }
    if let Some(value) = values.get("proxy.default_pool_id") {
        let pool_id = match value {
            Value::Number(n) => n.as_i64().unwrap_or(0),
            Value::String(s) => s.trim().parse().unwrap_or(0),
            _ => 0,
        };
        if pool_id > 0 {
            config.proxy_default_pool_id = Some(pool_id);
        }
    }
    if let Some(v) = values.get("image_proxy.use_pixiv_cat").and_then(as_bool) {
        config.image_proxy_use_pixiv_cat = v;
    }
    if let Some(Value::String(raw)) = values.get("image_proxy.pximg_mirror_host") {
        let host = raw.trim();
        if !host.is_empty() {
            config.image_proxy_pximg_mirror_host = host.to_string();
        }
    }
    if let Some(v) = values.get("random.defaults") {
        if v.is_object() {
            config.random_defaults = v.clone();
        }
    }
    if let Some(v) = values
        .get("security.hide_origin_url_in_public_json")
        .and_then(as_bool)
    {
        config.hide_origin_url_in_public_json = v;
    }
    for (key, value) in values {
        if let Some(short) = key.strip_prefix("rate_limit.") {
            config.rate_limit.insert(short.to_string(), value.clone());
        }
    }

    config
}

pub async fn fetch_runtime_settings(pool: &SqlitePool) -> Result<HashMap<String, Value>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value_json FROM runtime_settings")
            .fetch_all(pool)
            .await
            .context("fetch_runtime_settings failed")?;
    let mut values = HashMap::with_capacity(rows.len());
    for (key, value_json) in rows {
        match serde_json::from_str::<Value>(&value_json) {
            Ok(value) => {
                values.insert(key, value);
            }
            Err(_) => tracing::warn!("runtime_settings_invalid_json key={}", key),
        }
    }
    Ok(values)
}

pub async fn load_runtime_config(pool: &SqlitePool) -> Result<RuntimeConfig> {
    let values = fetch_runtime_settings(pool).await?;
    Ok(runtime_config_from_values(&values))
}

pub async fn list_runtime_settings(pool: &SqlitePool) -> Result<Vec<RuntimeSettingRow>> {
    let rows = sqlx::query_as::<_, RuntimeSettingRow>(
        "SELECT key, value_json, description, updated_by, updated_at \
         FROM runtime_settings ORDER BY key ASC",
    )
    .fetch_all(pool)
    .await
    .context("list_runtime_settings failed")?;
    Ok(rows)
}

/// Upsert one setting; the value is stored as compact JSON. A `None`
/// description preserves the stored one.
pub async fn set_runtime_setting(
    pool: &SqlitePool,
    key: &str,
    value: &Value,
    description: Option<&str>,
    updated_by: Option<&str>,
    now_iso: &str,
) -> Result<()> {
    let key = key.trim();
    anyhow::ensure!(!key.is_empty(), "runtime setting key is required");
    let value_json = serde_json::to_string(value).context("serialize runtime setting")?;

    sqlx::query(
        r#"
        INSERT INTO runtime_settings (key, value_json, description, updated_by, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (key) DO UPDATE SET
            value_json = excluded.value_json,
            description = COALESCE(excluded.description, runtime_settings.description),
            updated_by = excluded.updated_by,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value_json)
    .bind(description)
    .bind(updated_by)
    .bind(now_iso)
    .execute(pool)
    .await
    .context("set_runtime_setting failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_fail_closed_pixiv_only() {
        let config = RuntimeConfig::default();
        assert!(!config.proxy_enabled);
        assert!(config.proxy_fail_closed);
        assert_eq!(config.proxy_route_mode, "pixiv_only");
    }

    #[test]
    fn parses_route_pools_and_skips_garbage() {
        let mut values = HashMap::new();
        values.insert(
            "proxy.route_pools".to_string(),
            json!({"Pixiv.NET.": 3, "bad": 0, "str": "7", "alsobad": "x"}),
        );
        let config = runtime_config_from_values(&values);
        assert_eq!(config.proxy_route_pools.get("pixiv.net"), Some(&3));
        assert_eq!(config.proxy_route_pools.get("str"), Some(&7));
        assert_eq!(config.proxy_route_pools.len(), 2);
    }

    #[test]
    fn bool_coercions() {
        let mut values = HashMap::new();
        values.insert("proxy.enabled".to_string(), json!("on"));
        values.insert("proxy.fail_closed".to_string(), json!(0));
        let config = runtime_config_from_values(&values);
        assert!(config.proxy_enabled);
        assert!(!config.proxy_fail_closed);
    }

    #[test]
    fn rate_limit_lookup_clamps() {
        let mut values = HashMap::new();
        values.insert("rate_limit.pixiv_hydrate_min_interval_ms".to_string(), json!(999_999));
        let config = runtime_config_from_values(&values);
        assert_eq!(
            config.rate_limit_int("pixiv_hydrate_min_interval_ms", 800, 0, 60_000),
            60_000
        );
        assert_eq!(config.rate_limit_int("absent", 42, 0, 100), 42);
    }
}
