//! Row types, one per table. Field order follows the schema.

use serde::Serialize;
use sqlx::FromRow;

/// `images` row. `status`: 1=enabled, 2=disabled, 4=soft-deleted.
/// `orientation`: 1=portrait, 2=landscape, 3=square.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ImageRow {
    pub id: i64,
    pub illust_id: i64,
    pub page_index: i64,
    pub ext: String,
    pub original_url: String,
    pub proxy_path: String,
    pub random_key: f64,
    pub status: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub aspect_ratio: Option<f64>,
    pub orientation: Option<i64>,
    pub x_restrict: Option<i64>,
    pub ai_type: Option<i64>,
    pub illust_type: Option<i64>,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub title: Option<String>,
    pub created_at_pixiv: Option<String>,
    pub bookmark_count: Option<i64>,
    pub view_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub last_ok_at: Option<String>,
    pub last_fail_at: Option<String>,
    pub last_error_code: Option<String>,
    pub fail_count: i64,
    pub created_import_id: Option<i64>,
    pub added_at: String,
    pub updated_at: String,
}

impl ImageRow {
    /// True when core metadata is absent and the illust deserves an
    /// opportunistic hydration pass.
    pub fn missing_core_metadata(&self) -> bool {
        self.width.is_none()
            || self.height.is_none()
            || self.x_restrict.is_none()
            || self.ai_type.is_none()
            || self.illust_type.is_none()
            || self.user_id.is_none()
            || self.bookmark_count.is_none()
            || self.view_count.is_none()
            || self.comment_count.is_none()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TagRow {
    pub id: i64,
    pub name: String,
    pub translated_name: Option<String>,
    pub added_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ImportRow {
    pub id: i64,
    pub created_by: String,
    pub source: String,
    pub total: i64,
    pub accepted: i64,
    pub success: i64,
    pub failed: i64,
    pub detail_json: Option<String>,
    pub added_at: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct PixivTokenRow {
    pub id: i64,
    pub label: Option<String>,
    pub enabled: bool,
    pub refresh_token_enc: String,
    pub refresh_token_masked: String,
    pub weight: i64,
    pub error_count: i64,
    pub backoff_until: Option<String>,
    pub last_ok_at: Option<String>,
    pub last_fail_at: Option<String>,
    pub last_error_code: Option<String>,
    pub last_error_msg: Option<String>,
    pub added_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ProxyPoolRow {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub description: Option<String>,
    pub added_at: String,
    pub updated_at: String,
}

/// `proxy_endpoints` row. `password_enc` stays encrypted here; only the proxy
/// URI builder decrypts it.
#[derive(Debug, Clone, FromRow)]
pub struct ProxyEndpointRow {
    pub id: i64,
    pub scheme: String,
    pub host: String,
    pub port: i64,
    pub username: String,
    pub password_enc: String,
    pub enabled: bool,
    pub source: String,
    pub source_ref: Option<String>,
    pub last_latency_ms: Option<f64>,
    pub last_ok_at: Option<String>,
    pub last_fail_at: Option<String>,
    pub blacklisted_until: Option<String>,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_error: Option<String>,
    pub added_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PoolMemberRow {
    pub pool_id: i64,
    pub endpoint_id: i64,
    pub enabled: bool,
    pub weight: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TokenProxyBindingRow {
    pub token_id: i64,
    pub pool_id: i64,
    pub primary_proxy_id: i64,
    pub override_proxy_id: Option<i64>,
    pub override_expires_at: Option<String>,
    pub updated_at: String,
}

impl TokenProxyBindingRow {
    /// Override is active iff set and unexpired at `now_iso`.
    pub fn override_active(&self, now_iso: &str) -> bool {
        match (&self.override_proxy_id, &self.override_expires_at) {
            (Some(_), Some(expires)) => expires.as_str() > now_iso,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobRow {
    pub id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: String,
    pub priority: i64,
    pub run_after: Option<String>,
    pub attempt: i64,
    pub max_attempts: i64,
    pub payload_json: String,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<String>,
    pub ref_type: Option<String>,
    pub ref_id: Option<String>,
    pub added_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HydrationRunRow {
    pub id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub run_type: String,
    pub status: String,
    pub criteria_json: String,
    pub cursor_json: String,
    pub total: Option<i64>,
    pub processed: i64,
    pub success: i64,
    pub failed: i64,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub last_error: Option<String>,
    pub added_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RuntimeSettingRow {
    pub key: String,
    pub value_json: String,
    pub description: Option<String>,
    pub updated_by: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ApiKeyRow {
    pub id: i64,
    pub label: String,
    #[serde(skip)]
    pub key_hash: String,
    pub enabled: bool,
    pub added_at: String,
}
