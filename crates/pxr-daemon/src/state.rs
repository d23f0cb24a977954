//! Shared daemon state, threaded through handlers as `State<Arc<AppContext>>`.

use sqlx::SqlitePool;

use pxr_config::Settings;
use pxr_crypto::FieldEncryptor;

#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            service: "pxr-daemon",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Everything a request handler needs. Built once at startup; no globals.
pub struct AppContext {
    pub pool: SqlitePool,
    pub settings: Settings,
    pub encryptor: Option<FieldEncryptor>,
    pub build: BuildInfo,
    /// Base URL override for the upstream image host, used by tests to point
    /// streaming at a mock server. `None` means the stored original URLs are
    /// fetched as-is.
    pub upstream_base_override: Option<String>,
}

impl AppContext {
    pub fn new(pool: SqlitePool, settings: Settings) -> Self {
        let encryptor = if settings.field_encryption_key.is_empty() {
            None
        } else {
            FieldEncryptor::from_key(&settings.field_encryption_key).ok()
        };
        Self {
            pool,
            settings,
            encryptor,
            build: BuildInfo::default(),
            upstream_base_override: None,
        }
    }

    /// Apply the test override to an upstream URL: keep path + query, swap
    /// scheme/host.
    pub fn upstream_url(&self, original_url: &str) -> String {
        let Some(base) = &self.upstream_base_override else {
            return original_url.to_string();
        };
        let path = original_url
            .strip_prefix("https://")
            .or_else(|| original_url.strip_prefix("http://"))
            .and_then(|rest| rest.find('/').map(|idx| &rest[idx..]))
            .unwrap_or("/");
        format!("{}{}", base.trim_end_matches('/'), path)
    }
}
