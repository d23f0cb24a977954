//! Upstream Pixiv plumbing: OAuth refresh, the App API client, token
//! selection, the access-token cache, the per-token throttle, the backoff
//! curves, and original-URL parsing.
//!
//! Nothing in this crate touches the database; callers wire persistence
//! around these pieces.

pub mod backoff;
pub mod client;
pub mod oauth;
pub mod throttle;
pub mod token_cache;
pub mod token_strategy;
pub mod types;
pub mod urls;

pub const PIXIV_APP_API_BASE_URL: &str = "https://app-api.pixiv.net";
pub const PIXIV_OAUTH_BASE_URL: &str = "https://oauth.secure.pixiv.net";
pub const OAUTH_TOKEN_PATH: &str = "/auth/token";
pub const ILLUST_DETAIL_PATH: &str = "/v1/illust/detail";

/// User agent of the mobile client whose OAuth credentials we use.
pub const PIXIV_APP_USER_AGENT: &str = "PixivAndroidApp/5.0.234 (Android 11; Pixel 5)";
