//! Shared primitives used across the workspace: the canonical UTC timestamp
//! format, request/worker id generation, and the stable API error vocabulary.
//!
//! Everything that persists a timestamp or returns an error code to a caller
//! goes through this crate so the wire/database formats stay in one place.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Format a UTC instant as the canonical persisted form:
/// `YYYY-MM-DDTHH:MM:SS.sssZ`.
///
/// This string collates lexicographically in timestamp order, which the store
/// relies on for `backoff_until` / `blacklisted_until` comparisons in SQL.
pub fn iso_utc_ms(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current wall-clock time in the canonical persisted form.
pub fn now_iso() -> String {
    iso_utc_ms(Utc::now())
}

/// Normalize an ISO-8601 instant to whole-second UTC (`YYYY-MM-DDTHH:MM:SSZ`),
/// the form used for `created_at_pixiv`. Accepts a trailing `Z` or a numeric
/// offset; naive inputs are treated as UTC.
pub fn normalize_iso_utc_seconds(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let dt = parse_iso_utc(trimmed)?;
    Some(dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Parse an ISO-8601 instant into `DateTime<Utc>`. Naive datetimes are read
/// as UTC. Returns `None` on malformed input.
pub fn parse_iso_utc(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive "YYYY-MM-DDTHH:MM:SS[.sss]" without an offset.
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    None
}

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

/// New request id, e.g. `req_2f9c0e0d7f5a4b6e9b1d`. Short enough for logs,
/// unique enough to correlate a single request end to end.
pub fn new_request_id() -> String {
    let u = uuid::Uuid::new_v4().simple().to_string();
    format!("req_{}", &u[..20])
}

/// Worker identity used for job lease ownership. Stable per process.
pub fn default_worker_id() -> String {
    format!("pid{}", std::process::id())
}

// ---------------------------------------------------------------------------
// Error vocabulary
// ---------------------------------------------------------------------------

/// Stable error code strings. These values are part of the public interface;
/// renaming one is a breaking API change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    InternalError,
    NoMatch,
    UpstreamStreamError,
    Upstream403,
    Upstream404,
    UpstreamRateLimit,
    InvalidUploadType,
    PayloadTooLarge,
    UnsupportedUrl,
    TokenRefreshFailed,
    TokenBackoff,
    NoTokenAvailable,
    ProxyRequired,
    ProxyAuthFailed,
    ProxyConnectFailed,
}

impl ErrorCode {
    /// The wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::NoMatch => "NO_MATCH",
            ErrorCode::UpstreamStreamError => "UPSTREAM_STREAM_ERROR",
            ErrorCode::Upstream403 => "UPSTREAM_403",
            ErrorCode::Upstream404 => "UPSTREAM_404",
            ErrorCode::UpstreamRateLimit => "UPSTREAM_RATE_LIMIT",
            ErrorCode::InvalidUploadType => "INVALID_UPLOAD_TYPE",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::UnsupportedUrl => "UNSUPPORTED_URL",
            ErrorCode::TokenRefreshFailed => "TOKEN_REFRESH_FAILED",
            ErrorCode::TokenBackoff => "TOKEN_BACKOFF",
            ErrorCode::NoTokenAvailable => "NO_TOKEN_AVAILABLE",
            ErrorCode::ProxyRequired => "PROXY_REQUIRED",
            ErrorCode::ProxyAuthFailed => "PROXY_AUTH_FAILED",
            ErrorCode::ProxyConnectFailed => "PROXY_CONNECT_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A caller-visible error: stable code, human message, HTTP status, and an
/// optional structured detail payload (e.g. fail-closed proxy diagnostics).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>, status: u16) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message, 400)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message, 401)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message, 404)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message, 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn iso_utc_ms_has_millis_and_z() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 6, 7, 8).unwrap();
        assert_eq!(iso_utc_ms(at), "2024-03-05T06:07:08.000Z");
    }

    #[test]
    fn normalize_seconds_accepts_offset_and_naive() {
        assert_eq!(
            normalize_iso_utc_seconds("2020-01-01T09:00:00+09:00").as_deref(),
            Some("2020-01-01T00:00:00Z"),
        );
        assert_eq!(
            normalize_iso_utc_seconds("2020-01-01T00:00:00").as_deref(),
            Some("2020-01-01T00:00:00Z"),
        );
        assert_eq!(normalize_iso_utc_seconds("   "), None);
        assert_eq!(normalize_iso_utc_seconds("not-a-date"), None);
    }

    #[test]
    fn timestamp_strings_collate_in_time_order() {
        let a = iso_utc_ms(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap());
        let b = iso_utc_ms(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 2).unwrap());
        assert!(a < b);
    }

    #[test]
    fn request_ids_are_prefixed_and_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
    }

    #[test]
    fn error_codes_are_stable_strings() {
        assert_eq!(ErrorCode::NoMatch.as_str(), "NO_MATCH");
        assert_eq!(ErrorCode::ProxyRequired.as_str(), "PROXY_REQUIRED");
        assert_eq!(ErrorCode::UpstreamRateLimit.as_str(), "UPSTREAM_RATE_LIMIT");
    }
}
