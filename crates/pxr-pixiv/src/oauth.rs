//! OAuth refresh against the Pixiv auth host.
//!
//! Each call builds its own `reqwest::Client` so the upstream proxy can
//! change between failover attempts; the hydration refresher drives that
//! loop.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::PIXIV_APP_USER_AGENT;

/// OAuth client credentials plus the hash secret for the `X-Client-Hash`
/// header. `base_url` is overridable for tests.
#[derive(Debug, Clone)]
pub struct PixivOauthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub hash_secret: Option<String>,
    pub base_url: String,
    pub connect_timeout: std::time::Duration,
    pub total_timeout: std::time::Duration,
}

impl PixivOauthConfig {
    pub fn new(client_id: &str, client_secret: &str, hash_secret: Option<&str>) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            hash_secret: hash_secret
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            base_url: crate::PIXIV_OAUTH_BASE_URL.to_string(),
            connect_timeout: std::time::Duration::from_secs(10),
            total_timeout: std::time::Duration::from_secs(30),
        }
    }

    /// Client headers Pixiv expects on every call: `X-Client-Time` and the
    /// md5 of time + hash secret.
    pub fn client_headers(&self) -> Vec<(&'static str, String)> {
        let client_time = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut headers = vec![("X-Client-Time", client_time.clone())];
        if let Some(secret) = &self.hash_secret {
            let digest = md5::compute(format!("{client_time}{secret}"));
            headers.push(("X-Client-Hash", format!("{digest:x}")));
        }
        headers
    }
}

/// A fresh access token, plus the rotated refresh token when the upstream
/// handed one back.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum OauthError {
    /// Network / transport failure; always worth a failover retry.
    #[error("oauth transport error: {0}")]
    Transport(String),
    /// Upstream answered with a non-success status.
    #[error("oauth error status={status}")]
    Status { status: u16, body: String },
    /// 2xx with an unusable body.
    #[error("oauth response decode error: {0}")]
    Decode(String),
}

impl OauthError {
    /// Transport errors and 5xx are worth retrying (possibly through another
    /// proxy); 4xx means the credential itself is bad.
    pub fn is_recoverable(&self) -> bool {
        match self {
            OauthError::Transport(_) => true,
            OauthError::Status { status, .. } => *status >= 500,
            OauthError::Decode(_) => false,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            OauthError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn build_http_client(
    config: &PixivOauthConfig,
    proxy: Option<&str>,
) -> Result<reqwest::Client, OauthError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.total_timeout)
        .user_agent(PIXIV_APP_USER_AGENT);
    if let Some(proxy_uri) = proxy {
        let proxy = reqwest::Proxy::all(proxy_uri)
            .map_err(|err| OauthError::Transport(format!("invalid proxy: {err}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|err| OauthError::Transport(format!("client build: {err}")))
}

fn string_at<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    for key in keys {
        if let Some(s) = value.get(key).and_then(Value::as_str) {
            if !s.is_empty() {
                return Some(s);
            }
        }
    }
    None
}

/// Exchange a refresh token for an access token.
pub async fn refresh_access_token(
    config: &PixivOauthConfig,
    refresh_token: &str,
    proxy: Option<&str>,
) -> Result<RefreshedToken, OauthError> {
    let client = build_http_client(config, proxy)?;
    let url = format!(
        "{}{}",
        config.base_url.trim_end_matches('/'),
        crate::OAUTH_TOKEN_PATH
    );

    let mut request = client.post(&url).form(&[
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.as_str()),
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("include_policy", "true"),
    ]);
    for (name, value) in config.client_headers() {
        request = request.header(name, value);
    }

    let response = request
        .send()
        .await
        .map_err(|err| OauthError::Transport(err.to_string()))?;

    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|err| OauthError::Transport(err.to_string()))?;

    if !(200..300).contains(&status) {
        let mut trimmed = body;
        trimmed.truncate(500);
        return Err(OauthError::Status {
            status,
            body: trimmed,
        });
    }

    let value: Value = serde_json::from_str(&body)
        .map_err(|err| OauthError::Decode(format!("not json: {err}")))?;

    // Fields appear both at the top level and under "response" depending on
    // the upstream variant; accept either.
    let nested = value.get("response").cloned().unwrap_or(Value::Null);
    let access_token = string_at(&value, &["access_token"])
        .or_else(|| string_at(&nested, &["access_token"]))
        .ok_or_else(|| OauthError::Decode("missing access_token".to_string()))?
        .to_string();
    let refresh_token = string_at(&value, &["refresh_token"])
        .or_else(|| string_at(&nested, &["refresh_token"]))
        .map(str::to_string);
    let expires_in = value
        .get("expires_in")
        .and_then(Value::as_i64)
        .or_else(|| nested.get("expires_in").and_then(Value::as_i64))
        .unwrap_or(3600);

    Ok(RefreshedToken {
        access_token,
        refresh_token,
        expires_in,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn test_config(base_url: String) -> PixivOauthConfig {
        let mut config = PixivOauthConfig::new("cid", "csecret", Some("hsecret"));
        config.base_url = base_url;
        config
    }

    #[tokio::test]
    async fn refresh_parses_rotation() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/auth/token")
                    .header_exists("X-Client-Time")
                    .header_exists("X-Client-Hash")
                    .body_contains("grant_type=refresh_token")
                    .body_contains("refresh_token=rt_old");
                then.status(200).json_body(serde_json::json!({
                    "access_token": "at1",
                    "refresh_token": "rt_new",
                    "expires_in": 3600,
                }));
            })
            .await;

        let token = refresh_access_token(&test_config(server.base_url()), "rt_old", None)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(token.access_token, "at1");
        assert_eq!(token.refresh_token.as_deref(), Some("rt_new"));
        assert_eq!(token.expires_in, 3600);
    }

    #[tokio::test]
    async fn refresh_parses_nested_response_shape() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/auth/token");
                then.status(200).json_body(serde_json::json!({
                    "response": {"access_token": "at2", "expires_in": 1800}
                }));
            })
            .await;

        let token = refresh_access_token(&test_config(server.base_url()), "rt", None)
            .await
            .unwrap();
        assert_eq!(token.access_token, "at2");
        assert!(token.refresh_token.is_none());
        assert_eq!(token.expires_in, 1800);
    }

    #[tokio::test]
    async fn auth_error_is_permanent_5xx_is_recoverable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/auth/token");
                then.status(400).body(r#"{"error":"invalid_grant"}"#);
            })
            .await;

        let err = refresh_access_token(&test_config(server.base_url()), "rt", None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(400));
        assert!(!err.is_recoverable());

        assert!(OauthError::Status {
            status: 503,
            body: String::new()
        }
        .is_recoverable());
        assert!(OauthError::Transport("reset".into()).is_recoverable());
    }
}
