//! App API client: the per-illust detail fetch.

use serde_json::Value;

use crate::oauth::PixivOauthConfig;
use crate::PIXIV_APP_USER_AGENT;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("app api transport error: {0}")]
    Transport(String),
    #[error("app api error status={status}")]
    Status { status: u16, body: String },
    #[error("app api response decode error: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            FetchError::Status { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// App API access. `base_url` is overridable for tests; a client is built per
/// call so the failover loop can switch proxies between attempts.
#[derive(Debug, Clone)]
pub struct AppApiClient {
    pub base_url: String,
    pub oauth: PixivOauthConfig,
}

impl AppApiClient {
    pub fn new(oauth: PixivOauthConfig) -> Self {
        Self {
            base_url: crate::PIXIV_APP_API_BASE_URL.to_string(),
            oauth,
        }
    }

    /// GET `/v1/illust/detail?illust_id=..` with the bearer token, returning
    /// the raw JSON document. Non-2xx statuses surface as
    /// [`FetchError::Status`] with a truncated body for classification.
    pub async fn illust_detail(
        &self,
        illust_id: i64,
        access_token: &str,
        proxy: Option<&str>,
    ) -> Result<Value, FetchError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.oauth.connect_timeout)
            .timeout(self.oauth.total_timeout)
            .user_agent(PIXIV_APP_USER_AGENT);
        if let Some(proxy_uri) = proxy {
            let proxy = reqwest::Proxy::all(proxy_uri)
                .map_err(|err| FetchError::Transport(format!("invalid proxy: {err}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|err| FetchError::Transport(format!("client build: {err}")))?;

        let url = format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            crate::ILLUST_DETAIL_PATH
        );
        let mut request = client
            .get(&url)
            .query(&[("illust_id", illust_id.to_string()), ("filter", "for_android".to_string())])
            .bearer_auth(access_token);
        for (name, value) in self.oauth.client_headers() {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;

        if !(200..300).contains(&status) {
            let mut trimmed = body;
            trimmed.truncate(500);
            return Err(FetchError::Status {
                status,
                body: trimmed,
            });
        }

        serde_json::from_str(&body).map_err(|err| FetchError::Decode(format!("not json: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client(base_url: String) -> AppApiClient {
        let mut c = AppApiClient::new(PixivOauthConfig::new("cid", "cs", None));
        c.base_url = base_url;
        c
    }

    #[tokio::test]
    async fn detail_sends_bearer_and_parses_json() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/illust/detail")
                    .query_param("illust_id", "111")
                    .query_param("filter", "for_android")
                    .header("authorization", "Bearer at1");
                then.status(200)
                    .json_body(serde_json::json!({"illust": {"id": 111}}));
            })
            .await;

        let value = client(server.base_url())
            .illust_detail(111, "at1", None)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(value["illust"]["id"], 111);
    }

    #[tokio::test]
    async fn non_success_statuses_carry_the_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/illust/detail");
                then.status(403).body(r#"{"error":{"message":"Rate Limit"}}"#);
            })
            .await;

        let err = client(server.base_url())
            .illust_detail(1, "at", None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(403));
        assert!(err.body().unwrap().contains("Rate Limit"));
    }
}
