//! Range-preserving HTTP pass-through for upstream images.
//!
//! The upstream response is streamed to the client without buffering; the
//! status (200 or 206) and the range/length headers mirror the upstream.
//! Failures classify to stable error codes so the /random retry loop and the
//! image failure marks can react per cause.

use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use futures_util::TryStreamExt;

use pxr_types::{ApiError, ErrorCode};

const FORCED_REFERER: &str = "https://www.pixiv.net/";

const MIRRORED_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "content-range",
    "accept-ranges",
];

fn classify_send_error(err: &reqwest::Error, via_proxy: bool) -> ApiError {
    let text = err.to_string();
    if via_proxy {
        if text.contains("407") || text.to_ascii_lowercase().contains("proxy auth") {
            return ApiError::new(ErrorCode::ProxyAuthFailed, "Proxy authentication failed", 502);
        }
        if err.is_connect() {
            return ApiError::new(ErrorCode::ProxyConnectFailed, "Proxy connection failed", 502);
        }
    }
    ApiError::new(ErrorCode::UpstreamStreamError, "Upstream request failed", 502)
}

fn classify_status(status: u16) -> ApiError {
    let code = match status {
        403 => ErrorCode::Upstream403,
        404 => ErrorCode::Upstream404,
        429 => ErrorCode::UpstreamRateLimit,
        _ => ErrorCode::UpstreamStreamError,
    };
    ApiError::new(code, format!("Upstream answered {status}"), 502)
}

/// Stream `url`, optionally through `proxy`, forwarding `range_header`
/// upstream and mirroring the upstream's range semantics back.
pub async fn stream_url(
    url: &str,
    proxy: Option<&str>,
    cache_control: &str,
    range_header: Option<&str>,
) -> Result<Response, ApiError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(Duration::from_secs(30));
    if let Some(proxy_uri) = proxy {
        let proxy = reqwest::Proxy::all(proxy_uri)
            .map_err(|_| ApiError::new(ErrorCode::ProxyConnectFailed, "Invalid proxy", 502))?;
        builder = builder.proxy(proxy);
    }
    let client = builder
        .build()
        .map_err(|_| ApiError::internal("http client build failed"))?;

    let mut request = client.get(url).header("Referer", FORCED_REFERER);
    if let Some(range) = range_header {
        request = request.header("Range", range);
    }

    let upstream = request
        .send()
        .await
        .map_err(|err| classify_send_error(&err, proxy.is_some()))?;

    let status = upstream.status().as_u16();
    if !(status == 200 || status == 206) {
        return Err(classify_status(status));
    }

    let mut headers = HeaderMap::new();
    for name in MIRRORED_HEADERS {
        if let Some(value) = upstream.headers().get(*name) {
            if let Ok(name) = axum::http::header::HeaderName::from_bytes(name.as_bytes()) {
                headers.insert(name, value.clone());
            }
        }
    }
    if let Ok(value) = HeaderValue::from_str(cache_control) {
        headers.insert(axum::http::header::CACHE_CONTROL, value);
    }
    // A range-capable upstream that omits Accept-Ranges still speaks bytes.
    headers
        .entry(axum::http::header::ACCEPT_RANGES)
        .or_insert(HeaderValue::from_static("bytes"));

    let stream = upstream
        .bytes_stream()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));

    let mut response = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .body(Body::from_stream(stream))
        .map_err(|_| ApiError::internal("response build failed"))?;
    response.headers_mut().extend(headers);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn mirrors_206_and_range_headers() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/img/1_p0.jpg")
                    .header("range", "bytes=0-2")
                    .header("referer", FORCED_REFERER);
                then.status(206)
                    .header("Content-Range", "bytes 0-2/6")
                    .header("Content-Type", "image/jpeg")
                    .header("Accept-Ranges", "bytes")
                    .body("abc");
            })
            .await;

        let response = stream_url(
            &format!("{}/img/1_p0.jpg", server.base_url()),
            None,
            "no-store",
            Some("bytes=0-2"),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get("content-range").unwrap(),
            "bytes 0-2/6"
        );
        assert_eq!(response.headers().get("accept-ranges").unwrap(), "bytes");
        assert_eq!(response.headers().get("cache-control").unwrap(), "no-store");

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"abc");
    }

    #[tokio::test]
    async fn upstream_failures_classify_to_stable_codes() {
        let server = MockServer::start_async().await;
        for (status, code) in [
            (403, ErrorCode::Upstream403),
            (404, ErrorCode::Upstream404),
            (429, ErrorCode::UpstreamRateLimit),
            (500, ErrorCode::UpstreamStreamError),
        ] {
            let mock = server
                .mock_async(|when, then| {
                    when.method(GET).path(format!("/s/{status}"));
                    then.status(status);
                })
                .await;
            let err = stream_url(
                &format!("{}/s/{status}", server.base_url()),
                None,
                "no-store",
                None,
            )
            .await
            .unwrap_err();
            mock.assert_async().await;
            assert_eq!(err.code, code);
            assert_eq!(err.status, 502);
        }
    }

    #[tokio::test]
    async fn connection_refusal_through_proxy_is_proxy_connect_failed() {
        // Nothing listens on this port.
        let err = stream_url(
            "http://127.0.0.1:9/x.jpg",
            Some("http://127.0.0.1:9"),
            "no-store",
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProxyConnectFailed);
    }
}
