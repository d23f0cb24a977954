//! `/i/{id}.{ext}` forwards Range upstream and mirrors 206 + range headers
//! back; upstream failures mark the image and surface 502 with the stable
//! code.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use httpmock::prelude::*;
use tower::ServiceExt;

use pxr_daemon::state::AppContext;

fn app_with_upstream(
    pool: sqlx::SqlitePool,
    upstream_base: &str,
) -> axum::Router {
    let mut ctx = AppContext::new(pool, pxr_testkit::test_settings());
    ctx.upstream_base_override = Some(upstream_base.to_string());
    pxr_daemon::build_router(Arc::new(ctx))
}

#[tokio::test]
async fn range_request_mirrors_partial_content() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let image_id = pxr_testkit::seed_image(&pool, 77, 0, 0.5).await;
    pxr_testkit::seed_tags(&pool, image_id, &["cat"]).await;

    let server = MockServer::start_async().await;
    let upstream = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/img-original/img/2020/01/01/00/00/00/77_p0.jpg")
                .header("range", "bytes=0-2")
                .header("referer", "https://www.pixiv.net/");
            then.status(206)
                .header("Content-Range", "bytes 0-2/6")
                .header("Content-Type", "image/jpeg")
                .header("Accept-Ranges", "bytes")
                .body("abc");
        })
        .await;

    let app = app_with_upstream(pool.clone(), &server.base_url());
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/i/{image_id}.jpg"))
                .header("Range", "bytes=0-2")
                .body(Body::empty())?,
        )
        .await?;

    upstream.assert_async().await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get("content-range").unwrap(),
        "bytes 0-2/6"
    );
    assert_eq!(response.headers().get("accept-ranges").unwrap(), "bytes");
    let body = response.into_body().collect().await?.to_bytes();
    assert_eq!(&body[..], b"abc");

    Ok(())
}

#[tokio::test]
async fn upstream_404_marks_the_image_and_returns_502() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let image_id = pxr_testkit::seed_image(&pool, 78, 0, 0.5).await;

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path_contains("78_p0.jpg");
            then.status(404);
        })
        .await;

    let app = app_with_upstream(pool.clone(), &server.base_url());
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/i/{image_id}.jpg"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = response.into_body().collect().await?.to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(body["code"], "UPSTREAM_404");

    // The failure mark lands on a background task; give it a beat.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let image = pxr_db::images::get_image_by_id(&pool, image_id).await?.unwrap();
    assert_eq!(image.last_error_code.as_deref(), Some("UPSTREAM_404"));
    assert!(image.last_fail_at.is_some());
    assert_eq!(image.fail_count, 1);

    Ok(())
}

#[tokio::test]
async fn unknown_image_or_wrong_ext_is_not_found() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let image_id = pxr_testkit::seed_image(&pool, 79, 0, 0.5).await;

    let app = app_with_upstream(pool, "http://127.0.0.1:1");
    for uri in [format!("/i/99999.jpg"), format!("/i/{image_id}.png")] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(&uri).body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "uri={uri}");
    }
    Ok(())
}

#[tokio::test]
async fn legacy_aliases_resolve_pages() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let _p0 = pxr_testkit::seed_image(&pool, 80, 0, 0.3).await;
    let _p1 = pxr_testkit::seed_image(&pool, 80, 1, 0.6).await;

    let server = MockServer::start_async().await;
    let first = server
        .mock_async(|when, then| {
            when.method(GET).path_contains("80_p0.jpg");
            then.status(200).header("Content-Type", "image/jpeg").body("xx");
        })
        .await;
    let second = server
        .mock_async(|when, then| {
            when.method(GET).path_contains("80_p1.jpg");
            then.status(200).header("Content-Type", "image/jpeg").body("yy");
        })
        .await;

    let app = app_with_upstream(pool, &server.base_url());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/80.jpg").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    first.assert_async().await;

    // Legacy multi-page URLs are 1-based.
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/80-2.jpg").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    second.assert_async().await;

    let response = app
        .oneshot(Request::builder().uri("/80-9.jpg").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    Ok(())
}
