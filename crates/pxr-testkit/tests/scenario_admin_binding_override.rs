//! Admin API: setting an override surfaces `effective_mode="override"` in
//! the bindings listing; clearing it falls back to the primary.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use pxr_daemon::state::AppContext;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn admin_request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, "Bearer admin-pass");
    match body {
        Some(value) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn override_surfaces_in_effective_mode() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let (pool_id, endpoints) = pxr_testkit::seed_proxy_pool(&pool, 2).await;
    let token_id = pxr_db::tokens::insert_token(
        &pool,
        Some("t"),
        "enc",
        "****",
        1,
        true,
        &pxr_types::now_iso(),
    )
    .await?;
    pxr_db::bindings::upsert_binding_primary(
        &pool,
        token_id,
        pool_id,
        endpoints[0],
        &pxr_types::now_iso(),
    )
    .await?;

    let ctx = Arc::new(AppContext::new(pool.clone(), pxr_testkit::test_settings()));
    let app = pxr_daemon::build_router(ctx);

    // Without an override the primary is effective.
    let response = app
        .clone()
        .oneshot(admin_request("GET", "/admin/bindings", None))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["items"][0]["effective_mode"], "primary");
    assert_eq!(body["items"][0]["effective_proxy_id"], endpoints[0]);

    // Set a 10-minute override onto the second endpoint.
    let response = app
        .clone()
        .oneshot(admin_request(
            "POST",
            "/admin/bindings/override",
            Some(serde_json::json!({
                "token_id": token_id,
                "pool_id": pool_id,
                "proxy_id": endpoints[1],
                "ttl_ms": 600_000,
            })),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(admin_request("GET", "/admin/bindings", None))
        .await?;
    let body = body_json(response).await;
    assert_eq!(body["items"][0]["effective_mode"], "override");
    assert_eq!(body["items"][0]["effective_proxy_id"], endpoints[1]);
    assert_eq!(body["items"][0]["primary_proxy_id"], endpoints[0]);

    // Clearing restores the primary.
    let response = app
        .clone()
        .oneshot(admin_request(
            "POST",
            "/admin/bindings/clear_override",
            Some(serde_json::json!({"token_id": token_id, "pool_id": pool_id})),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(admin_request("GET", "/admin/bindings", None))
        .await?;
    let body = body_json(response).await;
    assert_eq!(body["items"][0]["effective_mode"], "primary");

    Ok(())
}

#[tokio::test]
async fn admin_routes_require_credentials() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let ctx = Arc::new(AppContext::new(pool, pxr_testkit::test_settings()));
    let app = pxr_daemon::build_router(ctx);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/admin/bindings").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "UNAUTHORIZED");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/bindings")
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    Ok(())
}
