//! `/random` with a seed is reproducible within the same parameters and
//! dataset, and filters always constrain the result set.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use pxr_daemon::state::AppContext;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn seeded_population(pool: &sqlx::SqlitePool) -> Vec<i64> {
    // Keys 0.05, 0.15, ..., 0.95; safe-rated; three tagged "cat".
    let mut cat_ids = Vec::new();
    for i in 0..10 {
        let id = pxr_testkit::seed_image(pool, 1000 + i, 0, 0.05 + 0.1 * i as f64).await;
        sqlx::query("UPDATE images SET x_restrict = 0 WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
        if i % 3 == 0 {
            pxr_testkit::seed_tags(pool, id, &["cat"]).await;
            cat_ids.push(id);
        } else {
            pxr_testkit::seed_tags(pool, id, &["dog"]).await;
        }
    }
    cat_ids
}

async fn pick_id(app: &axum::Router, uri: &str) -> i64 {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK, "uri={uri}");
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    body["data"]["image"]["id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap()
}

#[tokio::test]
async fn seed_makes_the_pick_reproducible() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let cat_ids = seeded_population(&pool).await;

    let ctx = Arc::new(AppContext::new(pool, pxr_testkit::test_settings()));
    let app = pxr_daemon::build_router(ctx);

    let uri = "/random?format=simple_json&strategy=random&seed=s1&included_tags=cat";
    let first = pick_id(&app, uri).await;
    let second = pick_id(&app, uri).await;
    assert_eq!(first, second, "same seed, same parameters, same image");
    assert!(cat_ids.contains(&first));

    let other = pick_id(
        &app,
        "/random?format=simple_json&strategy=random&seed=s2&included_tags=cat",
    )
    .await;
    assert!(cat_ids.contains(&other), "any seed stays inside the filter");

    Ok(())
}

#[tokio::test]
async fn quality_strategy_stays_inside_filters_too() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let cat_ids = seeded_population(&pool).await;

    let ctx = Arc::new(AppContext::new(pool, pxr_testkit::test_settings()));
    let app = pxr_daemon::build_router(ctx);

    for seed in ["a", "b", "c"] {
        let id = pick_id(
            &app,
            &format!(
                "/random?format=simple_json&strategy=quality&quality_samples=10&seed={seed}&included_tags=cat"
            ),
        )
        .await;
        assert!(cat_ids.contains(&id));
    }
    Ok(())
}

#[tokio::test]
async fn impossible_filters_return_no_match_with_hints() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    seeded_population(&pool).await;

    let ctx = Arc::new(AppContext::new(pool, pxr_testkit::test_settings()));
    let app = pxr_daemon::build_router(ctx);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/random?format=json&included_tags=definitely_absent_tag")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], "NO_MATCH");
    assert!(body["details"]["hints"]["applied_filters"].is_object());
    assert!(body["details"]["hints"]["suggestions"].is_array());

    Ok(())
}

#[tokio::test]
async fn invalid_parameters_are_rejected() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let ctx = Arc::new(AppContext::new(pool, pxr_testkit::test_settings()));
    let app = pxr_daemon::build_router(ctx);

    for uri in [
        "/random?format=nope",
        "/random?r18=9",
        "/random?attempts=99",
        "/random?strategy=hope",
        "/random?orientation=diagonal",
        "/random?quality_samples=0",
    ] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri={uri}");
        let body = body_json(response).await;
        assert_eq!(body["code"], "BAD_REQUEST");
    }
    Ok(())
}
