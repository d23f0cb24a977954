//! One illust hydrates end to end: OAuth refresh (with rotation), App API
//! detail fetch, metadata + tag persistence, job completion, token health.

use httpmock::prelude::*;
use serde_json::json;

use pxr_jobs::handlers::build_default_dispatcher;

#[tokio::test]
async fn hydrate_persists_metadata_and_rotates_refresh_token() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let server = MockServer::start_async().await;

    let oauth_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/auth/token")
                .body_contains("refresh_token=rt_old");
            then.status(200).json_body(json!({
                "access_token": "at1",
                "refresh_token": "rt_new",
                "expires_in": 3600,
            }));
        })
        .await;
    let detail_mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/illust/detail")
                .query_param("illust_id", "111")
                .header("authorization", "Bearer at1");
            then.status(200).json_body(json!({
                "illust": {
                    "id": 111,
                    "page_count": 1,
                    "meta_single_page": {
                        "original_image_url":
                            "https://i.pximg.net/img-original/img/2020/01/01/00/00/00/111_p0.jpg"
                    },
                    "width": 1200,
                    "height": 800,
                    "x_restrict": 0,
                    "illust_ai_type": 1,
                    "illust_type": 0,
                    "user": {"id": 999, "name": "u"},
                    "title": "t",
                    "create_date": "2020-01-01T00:00:00+00:00",
                    "total_bookmarks": 5,
                    "total_view": 50,
                    "total_comments": 1,
                    "tags": [
                        {"name": "tag1", "translated_name": "t1"},
                        {"name": "tag2"}
                    ]
                }
            }));
        })
        .await;

    let ctx = pxr_testkit::test_job_context(
        pool.clone(),
        pxr_testkit::test_settings(),
        &server.base_url(),
        &server.base_url(),
    );
    let token_id = pxr_testkit::seed_token(&ctx, "rt_old").await;
    let image_id = pxr_testkit::seed_image(&pool, 111, 0, 0.5).await;

    pxr_db::jobs::enqueue_job(
        &pool,
        &pxr_db::jobs::NewJob {
            job_type: "hydrate_metadata",
            payload_json: r#"{"illust_id":111}"#,
            ..Default::default()
        },
        &pxr_types::now_iso(),
    )
    .await?;

    let dispatcher = build_default_dispatcher(ctx.clone());
    let job = pxr_testkit::claim_and_execute(&pool, &dispatcher, "w1")
        .await
        .expect("job claimed");

    oauth_mock.assert_async().await;
    detail_mock.assert_async().await;

    // Job completed.
    let job = pxr_db::jobs::get_job(&pool, job.id).await?.unwrap();
    assert_eq!(job.status, "completed");
    assert!(job.locked_by.is_none());

    // Image hydrated in place (same row, random_key untouched).
    let image = pxr_db::images::get_image_by_id(&pool, image_id).await?.unwrap();
    assert_eq!(image.width, Some(1200));
    assert_eq!(image.height, Some(800));
    assert_eq!(image.orientation, Some(2));
    assert_eq!(image.x_restrict, Some(0));
    assert_eq!(image.ai_type, Some(1));
    assert_eq!(image.illust_type, Some(0));
    assert_eq!(image.user_id, Some(999));
    assert_eq!(image.user_name.as_deref(), Some("u"));
    assert_eq!(image.title.as_deref(), Some("t"));
    assert_eq!(image.created_at_pixiv.as_deref(), Some("2020-01-01T00:00:00Z"));
    assert_eq!(image.bookmark_count, Some(5));
    assert_eq!(image.view_count, Some(50));
    assert_eq!(image.comment_count, Some(1));
    assert!((image.random_key - 0.5).abs() < 1e-9);
    assert_eq!(image.proxy_path, format!("/i/{image_id}.jpg"));

    // Tag set replaced.
    let tags = pxr_db::tags::get_tag_names_for_image(&pool, image_id).await?;
    assert_eq!(tags, vec!["tag1".to_string(), "tag2".to_string()]);

    // Token healthy, refresh token rotated and decryptable.
    let token = pxr_db::tokens::get_token(&pool, token_id).await?.unwrap();
    assert_eq!(token.error_count, 0);
    assert!(token.backoff_until.is_none());
    assert!(token.last_ok_at.is_some());
    let decrypted = ctx
        .encryptor
        .as_ref()
        .unwrap()
        .decrypt_text(&token.refresh_token_enc)
        .unwrap();
    assert_eq!(decrypted, "rt_new");
    assert_eq!(token.refresh_token_masked, pxr_crypto::mask_secret("rt_new"));

    Ok(())
}

#[tokio::test]
async fn missing_illust_goes_to_dlq() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(POST).path("/auth/token");
            then.status(200)
                .json_body(json!({"access_token": "at1", "expires_in": 3600}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/illust/detail");
            then.status(404).body(r#"{"error":{"message":"not found"}}"#);
        })
        .await;

    let ctx = pxr_testkit::test_job_context(
        pool.clone(),
        pxr_testkit::test_settings(),
        &server.base_url(),
        &server.base_url(),
    );
    pxr_testkit::seed_token(&ctx, "rt").await;

    pxr_db::jobs::enqueue_job(
        &pool,
        &pxr_db::jobs::NewJob {
            job_type: "hydrate_metadata",
            payload_json: r#"{"illust_id":404404}"#,
            ..Default::default()
        },
        &pxr_types::now_iso(),
    )
    .await?;

    let dispatcher = build_default_dispatcher(ctx);
    let job = pxr_testkit::claim_and_execute(&pool, &dispatcher, "w1")
        .await
        .expect("job claimed");

    let job = pxr_db::jobs::get_job(&pool, job.id).await?.unwrap();
    assert_eq!(job.status, "dlq", "a 404 illust can never succeed");
    assert!(job.last_error.unwrap().contains("not found"));

    Ok(())
}
