//! Rate-limited App API responses taint the token and defer the job to the
//! token's backoff horizon without consuming an attempt.

use httpmock::prelude::*;
use serde_json::json;

use pxr_jobs::handlers::build_default_dispatcher;

#[tokio::test]
async fn rate_limit_backs_off_token_and_defers_job() -> anyhow::Result<()> {
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
            then.status(403).body(r#"{"error":{"message":"Rate Limit"}}"#);
        })
        .await;

    let ctx = pxr_testkit::test_job_context(
        pool.clone(),
        pxr_testkit::test_settings(),
        &server.base_url(),
        &server.base_url(),
    );
    let token_id = pxr_testkit::seed_token(&ctx, "rt").await;

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

    let before = chrono::Utc::now();
    let dispatcher = build_default_dispatcher(ctx);
    let job = pxr_testkit::claim_and_execute(&pool, &dispatcher, "w1")
        .await
        .expect("job claimed");

    // Token: one classified failure, gated by backoff.
    let token = pxr_db::tokens::get_token(&pool, token_id).await?.unwrap();
    assert_eq!(token.error_count, 1);
    assert_eq!(token.last_error_code.as_deref(), Some("TOKEN_BACKOFF"));
    let backoff_until = token.backoff_until.expect("backoff applied");

    // Job: deferred (failed + run_after), attempt NOT consumed.
    let job = pxr_db::jobs::get_job(&pool, job.id).await?.unwrap();
    assert_eq!(job.status, "failed");
    assert_eq!(job.attempt, 0, "defer must not consume an attempt");
    let run_after = job.run_after.expect("run_after set");

    let lo = pxr_types::iso_utc_ms(before + chrono::Duration::seconds(10));
    let hi = pxr_types::iso_utc_ms(before + chrono::Duration::seconds(180));
    assert!(run_after > lo && run_after < hi, "run_after={run_after}");
    assert_eq!(run_after, backoff_until, "job waits for the token to recover");

    Ok(())
}

#[tokio::test]
async fn no_enabled_token_defers_with_no_token_available() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let server = MockServer::start_async().await;

    let ctx = pxr_testkit::test_job_context(
        pool.clone(),
        pxr_testkit::test_settings(),
        &server.base_url(),
        &server.base_url(),
    );

    pxr_db::jobs::enqueue_job(
        &pool,
        &pxr_db::jobs::NewJob {
            job_type: "hydrate_metadata",
            payload_json: r#"{"illust_id":1}"#,
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
    assert_eq!(job.status, "failed");
    assert_eq!(job.attempt, 0);
    assert!(job.run_after.is_some());
    assert!(job.last_error.unwrap().contains("NO_TOKEN_AVAILABLE"));

    Ok(())
}
