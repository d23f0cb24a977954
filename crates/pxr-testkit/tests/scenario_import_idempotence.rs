//! Import handler: line parsing, error capping, and idempotence. The second
//! run of an identical list dedupes everything.

use httpmock::MockServer;
use serde_json::json;

use pxr_jobs::handlers::build_default_dispatcher;

const URLS: &str = "\
https://i.pximg.net/img-original/img/2020/01/01/00/00/00/501_p0.jpg
https://i.pximg.net/img-original/img/2020/01/01/00/00/00/502_p0.png

https://i.pximg.net/img-original/img/2020/01/01/00/00/00/502_p1.png
not-a-url
";

async fn run_import(
    pool: &sqlx::SqlitePool,
    ctx: std::sync::Arc<pxr_jobs::JobContext>,
    text: &str,
    hydrate_on_import: bool,
) -> i64 {
    let import_id = pxr_db::imports::create_import(pool, "test", "inline", &pxr_types::now_iso())
        .await
        .unwrap();
    let payload = serde_json::to_string(&json!({
        "import_id": import_id,
        "text": text,
        "hydrate_on_import": hydrate_on_import,
    }))
    .unwrap();
    pxr_db::jobs::enqueue_job(
        pool,
        &pxr_db::jobs::NewJob {
            job_type: "import_images",
            payload_json: &payload,
            ref_type: Some("import"),
            ref_id: Some(&import_id.to_string()),
            ..Default::default()
        },
        &pxr_types::now_iso(),
    )
    .await
    .unwrap();

    let dispatcher = build_default_dispatcher(ctx);
    pxr_testkit::claim_and_execute(pool, &dispatcher, "w1")
        .await
        .expect("import job claimed");
    import_id
}

#[tokio::test]
async fn import_parses_counts_and_is_idempotent() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let server = MockServer::start_async().await;
    let ctx = pxr_testkit::test_job_context(
        pool.clone(),
        pxr_testkit::test_settings(),
        &server.base_url(),
        &server.base_url(),
    );

    // First run: three URLs land, one line fails.
    let first = run_import(&pool, ctx.clone(), URLS, false).await;
    let import = pxr_db::imports::get_import(&pool, first).await?.unwrap();
    assert_eq!(import.total, 4, "blank lines are skipped");
    assert_eq!(import.accepted, 3);
    assert_eq!(import.success, 3);
    assert_eq!(import.failed, 1);
    let detail: serde_json::Value = serde_json::from_str(import.detail_json.as_deref().unwrap())?;
    assert_eq!(detail["deduped"], 0);
    assert_eq!(detail["errors"][0]["code"], "unsupported_url");
    assert_eq!(detail["errors"][0]["line"], 5, "line numbers count blank lines");

    // Rows exist with stamped proxy paths.
    let image = pxr_db::images::get_image_by_illust_page(&pool, 502, 1).await?.unwrap();
    assert_eq!(image.ext, "png");
    assert_eq!(image.proxy_path, format!("/i/{}.png", image.id));
    let original_key = image.random_key;

    // Second run of the identical list: everything dedupes, nothing rewrites.
    let second = run_import(&pool, ctx, URLS, false).await;
    let import = pxr_db::imports::get_import(&pool, second).await?.unwrap();
    assert_eq!(import.total, 4);
    assert_eq!(import.success, 0);
    assert_eq!(import.failed, 1);
    let detail: serde_json::Value = serde_json::from_str(import.detail_json.as_deref().unwrap())?;
    assert_eq!(detail["deduped"], 3);

    let image = pxr_db::images::get_image_by_illust_page(&pool, 502, 1).await?.unwrap();
    assert!((image.random_key - original_key).abs() < 1e-12, "random_key is immutable");

    Ok(())
}

#[tokio::test]
async fn hydrate_on_import_enqueues_one_job_per_illust() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let server = MockServer::start_async().await;
    let ctx = pxr_testkit::test_job_context(
        pool.clone(),
        pxr_testkit::test_settings(),
        &server.base_url(),
        &server.base_url(),
    );

    let import_id = run_import(&pool, ctx, URLS, true).await;

    // 501 and 502 (two pages, one illust) → two hydrate jobs.
    let jobs = pxr_db::jobs::list_jobs(&pool, Some("pending"), Some("hydrate_metadata"), 100).await?;
    let mut refs: Vec<String> = jobs.iter().filter_map(|j| j.ref_id.clone()).collect();
    refs.sort();
    assert_eq!(
        refs,
        vec![format!("{import_id}:501"), format!("{import_id}:502")]
    );

    Ok(())
}

#[tokio::test]
async fn opportunistic_enqueue_is_idempotent_across_callers() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;

    let first = pxr_jobs::handlers::enqueue_opportunistic_hydrate(&pool, 4242, "random").await?;
    let second = pxr_jobs::handlers::enqueue_opportunistic_hydrate(&pool, 4242, "image_proxy").await?;
    assert!(first.is_some());
    assert!(second.is_none(), "concurrent serves enqueue at most one job");

    let jobs = pxr_db::jobs::list_jobs(&pool, Some("pending"), Some("hydrate_metadata"), 10).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].priority, pxr_db::jobs::OPPORTUNISTIC_PRIORITY);
    assert_eq!(jobs[0].ref_id.as_deref(), Some("4242"));

    Ok(())
}
