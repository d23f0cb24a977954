use pxr_db::jobs::{self, NewJob};

async fn memory_pool() -> sqlx::SqlitePool {
    let pool = pxr_db::connect("sqlite::memory:").await.unwrap();
    pxr_db::migrate(&pool).await.unwrap();
    pool
}

#[tokio::test]
async fn only_one_worker_wins_a_job() -> anyhow::Result<()> {
    let pool = memory_pool().await;
    let now = "2024-06-01T00:00:00.000Z";

    jobs::enqueue_job(
        &pool,
        &NewJob {
            job_type: "hydrate_metadata",
            payload_json: r#"{"illust_id":1}"#,
            ..Default::default()
        },
        now,
    )
    .await?;

    let a = jobs::claim_next_job(&pool, "worker-a", now).await?;
    let b = jobs::claim_next_job(&pool, "worker-b", now).await?;

    let a = a.expect("first claim wins");
    assert_eq!(a.status, "running");
    assert_eq!(a.locked_by.as_deref(), Some("worker-a"));
    assert!(b.is_none(), "second claim must see nothing");

    Ok(())
}

#[tokio::test]
async fn claim_respects_run_after_and_priority() -> anyhow::Result<()> {
    let pool = memory_pool().await;
    let now = "2024-06-01T00:00:00.000Z";

    // Deferred into the future: not claimable yet.
    jobs::enqueue_job(
        &pool,
        &NewJob {
            job_type: "import_images",
            payload_json: "{}",
            run_after: Some("2024-06-01T01:00:00.000Z"),
            ..Default::default()
        },
        now,
    )
    .await?;
    // Lower priority value claims first even though it enqueued later.
    jobs::enqueue_job(
        &pool,
        &NewJob {
            job_type: "hydrate_metadata",
            payload_json: "{}",
            priority: 5,
            ..Default::default()
        },
        now,
    )
    .await?;
    jobs::enqueue_job(
        &pool,
        &NewJob {
            job_type: "hydrate_metadata",
            payload_json: "{}",
            priority: jobs::OPPORTUNISTIC_PRIORITY,
            ..Default::default()
        },
        now,
    )
    .await?;

    let first = jobs::claim_next_job(&pool, "w", now).await?.unwrap();
    assert_eq!(first.priority, jobs::OPPORTUNISTIC_PRIORITY);

    let second = jobs::claim_next_job(&pool, "w", now).await?.unwrap();
    assert_eq!(second.priority, 5);

    assert!(jobs::claim_next_job(&pool, "w", now).await?.is_none());

    // Once the clock passes run_after, the deferred job becomes claimable.
    let later = "2024-06-01T01:00:00.000Z";
    let third = jobs::claim_next_job(&pool, "w", later).await?.unwrap();
    assert_eq!(third.job_type, "import_images");

    Ok(())
}

#[tokio::test]
async fn stale_lease_returns_job_to_pending_with_attempt_preserved() -> anyhow::Result<()> {
    let pool = memory_pool().await;
    let now = "2024-06-01T00:00:00.000Z";

    jobs::enqueue_job(
        &pool,
        &NewJob {
            job_type: "hydrate_metadata",
            payload_json: "{}",
            ..Default::default()
        },
        now,
    )
    .await?;

    let claimed = jobs::claim_next_job(&pool, "crashed-worker", now).await?.unwrap();
    // Record a recoverable failure then re-claim to get attempt=1 running.
    jobs::fail_job_recoverable(
        &pool,
        claimed.id,
        "crashed-worker",
        1,
        now,
        "network glitch",
        now,
    )
    .await?;
    jobs::promote_due_failed(&pool, now).await?;
    let reclaimed = jobs::claim_next_job(&pool, "crashed-worker", now).await?.unwrap();
    assert_eq!(reclaimed.attempt, 1);

    // Worker dies; lease expires; sweep returns it to pending.
    let cutoff = "2024-06-01T00:02:00.000Z";
    let swept = jobs::sweep_stale_leases(&pool, cutoff, cutoff).await?;
    assert_eq!(swept, 1);

    let job = jobs::get_job(&pool, claimed.id).await?.unwrap();
    assert_eq!(job.status, "pending");
    assert_eq!(job.attempt, 1, "lease loss must not consume an attempt");
    assert!(job.locked_by.is_none());

    Ok(())
}

#[tokio::test]
async fn unique_ref_enqueue_is_idempotent_while_pending() -> anyhow::Result<()> {
    let pool = memory_pool().await;
    let now = "2024-06-01T00:00:00.000Z";

    let job = NewJob {
        job_type: "hydrate_metadata",
        payload_json: r#"{"illust_id":42,"reason":"random"}"#,
        priority: jobs::OPPORTUNISTIC_PRIORITY,
        ref_type: Some("opportunistic_hydrate"),
        ref_id: Some("42"),
        ..Default::default()
    };

    let first = jobs::enqueue_job_unique_ref(&pool, &job, now).await?;
    let second = jobs::enqueue_job_unique_ref(&pool, &job, now).await?;
    assert!(first.is_some());
    assert!(second.is_none(), "duplicate enqueue must be a no-op");

    // After the first completes, a new enqueue is allowed again.
    let claimed = jobs::claim_next_job(&pool, "w", now).await?.unwrap();
    jobs::complete_job(&pool, claimed.id, "w", now).await?;
    let third = jobs::enqueue_job_unique_ref(&pool, &job, now).await?;
    assert!(third.is_some());

    Ok(())
}

#[tokio::test]
async fn admin_retry_preserves_attempt_and_clears_run_after() -> anyhow::Result<()> {
    let pool = memory_pool().await;
    let now = "2024-06-01T00:00:00.000Z";

    jobs::enqueue_job(
        &pool,
        &NewJob {
            job_type: "proxy_probe",
            payload_json: "{}",
            max_attempts: Some(1),
            ..Default::default()
        },
        now,
    )
    .await?;
    let claimed = jobs::claim_next_job(&pool, "w", now).await?.unwrap();
    jobs::fail_job_dlq(&pool, claimed.id, "w", 1, "boom", now).await?;

    let job = jobs::get_job(&pool, claimed.id).await?.unwrap();
    assert_eq!(job.status, "dlq");

    assert!(jobs::retry_job(&pool, claimed.id, now).await?);
    let job = jobs::get_job(&pool, claimed.id).await?.unwrap();
    assert_eq!(job.status, "pending");
    assert_eq!(job.attempt, 1);
    assert!(job.run_after.is_none());

    Ok(())
}
