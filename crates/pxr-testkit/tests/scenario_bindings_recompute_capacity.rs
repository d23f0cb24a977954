//! Rendezvous recompute: strict capacity enforcement with diagnostics, soft
//! overflow assignment, and determinism across repeated runs.

use chrono::Utc;

use pxr_proxy::rendezvous::{recompute_token_proxy_bindings, RecomputeError};

async fn seed_five_tokens(pool: &sqlx::SqlitePool) {
    for i in 0..5 {
        pxr_db::tokens::insert_token(
            pool,
            Some(&format!("t{i}")),
            "enc",
            "****",
            1,
            true,
            &pxr_types::now_iso(),
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn strict_recompute_rejects_over_capacity_with_details() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let (pool_id, _endpoints) = pxr_testkit::seed_proxy_pool(&pool, 2).await;
    seed_five_tokens(&pool).await;

    // capacity = 2 endpoints * weight 1 * max_tokens_per_proxy 2 = 4 < 5.
    let err = recompute_token_proxy_bindings(&pool, pool_id, 2, true, Utc::now())
        .await
        .unwrap_err();
    let RecomputeError::Api(api) = err else {
        panic!("expected a BAD_REQUEST, got {err:?}");
    };
    assert_eq!(api.status, 400);
    let details = api.details.expect("capacity diagnostics");
    assert_eq!(details["token_count"], 5);
    assert_eq!(details["capacity"], 4);

    // No partial writes.
    let bindings = pxr_db::bindings::list_bindings(&pool, Some(pool_id)).await?;
    assert!(bindings.is_empty());

    Ok(())
}

#[tokio::test]
async fn soft_recompute_assigns_everyone_and_reports_overflow() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let (pool_id, endpoints) = pxr_testkit::seed_proxy_pool(&pool, 2).await;
    seed_five_tokens(&pool).await;

    let outcome = recompute_token_proxy_bindings(&pool, pool_id, 2, false, Utc::now()).await?;
    assert_eq!(outcome.recomputed, 5);
    assert_eq!(outcome.over_capacity_assigned, 1);
    assert_eq!(outcome.capacity, 4);

    let bindings = pxr_db::bindings::list_bindings(&pool, Some(pool_id)).await?;
    assert_eq!(bindings.len(), 5);
    for binding in &bindings {
        assert!(
            endpoints.contains(&binding.primary_proxy_id),
            "token {} bound outside the pool",
            binding.token_id
        );
        assert!(binding.override_proxy_id.is_none());
    }

    Ok(())
}

#[tokio::test]
async fn recompute_is_deterministic_and_clears_stale_overrides() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let (pool_id, endpoints) = pxr_testkit::seed_proxy_pool(&pool, 3).await;
    seed_five_tokens(&pool).await;

    recompute_token_proxy_bindings(&pool, pool_id, 2, true, Utc::now()).await?;
    let first = pxr_db::bindings::list_bindings(&pool, Some(pool_id)).await?;

    // Pin an override, then recompute again: same primaries, and the
    // override survives only while its primary is unchanged.
    let sample = &first[0];
    pxr_db::bindings::set_override(
        &pool,
        sample.token_id,
        pool_id,
        endpoints[0],
        "2999-01-01T00:00:00.000Z",
        &pxr_types::now_iso(),
    )
    .await?;

    recompute_token_proxy_bindings(&pool, pool_id, 2, true, Utc::now()).await?;
    let second = pxr_db::bindings::list_bindings(&pool, Some(pool_id)).await?;

    let primaries_first: Vec<(i64, i64)> =
        first.iter().map(|b| (b.token_id, b.primary_proxy_id)).collect();
    let primaries_second: Vec<(i64, i64)> =
        second.iter().map(|b| (b.token_id, b.primary_proxy_id)).collect();
    assert_eq!(primaries_first, primaries_second, "rendezvous is deterministic");

    let kept = second
        .iter()
        .find(|b| b.token_id == sample.token_id)
        .unwrap();
    assert_eq!(
        kept.override_proxy_id,
        Some(endpoints[0]),
        "override survives an identical recompute"
    );

    Ok(())
}
