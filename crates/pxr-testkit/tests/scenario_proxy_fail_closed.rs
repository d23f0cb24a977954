//! Proxy selection discipline: fail-closed diagnostics, blacklist gating,
//! override preference, and breaker accounting.

use chrono::{Duration, Utc};

use pxr_db::settings::RuntimeConfig;
use pxr_proxy::routing::{select_proxy_uri_for_url, ProxySelectError};
use pxr_proxy::BreakerConfig;
use pxr_types::{iso_utc_ms, now_iso};

fn proxied_runtime() -> RuntimeConfig {
    RuntimeConfig {
        proxy_enabled: true,
        proxy_fail_closed: true,
        proxy_route_mode: "pixiv_only".to_string(),
        ..Default::default()
    }
}

const APP_API_URL: &str = "https://app-api.pixiv.net/v1/illust/detail";

#[tokio::test]
async fn fail_closed_raises_proxy_required_with_pool_stats() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let runtime = proxied_runtime();

    // No pools at all.
    let err = select_proxy_uri_for_url(&pool, None, &runtime, APP_API_URL, None, &now_iso())
        .await
        .unwrap_err();
    let ProxySelectError::Api(api) = err else {
        panic!("expected fail-closed ApiError");
    };
    assert_eq!(api.code.as_str(), "PROXY_REQUIRED");
    assert_eq!(api.status, 502);
    assert_eq!(api.details.as_ref().unwrap()["reason"], "no_proxy_pool_configured");

    // A pool whose only endpoint is blacklisted reports the recovery time.
    let (_pool_id, endpoints) = pxr_testkit::seed_proxy_pool(&pool, 1).await;
    let until = iso_utc_ms(Utc::now() + Duration::minutes(10));
    sqlx::query("UPDATE proxy_endpoints SET blacklisted_until = ? WHERE id = ?")
        .bind(&until)
        .bind(endpoints[0])
        .execute(&pool)
        .await?;

    let err = select_proxy_uri_for_url(&pool, None, &runtime, APP_API_URL, None, &now_iso())
        .await
        .unwrap_err();
    let ProxySelectError::Api(api) = err else {
        panic!("expected fail-closed ApiError");
    };
    let details = api.details.unwrap();
    assert_eq!(details["reason"], "all_endpoints_blacklisted");
    assert_eq!(details["endpoints_total"], 1);
    assert_eq!(details["endpoints_eligible"], 0);
    assert_eq!(details["next_available_at"], until);

    Ok(())
}

#[tokio::test]
async fn non_pixiv_hosts_bypass_and_fail_open_mode_returns_none() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;

    let runtime = proxied_runtime();
    let picked = select_proxy_uri_for_url(
        &pool,
        None,
        &runtime,
        "https://example.com/x.jpg",
        None,
        &now_iso(),
    )
    .await?;
    assert!(picked.is_none(), "pixiv_only ignores foreign hosts");

    let mut open = proxied_runtime();
    open.proxy_fail_closed = false;
    let picked =
        select_proxy_uri_for_url(&pool, None, &open, APP_API_URL, None, &now_iso()).await?;
    assert!(picked.is_none(), "fail-open degrades to direct");

    Ok(())
}

#[tokio::test]
async fn active_override_wins_until_it_expires() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let (pool_id, endpoints) = pxr_testkit::seed_proxy_pool(&pool, 2).await;
    let token_id = pxr_db::tokens::insert_token(
        &pool, Some("t"), "enc", "****", 1, true, &now_iso(),
    )
    .await?;
    pxr_db::bindings::upsert_binding_primary(&pool, token_id, pool_id, endpoints[0], &now_iso())
        .await?;

    let runtime = proxied_runtime();

    // Primary wins with no override.
    let picked =
        select_proxy_uri_for_url(&pool, None, &runtime, APP_API_URL, Some(token_id), &now_iso())
            .await?
            .expect("proxy selected");
    assert_eq!(picked.endpoint_id, endpoints[0]);

    // Sticky override redirects to the observed-good endpoint.
    let breaker = BreakerConfig::hydrate_default();
    pxr_proxy::breaker::set_sticky_override(
        &pool, &breaker, token_id, pool_id, endpoints[1], Utc::now(),
    )
    .await?;
    let picked =
        select_proxy_uri_for_url(&pool, None, &runtime, APP_API_URL, Some(token_id), &now_iso())
            .await?
            .expect("proxy selected");
    assert_eq!(picked.endpoint_id, endpoints[1]);

    // An expired override falls back to the primary.
    let past = iso_utc_ms(Utc::now() - Duration::minutes(1));
    sqlx::query(
        "UPDATE token_proxy_bindings SET override_expires_at = ? WHERE token_id = ? AND pool_id = ?",
    )
    .bind(&past)
    .bind(token_id)
    .bind(pool_id)
    .execute(&pool)
    .await?;
    let picked =
        select_proxy_uri_for_url(&pool, None, &runtime, APP_API_URL, Some(token_id), &now_iso())
            .await?
            .expect("proxy selected");
    assert_eq!(picked.endpoint_id, endpoints[0]);

    Ok(())
}

#[tokio::test]
async fn breaker_marks_extend_but_never_shorten_blacklists() -> anyhow::Result<()> {
    let pool = pxr_testkit::memory_pool().await;
    let (_pool_id, endpoints) = pxr_testkit::seed_proxy_pool(&pool, 1).await;
    let endpoint_id = endpoints[0];

    let long = BreakerConfig {
        blacklist_ttl_s: 1800,
        override_ttl_s: 1800,
    };
    let short = BreakerConfig::hydrate_default();

    let now = Utc::now();
    pxr_proxy::breaker::mark_fail(&pool, &long, endpoint_id, Some(12.5), "timeout", now).await?;
    let endpoint = pxr_db::proxies::get_endpoint(&pool, endpoint_id).await?.unwrap();
    let first_until = endpoint.blacklisted_until.clone().unwrap();
    assert_eq!(endpoint.failure_count, 1);
    assert_eq!(endpoint.last_error.as_deref(), Some("timeout"));

    // A shorter-TTL failure must not pull the blacklist earlier.
    pxr_proxy::breaker::mark_fail(&pool, &short, endpoint_id, Some(9.0), "again", now).await?;
    let endpoint = pxr_db::proxies::get_endpoint(&pool, endpoint_id).await?.unwrap();
    assert_eq!(endpoint.blacklisted_until.as_deref(), Some(first_until.as_str()));
    assert_eq!(endpoint.failure_count, 2);

    // Success clears everything.
    pxr_proxy::breaker::mark_ok(&pool, endpoint_id, Some(5.0), Utc::now()).await?;
    let endpoint = pxr_db::proxies::get_endpoint(&pool, endpoint_id).await?.unwrap();
    assert!(endpoint.blacklisted_until.is_none());
    assert!(endpoint.last_error.is_none());
    assert_eq!(endpoint.success_count, 1);

    Ok(())
}
