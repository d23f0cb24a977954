//! Shared fixtures for the end-to-end scenario tests: in-memory store
//! bootstrap, deterministic settings, seeders, and a fully wired job
//! context pointing at mock upstreams.

use std::sync::Arc;

use sqlx::SqlitePool;

use pxr_config::Settings;
use pxr_crypto::FieldEncryptor;
use pxr_jobs::{HydrateKnobs, JobContext};
use pxr_pixiv::backoff::BackoffPolicy;
use pxr_pixiv::client::AppApiClient;
use pxr_pixiv::oauth::PixivOauthConfig;
use pxr_pixiv::throttle::PixivThrottle;
use pxr_pixiv::token_cache::AccessTokenCache;
use pxr_pixiv::token_strategy::Strategy;
use pxr_proxy::BreakerConfig;
use pxr_types::now_iso;

/// Fresh in-memory store with the schema applied.
pub async fn memory_pool() -> SqlitePool {
    let pool = pxr_db::connect("sqlite::memory:").await.expect("open sqlite");
    pxr_db::migrate(&pool).await.expect("migrate");
    pool
}

/// Deterministic settings with a throwaway encryption key; no env access.
pub fn test_settings() -> Settings {
    Settings {
        app_env: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        secret_key: "test-secret".to_string(),
        field_encryption_key: FieldEncryptor::generate_key(),
        admin_username: "admin".to_string(),
        admin_password: "admin-pass".to_string(),
        pixiv_oauth_client_id: "cid".to_string(),
        pixiv_oauth_client_secret: "csecret".to_string(),
        pixiv_oauth_hash_secret: "hsecret".to_string(),
        imgproxy_base_url: String::new(),
        imgproxy_key: String::new(),
        imgproxy_salt: String::new(),
        imgproxy_max_dim: 2048,
        imgproxy_default_options: String::new(),
        imgproxy_url_chunk_size: 16,
        public_api_key_required: false,
        public_api_key_rpm: 0,
        public_api_key_burst: 0,
        import_max_bytes: 5_000_000,
        import_inline_max_accepted: 50_000,
    }
}

/// Job context wired to mock upstream base URLs, with sleeping disabled.
pub fn test_job_context(
    pool: SqlitePool,
    settings: Settings,
    oauth_base_url: &str,
    app_api_base_url: &str,
) -> Arc<JobContext> {
    let encryptor = FieldEncryptor::from_key(&settings.field_encryption_key).ok();
    let mut oauth = PixivOauthConfig::new(
        &settings.pixiv_oauth_client_id,
        &settings.pixiv_oauth_client_secret,
        Some(&settings.pixiv_oauth_hash_secret),
    );
    oauth.base_url = oauth_base_url.to_string();
    let mut app_api = AppApiClient::new(oauth);
    app_api.base_url = app_api_base_url.to_string();

    Arc::new(JobContext {
        pool,
        settings,
        encryptor,
        app_api,
        token_cache: AccessTokenCache::new(),
        throttle: PixivThrottle::new(),
        backoff: BackoffPolicy::default(),
        breaker: BreakerConfig::hydrate_default(),
        knobs: HydrateKnobs::fast_for_tests(),
        token_strategy: Strategy::LeastError,
    })
}

/// Insert an enabled token whose stored refresh token decrypts to
/// `refresh_token`.
pub async fn seed_token(ctx: &JobContext, refresh_token: &str) -> i64 {
    let encryptor = ctx.encryptor.as_ref().expect("test encryptor");
    let enc = encryptor.encrypt_text(refresh_token).expect("encrypt");
    pxr_db::tokens::insert_token(
        &ctx.pool,
        Some("test"),
        &enc,
        &pxr_crypto::mask_secret(refresh_token),
        1,
        true,
        &now_iso(),
    )
    .await
    .expect("seed token")
}

/// Insert a bare image row (no metadata) and stamp its proxy path.
pub async fn seed_image(pool: &SqlitePool, illust_id: i64, page_index: i64, random_key: f64) -> i64 {
    let url = format!(
        "https://i.pximg.net/img-original/img/2020/01/01/00/00/00/{illust_id}_p{page_index}.jpg"
    );
    let id = pxr_db::images::upsert_image_by_illust_page(
        pool,
        illust_id,
        page_index,
        "jpg",
        &url,
        random_key,
        None,
        &now_iso(),
    )
    .await
    .expect("seed image");
    pxr_db::images::set_proxy_path(pool, id, &format!("/i/{id}.jpg"))
        .await
        .expect("proxy path");
    id
}

/// Attach `names` as the image's tag set.
pub async fn seed_tags(pool: &SqlitePool, image_id: i64, names: &[&str]) {
    let mut tag_ids = Vec::new();
    for name in names {
        tag_ids.push(
            pxr_db::tags::upsert_tag(pool, name, None, &now_iso())
                .await
                .expect("tag"),
        );
    }
    pxr_db::tags::replace_image_tags(pool, &[image_id], &tag_ids)
        .await
        .expect("image tags");
}

/// Pool with `endpoint_count` enabled endpoints at weight 1; returns
/// `(pool_id, endpoint_ids)`.
pub async fn seed_proxy_pool(pool: &SqlitePool, endpoint_count: usize) -> (i64, Vec<i64>) {
    let pool_id = pxr_db::proxies::create_pool(pool, "test-pool", None, &now_iso())
        .await
        .expect("pool");
    let mut endpoint_ids = Vec::new();
    for i in 0..endpoint_count {
        let endpoint_id = pxr_db::proxies::create_endpoint(
            pool,
            "http",
            &format!("proxy{i}.test"),
            8000 + i as i64,
            "",
            "",
            "manual",
            None,
            &now_iso(),
        )
        .await
        .expect("endpoint");
        pxr_db::proxies::attach_endpoint(pool, pool_id, endpoint_id, 1)
            .await
            .expect("attach");
        endpoint_ids.push(endpoint_id);
    }
    (pool_id, endpoint_ids)
}

/// Claim the next job as `worker_id` and run it through the executor with
/// the given dispatcher, mirroring one scheduler slot.
pub async fn claim_and_execute(
    pool: &SqlitePool,
    dispatcher: &pxr_jobs::JobDispatcher,
    worker_id: &str,
) -> Option<pxr_db::JobRow> {
    let job = pxr_db::jobs::claim_next_job(pool, worker_id, &now_iso())
        .await
        .expect("claim")?;
    pxr_jobs::executor::execute_claimed_job(
        pool,
        dispatcher,
        &job,
        worker_id,
        &pxr_jobs::executor::RetryPolicy::default(),
    )
    .await
    .expect("execute");
    Some(job)
}
