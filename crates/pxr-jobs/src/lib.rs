//! Background job machinery: the handler registry, the executor that maps
//! handler outcomes onto job-store transitions, the worker scheduler, and
//! the built-in handlers (hydrate / import / probe).

use std::sync::Arc;

use sqlx::SqlitePool;

use pxr_config::Settings;
use pxr_crypto::FieldEncryptor;
use pxr_pixiv::backoff::BackoffPolicy;
use pxr_pixiv::client::AppApiClient;
use pxr_pixiv::oauth::PixivOauthConfig;
use pxr_pixiv::throttle::PixivThrottle;
use pxr_pixiv::token_cache::AccessTokenCache;
use pxr_pixiv::token_strategy::Strategy;
use pxr_proxy::BreakerConfig;

pub mod dispatch;
pub mod executor;
pub mod handlers;
pub mod scheduler;

pub use dispatch::{HandlerError, HandlerOutcome, JobDispatcher, JobHandler};

fn env_i64(name: &str, default: i64, min: i64, max: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

/// Hydration tuning knobs (env-derived, clamped).
#[derive(Debug, Clone)]
pub struct HydrateKnobs {
    pub proxy_failover_attempts: i64,
    pub recoverable_defer_base_s: i64,
    pub recoverable_defer_jitter_s: i64,
    pub run_batch_size: i64,
    /// Throttle defaults when runtime settings carry no `rate_limit.*` keys.
    /// Test contexts zero these so nothing sleeps.
    pub default_min_interval_ms: i64,
    pub default_jitter_ms: i64,
}

impl HydrateKnobs {
    pub fn from_env() -> Self {
        Self {
            proxy_failover_attempts: env_i64("HYDRATE_PROXY_FAILOVER_ATTEMPTS", 4, 0, 50),
            recoverable_defer_base_s: env_i64("HYDRATE_RECOVERABLE_DEFER_BASE_S", 20, 1, 86_400),
            recoverable_defer_jitter_s: env_i64("HYDRATE_RECOVERABLE_DEFER_JITTER_S", 20, 0, 86_400),
            run_batch_size: env_i64("HYDRATION_RUN_BATCH_SIZE", 10, 1, 200),
            default_min_interval_ms: 800,
            default_jitter_ms: 200,
        }
    }

    /// No sleeping, no failover fan-out; used by tests.
    pub fn fast_for_tests() -> Self {
        Self {
            default_min_interval_ms: 0,
            default_jitter_ms: 0,
            recoverable_defer_jitter_s: 0,
            ..Self::from_env()
        }
    }
}

/// Shared dependencies for job handlers; one per worker process, threaded
/// explicitly rather than living in a global.
pub struct JobContext {
    pub pool: SqlitePool,
    pub settings: Settings,
    pub encryptor: Option<FieldEncryptor>,
    pub app_api: AppApiClient,
    pub token_cache: AccessTokenCache,
    pub throttle: PixivThrottle,
    pub backoff: BackoffPolicy,
    pub breaker: BreakerConfig,
    pub knobs: HydrateKnobs,
    pub token_strategy: Strategy,
}

impl JobContext {
    pub fn new(pool: SqlitePool, settings: Settings) -> Arc<Self> {
        let encryptor = if settings.field_encryption_key.is_empty() {
            None
        } else {
            FieldEncryptor::from_key(&settings.field_encryption_key).ok()
        };
        let oauth = PixivOauthConfig::new(
            &settings.pixiv_oauth_client_id,
            &settings.pixiv_oauth_client_secret,
            Some(&settings.pixiv_oauth_hash_secret),
        );
        let breaker = BreakerConfig {
            blacklist_ttl_s: env_i64("HYDRATE_PROXY_BLACKLIST_TTL_S", 300, 0, 86_400),
            override_ttl_s: env_i64("HYDRATE_PROXY_OVERRIDE_TTL_S", 1800, 0, 7 * 86_400),
        };
        Arc::new(Self {
            pool,
            settings,
            encryptor,
            app_api: AppApiClient::new(oauth),
            token_cache: AccessTokenCache::new(),
            throttle: PixivThrottle::new(),
            backoff: BackoffPolicy::default(),
            breaker,
            knobs: HydrateKnobs::from_env(),
            token_strategy: Strategy::LeastError,
        })
    }
}
