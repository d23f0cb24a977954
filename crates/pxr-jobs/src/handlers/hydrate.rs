//! Metadata hydration: fetch one illust's detail through the token / proxy
//! machinery and persist it, or drive a criteria-based backfill run batch.
//!
//! The single-illust loop walks up to ten tokens. Per token it refreshes the
//! access token (itself failing over across proxies and rotating the stored
//! refresh token), then fetches the detail with proxy failover, marking every
//! endpoint observation in the circuit breaker and pinning a sticky override
//! after success. Failure classification decides between trying the next
//! token, deferring the job, and dead-lettering it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use pxr_config::redact_text;
use pxr_db::images::HydratedMeta;
use pxr_db::hydration::{PersistIllust, PersistPage};
use pxr_db::runs::{self, RunCriteria};
use pxr_db::settings::{load_runtime_config, RuntimeConfig};
use pxr_db::JobRow;
use pxr_pixiv::backoff::classify_rate_limit;
use pxr_pixiv::client::FetchError;
use pxr_pixiv::oauth::{refresh_access_token, OauthError, RefreshedToken};
use pxr_pixiv::token_strategy::{choose_token, TokenCandidate};
use pxr_pixiv::types::{parse_illust_detail, ParsedIllust};
use pxr_proxy::routing::{select_proxy_uri_for_url, ProxySelectError, ProxyUri};
use pxr_types::{iso_utc_ms, parse_iso_utc, ApiError, ErrorCode};

use crate::dispatch::{HandlerError, HandlerOutcome, JobHandler};
use crate::JobContext;

const MAX_TOKEN_TRIES: usize = 10;

#[derive(Debug, Deserialize)]
struct HydratePayload {
    #[serde(default)]
    illust_id: Option<i64>,
    #[serde(default)]
    hydration_run_id: Option<i64>,
    #[serde(default)]
    #[allow(dead_code)]
    reason: Option<String>,
}

/// One failed step inside the token loop; drives the final classification.
#[derive(Debug)]
enum AttemptError {
    TokenDisabled,
    /// Fail-closed proxy selection; carries the diagnostics (incl.
    /// `next_available_at`).
    ProxyRequired(ApiError),
    Network(String),
    Server(u16),
    /// Token was rate limited; backoff already applied to the token.
    RateLimited { backoff_until: Option<String> },
    /// OAuth rejected the credential; backoff already applied to the token.
    RefreshRejected(String),
    Other(String),
}

impl AttemptError {
    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AttemptError::ProxyRequired(_)
                | AttemptError::Network(_)
                | AttemptError::Server(_)
                | AttemptError::RateLimited { .. }
        )
    }
}

/// Failure of the (singleflight) refresh path.
#[derive(Debug)]
enum RefreshError {
    Disabled,
    NotFound,
    EncryptionUnavailable,
    ProxyRequired(ApiError),
    /// Transport / 5xx; worth trying the next token.
    Recoverable(String),
    /// 4xx from the OAuth host: the credential itself is rejected.
    Rejected { status: Option<u16>, msg: String },
    Db(String),
}

pub struct HydrateMetadataHandler {
    ctx: Arc<JobContext>,
    last_token_id: Mutex<Option<i64>>,
}

impl HydrateMetadataHandler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self {
            ctx,
            last_token_id: Mutex::new(None),
        }
    }

    // -- token selection ----------------------------------------------------

    async fn load_candidates(&self) -> Result<Vec<TokenCandidate>, HandlerError> {
        let rows = pxr_db::tokens::list_tokens(&self.ctx.pool)
            .await
            .map_err(HandlerError::from)?;
        Ok(rows
            .into_iter()
            .map(|row| TokenCandidate {
                id: row.id,
                enabled: row.enabled,
                weight: row.weight,
                error_count: row.error_count,
                backoff_until: row
                    .backoff_until
                    .as_deref()
                    .and_then(parse_iso_utc)
                    .map(|dt| dt.timestamp() as f64),
                last_ok_at: row
                    .last_ok_at
                    .as_deref()
                    .and_then(parse_iso_utc)
                    .map(|dt| dt.timestamp() as f64),
            })
            .collect())
    }

    /// `Err(retry_at)` when no token is eligible right now.
    async fn choose_token_id(
        &self,
        now_epoch: f64,
        exclude: &[i64],
    ) -> Result<Result<i64, String>, HandlerError> {
        let candidates = self.load_candidates().await?;
        let mut last = self.last_token_id.lock().await;
        let roll = rand::thread_rng().gen_range(0.0..1.0);
        match choose_token(
            &candidates,
            self.ctx.token_strategy,
            now_epoch,
            *last,
            roll,
            exclude,
        ) {
            Ok(token_id) => {
                *last = Some(token_id);
                Ok(Ok(token_id))
            }
            Err(unavailable) => {
                let retry_epoch = unavailable.next_retry_at.unwrap_or(now_epoch + 60.0);
                let retry_at = DateTime::<Utc>::from_timestamp(retry_epoch as i64, 0)
                    .map(iso_utc_ms)
                    .unwrap_or_else(|| iso_utc_ms(Utc::now() + Duration::seconds(60)));
                Ok(Err(retry_at))
            }
        }
    }

    // -- proxy plumbing -----------------------------------------------------

    async fn select_proxy(
        &self,
        runtime: &RuntimeConfig,
        url: &str,
        token_id: i64,
    ) -> Result<Option<ProxyUri>, AttemptError> {
        match select_proxy_uri_for_url(
            &self.ctx.pool,
            self.ctx.encryptor.as_ref(),
            runtime,
            url,
            Some(token_id),
            &iso_utc_ms(Utc::now()),
        )
        .await
        {
            Ok(picked) => Ok(picked),
            Err(ProxySelectError::Api(api)) => Err(AttemptError::ProxyRequired(api)),
            Err(ProxySelectError::Db(err)) => Err(AttemptError::Other(format!("{err:#}"))),
        }
    }

    async fn mark_proxy_ok(&self, proxy: &ProxyUri, latency_ms: f64, now: DateTime<Utc>) {
        if let Err(err) =
            pxr_proxy::breaker::mark_ok(&self.ctx.pool, proxy.endpoint_id, Some(latency_ms), now)
                .await
        {
            tracing::warn!("proxy_mark_ok_failed endpoint={} err={err:#}", proxy.endpoint_id);
        }
    }

    async fn mark_proxy_fail(
        &self,
        proxy: &ProxyUri,
        latency_ms: f64,
        error: &str,
        now: DateTime<Utc>,
    ) {
        if let Err(err) = pxr_proxy::breaker::mark_fail(
            &self.ctx.pool,
            &self.ctx.breaker,
            proxy.endpoint_id,
            Some(latency_ms),
            &redact_text(error),
            now,
        )
        .await
        {
            tracing::warn!("proxy_mark_fail_failed endpoint={} err={err:#}", proxy.endpoint_id);
        }
    }

    async fn pin_override(&self, token_id: i64, proxy: &ProxyUri, now: DateTime<Utc>) {
        if let Err(err) = pxr_proxy::breaker::set_sticky_override(
            &self.ctx.pool,
            &self.ctx.breaker,
            token_id,
            proxy.pool_id,
            proxy.endpoint_id,
            now,
        )
        .await
        {
            tracing::warn!("proxy_override_pin_failed token={token_id} err={err:#}");
        }
    }

    async fn throttle(&self, runtime: &RuntimeConfig, token_id: i64) {
        let min_interval = runtime.rate_limit_int(
            "pixiv_hydrate_min_interval_ms",
            self.ctx.knobs.default_min_interval_ms,
            0,
            60_000,
        );
        let jitter = runtime.rate_limit_int(
            "pixiv_hydrate_jitter_ms",
            self.ctx.knobs.default_jitter_ms,
            0,
            60_000,
        );
        self.ctx
            .throttle
            .wait(Some(token_id), min_interval as u64, jitter as u64)
            .await;
    }

    // -- token state --------------------------------------------------------

    async fn is_token_enabled(&self, token_id: i64) -> Result<bool, RefreshError> {
        match pxr_db::tokens::get_token(&self.ctx.pool, token_id).await {
            Ok(Some(row)) => Ok(row.enabled),
            Ok(None) => Err(RefreshError::NotFound),
            Err(err) => Err(RefreshError::Db(format!("{err:#}"))),
        }
    }

    async fn decrypt_refresh_token(&self, token_id: i64) -> Result<String, RefreshError> {
        let row = match pxr_db::tokens::get_token(&self.ctx.pool, token_id).await {
            Ok(Some(row)) => row,
            Ok(None) => return Err(RefreshError::NotFound),
            Err(err) => return Err(RefreshError::Db(format!("{err:#}"))),
        };
        if !row.enabled {
            return Err(RefreshError::Disabled);
        }
        let Some(encryptor) = self.ctx.encryptor.as_ref() else {
            return Err(RefreshError::EncryptionUnavailable);
        };
        encryptor
            .decrypt_text(&row.refresh_token_enc)
            .map_err(|_| RefreshError::EncryptionUnavailable)
    }

    async fn rotate_refresh_token(&self, token_id: i64, rotated: &str, now: DateTime<Utc>) {
        let rotated = rotated.trim();
        if rotated.is_empty() {
            return;
        }
        let Some(encryptor) = self.ctx.encryptor.as_ref() else {
            return;
        };
        let Ok(enc) = encryptor.encrypt_text(rotated) else {
            tracing::warn!("refresh_token_rotation_encrypt_failed token={token_id}");
            return;
        };
        let masked = pxr_crypto::mask_secret(rotated);
        if let Err(err) = pxr_db::tokens::rotate_refresh_token(
            &self.ctx.pool,
            token_id,
            &enc,
            &masked,
            &iso_utc_ms(now),
        )
        .await
        {
            tracing::warn!("refresh_token_rotation_persist_failed token={token_id} err={err:#}");
        }
    }

    async fn apply_token_backoff(
        &self,
        token_id: i64,
        backoff_s: u64,
        code: ErrorCode,
        message: &str,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let attempt = match pxr_db::tokens::get_token(&self.ctx.pool, token_id).await {
            Ok(Some(row)) => row.error_count + 1,
            _ => 1,
        };
        let backoff_until = if backoff_s > 0 {
            Some(iso_utc_ms(now + Duration::seconds(backoff_s as i64)))
        } else {
            None
        };
        if let Err(err) = pxr_db::tokens::mark_token_backoff(
            &self.ctx.pool,
            token_id,
            attempt,
            backoff_until.as_deref(),
            code.as_str(),
            message,
            &iso_utc_ms(now),
        )
        .await
        {
            tracing::warn!("token_backoff_persist_failed token={token_id} err={err:#}");
        }
        backoff_until
    }

    // -- oauth refresh with proxy failover ----------------------------------

    async fn refresh_with_failover(
        &self,
        token_id: i64,
        runtime: &RuntimeConfig,
    ) -> Result<RefreshedToken, RefreshError> {
        let refresh_token = self.decrypt_refresh_token(token_id).await?;
        let oauth_url = format!(
            "{}{}",
            self.ctx.app_api.oauth.base_url.trim_end_matches('/'),
            pxr_pixiv::OAUTH_TOKEN_PATH
        );

        let max_tries = (self.ctx.knobs.proxy_failover_attempts + 1).max(1);
        let mut last: Option<RefreshError> = None;

        for _ in 0..max_tries {
            let now = Utc::now();
            let proxy = match select_proxy_uri_for_url(
                &self.ctx.pool,
                self.ctx.encryptor.as_ref(),
                runtime,
                &oauth_url,
                Some(token_id),
                &iso_utc_ms(now),
            )
            .await
            {
                Ok(picked) => picked,
                Err(ProxySelectError::Api(api)) => return Err(RefreshError::ProxyRequired(api)),
                Err(ProxySelectError::Db(err)) => {
                    return Err(RefreshError::Db(format!("{err:#}")))
                }
            };
            let proxy_uri = proxy.as_ref().map(|p| p.uri.clone());

            self.throttle(runtime, token_id).await;
            let start = std::time::Instant::now();
            match refresh_access_token(&self.ctx.app_api.oauth, &refresh_token, proxy_uri.as_deref())
                .await
            {
                Ok(token) => {
                    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                    if let Some(proxy) = &proxy {
                        self.mark_proxy_ok(proxy, latency_ms, now).await;
                        self.pin_override(token_id, proxy, now).await;
                    }
                    if let Some(rotated) = &token.refresh_token {
                        self.rotate_refresh_token(token_id, rotated, now).await;
                    }
                    return Ok(token);
                }
                Err(err) => {
                    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                    let recoverable = err.is_recoverable();
                    if let Some(proxy) = &proxy {
                        // A definitive upstream answer still means the proxy
                        // itself worked.
                        if matches!(&err, OauthError::Status { status, .. } if *status < 500) {
                            self.mark_proxy_ok(proxy, latency_ms, now).await;
                        } else {
                            self.mark_proxy_fail(proxy, latency_ms, &err.to_string(), now).await;
                        }
                    }
                    if !recoverable {
                        return Err(RefreshError::Rejected {
                            status: err.status_code(),
                            msg: redact_text(&err.to_string()),
                        });
                    }
                    last = Some(RefreshError::Recoverable(redact_text(&err.to_string())));
                    if proxy.is_none() {
                        break;
                    }
                }
            }
        }

        Err(last.unwrap_or_else(|| RefreshError::Recoverable("oauth refresh failed".to_string())))
    }

    async fn get_access_token(
        &self,
        token_id: i64,
        runtime: &RuntimeConfig,
    ) -> Result<String, RefreshError> {
        if !self.is_token_enabled(token_id).await? {
            return Err(RefreshError::Disabled);
        }

        let access = self
            .ctx
            .token_cache
            .get_or_refresh(token_id, || self.refresh_with_failover(token_id, runtime))
            .await?;

        if !self.is_token_enabled(token_id).await? {
            self.ctx.token_cache.invalidate(token_id).await;
            return Err(RefreshError::Disabled);
        }
        Ok(access)
    }

    // -- detail fetch with proxy failover -----------------------------------

    async fn fetch_detail(
        &self,
        illust_id: i64,
        token_id: i64,
        access_token: &str,
        runtime: &RuntimeConfig,
    ) -> Result<Value, AttemptError> {
        let detail_url = format!(
            "{}{}",
            self.ctx.app_api.base_url.trim_end_matches('/'),
            pxr_pixiv::ILLUST_DETAIL_PATH
        );
        let max_tries = (self.ctx.knobs.proxy_failover_attempts + 1).max(1);
        let mut last: Option<AttemptError> = None;

        for _ in 0..max_tries {
            let now = Utc::now();
            let proxy = self.select_proxy(runtime, &detail_url, token_id).await?;
            let proxy_uri = proxy.as_ref().map(|p| p.uri.clone());

            self.throttle(runtime, token_id).await;
            let start = std::time::Instant::now();
            match self
                .ctx
                .app_api
                .illust_detail(illust_id, access_token, proxy_uri.as_deref())
                .await
            {
                Ok(value) => {
                    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                    if let Some(proxy) = &proxy {
                        self.mark_proxy_ok(proxy, latency_ms, now).await;
                        self.pin_override(token_id, proxy, now).await;
                    }
                    return Ok(value);
                }
                Err(FetchError::Status { status, body }) => {
                    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                    if status >= 500 {
                        if let Some(proxy) = &proxy {
                            self.mark_proxy_fail(proxy, latency_ms, &format!("status={status}"), now)
                                .await;
                            last = Some(AttemptError::Server(status));
                            continue;
                        }
                        last = Some(AttemptError::Server(status));
                        break;
                    }
                    if let Some(proxy) = &proxy {
                        self.mark_proxy_ok(proxy, latency_ms, now).await;
                    }
                    return Err(self.classify_app_status(token_id, status, &body, now).await);
                }
                Err(FetchError::Transport(msg)) => {
                    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                    if let Some(proxy) = &proxy {
                        self.mark_proxy_fail(proxy, latency_ms, &msg, now).await;
                        last = Some(AttemptError::Network(redact_text(&msg)));
                        continue;
                    }
                    last = Some(AttemptError::Network(redact_text(&msg)));
                    break;
                }
                Err(FetchError::Decode(msg)) => {
                    return Err(AttemptError::Other(redact_text(&msg)));
                }
            }
        }

        Err(last.unwrap_or_else(|| AttemptError::Other("app api request failed".to_string())))
    }

    /// Map a non-5xx App API status. 404 is permanent (surfaced via `Other`
    /// carrying a marker handled by the caller); 403 rate limits taint the
    /// token; anything else is worth another token.
    async fn classify_app_status(
        &self,
        token_id: i64,
        status: u16,
        body: &str,
        now: DateTime<Utc>,
    ) -> AttemptError {
        if status == 404 {
            return AttemptError::Other(format!("pixiv-404 status={status}"));
        }
        if classify_rate_limit(status, Some(body)) {
            let attempt = match pxr_db::tokens::get_token(&self.ctx.pool, token_id).await {
                Ok(Some(row)) => row.error_count + 1,
                _ => 1,
            };
            let backoff_s = self.ctx.backoff.rate_limit_backoff_seconds(attempt);
            let backoff_until = self
                .apply_token_backoff(token_id, backoff_s, ErrorCode::TokenBackoff, "Pixiv rate limited", now)
                .await;
            return AttemptError::RateLimited { backoff_until };
        }
        AttemptError::Other(format!("app api status={status}"))
    }

    // -- classification -----------------------------------------------------

    fn recoverable_defer_run_after(&self) -> String {
        let base = self.ctx.knobs.recoverable_defer_base_s as f64;
        let jitter = self.ctx.knobs.recoverable_defer_jitter_s.max(0) as f64;
        let delay = base + rand::thread_rng().gen_range(0.0..1.0) * jitter;
        iso_utc_ms(Utc::now() + Duration::milliseconds((delay * 1000.0) as i64))
    }

    /// Defer time for a recoverable terminal error: the proxy's
    /// `next_available_at` when it is in the future, else base+jitter.
    fn defer_run_after_for(&self, err: &AttemptError) -> String {
        if let AttemptError::ProxyRequired(api) = err {
            if let Some(next) = api
                .details
                .as_ref()
                .and_then(|d| d.get("next_available_at"))
                .and_then(Value::as_str)
            {
                if let Some(at) = parse_iso_utc(next) {
                    if at > Utc::now() {
                        return next.to_string();
                    }
                }
            }
        }
        if let AttemptError::RateLimited {
            backoff_until: Some(until),
        } = err
        {
            return until.clone();
        }
        self.recoverable_defer_run_after()
    }

    fn finish_with(&self, last: Option<AttemptError>) -> HandlerError {
        match last {
            None => HandlerError::recoverable("hydrate_metadata failed"),
            Some(err) if err.is_recoverable() => {
                let code = match &err {
                    AttemptError::ProxyRequired(api) => api.code,
                    AttemptError::RateLimited { .. } => ErrorCode::TokenBackoff,
                    _ => ErrorCode::ProxyConnectFailed,
                };
                let run_after = self.defer_run_after_for(&err);
                HandlerError::defer(
                    format!("{}: upstream unavailable, retrying later", code.as_str()),
                    run_after,
                )
            }
            Some(err) => HandlerError::recoverable(format!("{err:?}")),
        }
    }

    // -- single illust ------------------------------------------------------

    async fn hydrate_single_illust(
        &self,
        illust_id: i64,
        source_import_id: Option<i64>,
    ) -> Result<(), HandlerError> {
        let runtime = load_runtime_config(&self.ctx.pool)
            .await
            .map_err(HandlerError::from)?;
        let now_epoch = Utc::now().timestamp() as f64;

        let mut tried: Vec<i64> = Vec::new();
        let mut last: Option<AttemptError> = None;

        for _ in 0..MAX_TOKEN_TRIES {
            let token_id = match self.choose_token_id(now_epoch, &tried).await? {
                Ok(token_id) => token_id,
                Err(retry_at) => {
                    // Out of tokens. A recoverable failure on the way here
                    // wins the classification; otherwise defer to the
                    // earliest token recovery.
                    if let Some(err) = last.take().filter(AttemptError::is_recoverable) {
                        return Err(self.finish_with(Some(err)));
                    }
                    return Err(HandlerError::defer(
                        format!("{}: no eligible token available", ErrorCode::NoTokenAvailable),
                        retry_at,
                    ));
                }
            };
            tried.push(token_id);

            let access_token = match self.get_access_token(token_id, &runtime).await {
                Ok(access) => access,
                Err(RefreshError::Disabled) | Err(RefreshError::NotFound) => {
                    last = Some(AttemptError::TokenDisabled);
                    continue;
                }
                Err(RefreshError::EncryptionUnavailable) => {
                    return Err(HandlerError::permanent(
                        "field encryption unavailable for stored refresh token",
                    ));
                }
                Err(RefreshError::ProxyRequired(api)) => {
                    last = Some(AttemptError::ProxyRequired(api));
                    continue;
                }
                Err(RefreshError::Recoverable(msg)) => {
                    last = Some(AttemptError::Network(msg));
                    continue;
                }
                Err(RefreshError::Rejected { status, msg }) => {
                    let now = Utc::now();
                    let attempt = match pxr_db::tokens::get_token(&self.ctx.pool, token_id).await {
                        Ok(Some(row)) => row.error_count + 1,
                        _ => 1,
                    };
                    let backoff_s = self.ctx.backoff.refresh_backoff_seconds(attempt, status);
                    self.apply_token_backoff(
                        token_id,
                        backoff_s,
                        ErrorCode::TokenRefreshFailed,
                        "Token refresh failed",
                        now,
                    )
                    .await;
                    self.ctx.token_cache.invalidate(token_id).await;
                    last = Some(AttemptError::RefreshRejected(msg));
                    continue;
                }
                Err(RefreshError::Db(msg)) => {
                    return Err(HandlerError::recoverable(msg));
                }
            };

            let document = match self
                .fetch_detail(illust_id, token_id, &access_token, &runtime)
                .await
            {
                Ok(document) => document,
                Err(err @ AttemptError::Other(_)) => {
                    // 404 is terminal for the job, not for the token walk.
                    if matches!(&err, AttemptError::Other(msg) if msg.starts_with("pixiv-404")) {
                        return Err(HandlerError::permanent("Pixiv illust not found"));
                    }
                    last = Some(err);
                    continue;
                }
                Err(err) => {
                    last = Some(err);
                    continue;
                }
            };

            let parsed = match parse_illust_detail(&document) {
                Ok(parsed) => parsed,
                Err(err) => return Err(HandlerError::permanent(err.to_string())),
            };

            self.persist(parsed, source_import_id).await?;
            let now = Utc::now();
            if let Err(err) =
                pxr_db::tokens::mark_token_ok(&self.ctx.pool, token_id, &iso_utc_ms(now)).await
            {
                tracing::warn!("token_mark_ok_failed token={token_id} err={err:#}");
            }
            return Ok(());
        }

        Err(self.finish_with(last))
    }

    async fn persist(
        &self,
        parsed: ParsedIllust,
        source_import_id: Option<i64>,
    ) -> Result<(), HandlerError> {
        let persist = PersistIllust {
            illust_id: parsed.illust_id,
            pages: parsed
                .pages
                .iter()
                .map(|page| PersistPage {
                    page_index: page.page_index,
                    original_url: page.original_url.clone(),
                    ext: page.ext.clone(),
                    random_key: rand::thread_rng().gen_range(0.0..1.0),
                })
                .collect(),
            meta: HydratedMeta {
                width: parsed.width,
                height: parsed.height,
                aspect_ratio: parsed.aspect_ratio,
                orientation: parsed.orientation,
                x_restrict: parsed.x_restrict,
                ai_type: parsed.ai_type,
                illust_type: parsed.illust_type,
                user_id: parsed.user_id,
                user_name: parsed.user_name.clone(),
                title: parsed.title.clone(),
                created_at_pixiv: parsed.created_at_pixiv.clone(),
                bookmark_count: parsed.bookmark_count,
                view_count: parsed.view_count,
                comment_count: parsed.comment_count,
            },
            tags: parsed.tags,
            created_import_id: source_import_id,
        };

        let now_iso = iso_utc_ms(Utc::now());
        pxr_db::with_busy_retry(|| pxr_db::hydration::persist_illust(&self.ctx.pool, &persist, &now_iso))
            .await
            .map_err(HandlerError::from)?;
        Ok(())
    }

    // -- run-driven batch ---------------------------------------------------

    async fn run_batch(&self, job: &JobRow, run_id: i64) -> Result<HandlerOutcome, HandlerError> {
        let worker_id = job
            .locked_by
            .clone()
            .filter(|w| !w.trim().is_empty())
            .ok_or_else(|| HandlerError::permanent("Invalid job state"))?;

        let run = runs::get_run(&self.ctx.pool, run_id)
            .await
            .map_err(HandlerError::from)?
            .ok_or_else(|| HandlerError::permanent("Hydration run not found"))?;

        let now_iso = iso_utc_ms(Utc::now());
        match run.status.as_str() {
            "paused" | "canceled" => {
                pxr_db::jobs::release_job_lock(
                    &self.ctx.pool,
                    job.id,
                    &worker_id,
                    &run.status,
                    None,
                    None,
                    &now_iso,
                )
                .await
                .map_err(HandlerError::from)?;
                return Ok(HandlerOutcome::LockReleased);
            }
            "pending" | "running" => {}
            _ => return Ok(HandlerOutcome::Completed),
        }

        runs::mark_run_running(&self.ctx.pool, run_id, &now_iso)
            .await
            .map_err(HandlerError::from)?;

        let criteria: RunCriteria =
            serde_json::from_str(&run.criteria_json).unwrap_or_default();
        let missing = runs::missing_set_from_criteria(&criteria);
        let predicate = runs::missing_predicate_sql(&missing);

        let mut cursor_image_id = serde_json::from_str::<Value>(&run.cursor_json)
            .ok()
            .and_then(|cursor| cursor.get("cursor_image_id").and_then(Value::as_i64))
            .unwrap_or(0)
            .max(0);

        let mut processed = 0;
        for _ in 0..self.ctx.knobs.run_batch_size {
            let candidate = runs::pick_next_candidate(&self.ctx.pool, cursor_image_id, &predicate)
                .await
                .map_err(HandlerError::from)?;
            let Some((image_id, illust_id)) = candidate else {
                runs::mark_run_completed(&self.ctx.pool, run_id, &iso_utc_ms(Utc::now()))
                    .await
                    .map_err(HandlerError::from)?;
                return Ok(HandlerOutcome::Completed);
            };

            let cursor_json = serde_json::to_string(&serde_json::json!({
                "cursor_image_id": image_id,
                "cursor_illust_id": illust_id,
            }))
            .unwrap_or_else(|_| "{}".to_string());

            match self.hydrate_single_illust(illust_id, None).await {
                Ok(()) => {
                    runs::update_run_progress(
                        &self.ctx.pool,
                        run_id,
                        &cursor_json,
                        1,
                        1,
                        0,
                        None,
                        &iso_utc_ms(Utc::now()),
                    )
                    .await
                    .map_err(HandlerError::from)?;
                }
                Err(defer @ HandlerError::Defer { .. }) => return Err(defer),
                Err(err) => {
                    let mut msg = err.to_string();
                    msg.truncate(500);
                    runs::update_run_progress(
                        &self.ctx.pool,
                        run_id,
                        &cursor_json,
                        1,
                        0,
                        1,
                        Some(&msg),
                        &iso_utc_ms(Utc::now()),
                    )
                    .await
                    .map_err(HandlerError::from)?;
                }
            }

            cursor_image_id = image_id;
            processed += 1;
        }

        if processed > 0 {
            let run_after = iso_utc_ms(Utc::now() + Duration::seconds(1));
            pxr_db::jobs::release_job_lock(
                &self.ctx.pool,
                job.id,
                &worker_id,
                "pending",
                Some(&run_after),
                None,
                &iso_utc_ms(Utc::now()),
            )
            .await
            .map_err(HandlerError::from)?;
            return Ok(HandlerOutcome::LockReleased);
        }
        Ok(HandlerOutcome::Completed)
    }
}

fn parse_source_import_id(job: &JobRow) -> Option<i64> {
    if job.ref_type.as_deref() != Some("import") {
        return None;
    }
    let ref_id = job.ref_id.as_deref()?.trim();
    let prefix = ref_id.split(':').next()?;
    prefix.parse::<i64>().ok().filter(|id| *id > 0)
}

#[async_trait]
impl JobHandler for HydrateMetadataHandler {
    async fn run(&self, job: &JobRow) -> Result<HandlerOutcome, HandlerError> {
        let payload: HydratePayload = serde_json::from_str(&job.payload_json)
            .map_err(|_| HandlerError::permanent("payload_json is not a valid hydrate payload"))?;

        if let Some(run_id) = payload.hydration_run_id.filter(|id| *id > 0) {
            return self.run_batch(job, run_id).await;
        }

        let illust_id = payload
            .illust_id
            .filter(|id| *id > 0)
            .ok_or_else(|| HandlerError::permanent("payload.illust_id is required"))?;
        let source_import_id = parse_source_import_id(job);

        self.hydrate_single_illust(illust_id, source_import_id).await?;
        Ok(HandlerOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_ref(ref_type: Option<&str>, ref_id: Option<&str>) -> JobRow {
        JobRow {
            id: 1,
            job_type: "hydrate_metadata".to_string(),
            status: "running".to_string(),
            priority: 0,
            run_after: None,
            attempt: 0,
            max_attempts: 5,
            payload_json: "{}".to_string(),
            last_error: None,
            locked_by: Some("w".to_string()),
            locked_at: None,
            ref_type: ref_type.map(str::to_string),
            ref_id: ref_id.map(str::to_string),
            added_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn source_import_id_comes_from_import_refs_only() {
        assert_eq!(
            parse_source_import_id(&job_with_ref(Some("import"), Some("12:345"))),
            Some(12)
        );
        assert_eq!(
            parse_source_import_id(&job_with_ref(Some("import"), Some("12"))),
            Some(12)
        );
        assert_eq!(
            parse_source_import_id(&job_with_ref(Some("opportunistic_hydrate"), Some("12"))),
            None
        );
        assert_eq!(parse_source_import_id(&job_with_ref(Some("import"), Some("x:1"))), None);
        assert_eq!(parse_source_import_id(&job_with_ref(None, None)), None);
    }
}
