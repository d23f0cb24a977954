//! Shared serving-path helpers: stream proxy selection, best-effort health
//! marks, and the opportunistic hydration enqueue.
//!
//! Everything here is fire-and-forget from the request's perspective:
//! serving an image never fails because a bookkeeping write failed.

use std::time::Duration;

use pxr_db::settings::RuntimeConfig;
use pxr_db::ImageRow;
use pxr_types::{now_iso, ApiError, ErrorCode};

use crate::api::AppError;
use crate::state::AppContext;

const BEST_EFFORT_TIMEOUT: Duration = Duration::from_millis(1500);
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(2500);

pub(crate) fn is_upstream_serve_error(code: &ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::UpstreamStreamError
            | ErrorCode::Upstream403
            | ErrorCode::Upstream404
            | ErrorCode::UpstreamRateLimit
    )
}

/// Proxy for streaming an original (no token affinity on this path).
pub(crate) async fn select_stream_proxy(
    ctx: &AppContext,
    runtime: &RuntimeConfig,
    original_url: &str,
) -> Result<Option<String>, AppError> {
    let picked = pxr_proxy::select_proxy_uri_for_url(
        &ctx.pool,
        ctx.encryptor.as_ref(),
        runtime,
        original_url,
        None,
        &now_iso(),
    )
    .await?;
    Ok(picked.map(|proxy| proxy.uri))
}

/// Enqueue a low-priority hydration without blocking the response.
pub(crate) fn spawn_opportunistic_hydrate(ctx: &AppContext, illust_id: i64, reason: &str) {
    let pool = ctx.pool.clone();
    let reason = reason.to_string();
    tokio::spawn(async move {
        let enqueue = pxr_jobs::handlers::enqueue_opportunistic_hydrate(&pool, illust_id, &reason);
        match tokio::time::timeout(ENQUEUE_TIMEOUT, enqueue).await {
            Ok(Ok(Some(job_id))) => {
                tracing::debug!("opportunistic_hydrate_enqueued illust={illust_id} job={job_id}");
            }
            Ok(Ok(None)) => {}
            Ok(Err(err)) => {
                tracing::warn!("opportunistic_hydrate_enqueue_failed illust={illust_id} err={err:#}");
            }
            Err(_) => {
                tracing::warn!("opportunistic_hydrate_enqueue_timeout illust={illust_id}");
            }
        }
    });
}

/// Post-stream bookkeeping: clear the failure trail when needed and enqueue
/// hydration when core metadata is missing.
pub(crate) fn after_successful_stream(ctx: &AppContext, image: &ImageRow, reason: &str) {
    if image.last_ok_at.is_none() || image.last_error_code.is_some() {
        let pool = ctx.pool.clone();
        let image_id = image.id;
        tokio::spawn(async move {
            let now = now_iso();
            let mark = pxr_db::images::mark_image_ok(&pool, image_id, &now);
            match tokio::time::timeout(BEST_EFFORT_TIMEOUT, mark).await {
                Ok(Err(err)) => tracing::warn!("image_mark_ok_failed image={image_id} err={err:#}"),
                Err(_) => tracing::warn!("image_mark_ok_timeout image={image_id}"),
                Ok(Ok(())) => {}
            }
        });
    }
    if image.missing_core_metadata() {
        spawn_opportunistic_hydrate(ctx, image.illust_id, reason);
    }
}

/// Record a failed serve against the image.
pub(crate) fn mark_failure_best_effort(ctx: &AppContext, image_id: i64, err: &ApiError) {
    let pool = ctx.pool.clone();
    let code = err.code.as_str().to_string();
    tokio::spawn(async move {
        let now = now_iso();
        let mark = pxr_db::images::mark_image_failure(&pool, image_id, &now, &code);
        if tokio::time::timeout(BEST_EFFORT_TIMEOUT, mark).await.is_err() {
            tracing::warn!("image_mark_failure_timeout image={image_id}");
        }
    });
}
