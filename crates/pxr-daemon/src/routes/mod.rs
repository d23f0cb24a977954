//! Router assembly plus the small status/service endpoints.
//!
//! `build_router` returns the bare router so tests can drive it with
//! `tower::ServiceExt::oneshot`; `main.rs` attaches tracing/CORS layers.

pub mod admin;
pub mod public;
pub mod random;
pub(crate) mod serving;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use base64::Engine as _;
use serde_json::json;
use sha2::{Digest, Sha256};

use pxr_types::{ApiError, ErrorCode};

use crate::api::{ok_data, request_id_middleware, AppError, RequestId};
use crate::state::AppContext;

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are not applied here; `main.rs` attaches
/// them after this call so tests can use the bare router.
pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let public_data = Router::new()
        .route("/random", get(random::random))
        .route("/images", get(public::list_images))
        .route("/images/:image_id", get(public::get_image))
        .route("/tags", get(public::list_tags))
        .route("/authors", get(public::list_authors))
        .route_layer(middleware::from_fn_with_state(
            ctx.clone(),
            public_api_key_gate,
        ));

    let service = Router::new()
        .route("/healthz", get(healthz))
        .route("/version", get(version))
        .route("/status", get(status_page))
        .route("/status.json", get(status_json))
        .route("/docs", get(docs_page))
        .route("/wtf", get(docs_page));

    let streaming = Router::new()
        .route("/i/:file", get(public::image_proxy))
        .route("/:file", get(public::legacy_image));

    Router::new()
        .merge(public_data)
        .merge(service)
        .nest("/admin", admin::admin_router(ctx.clone()))
        .merge(streaming)
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Auth gates
// ---------------------------------------------------------------------------

/// Public API-key requirement (off by default). Keys travel in `X-API-Key`
/// and are stored as sha256 hex.
async fn public_api_key_gate(
    State(ctx): State<Arc<AppContext>>,
    request: Request,
    next: Next,
) -> Response {
    if !ctx.settings.public_api_key_required {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let Some(key) = provided else {
        return AppError::from(ApiError::unauthorized("API key required")).into_response();
    };

    let hash = hex::encode(Sha256::digest(key.as_bytes()));
    match pxr_db::api_keys::api_key_hash_exists(&ctx.pool, &hash).await {
        Ok(true) => next.run(request).await,
        Ok(false) => {
            AppError::from(ApiError::new(ErrorCode::Forbidden, "Invalid API key", 403))
                .into_response()
        }
        Err(err) => AppError::from(err).into_response(),
    }
}

/// Admin bearer/basic auth against the configured credentials.
pub(crate) async fn admin_auth_gate(
    State(ctx): State<Arc<AppContext>>,
    request: Request,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let authorized = if let Some(token) = authorization.strip_prefix("Bearer ") {
        !ctx.settings.admin_password.is_empty() && token.trim() == ctx.settings.admin_password
    } else if let Some(encoded) = authorization.strip_prefix("Basic ") {
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|pair| {
                pair.split_once(':')
                    .map(|(user, pass)| (user.to_string(), pass.to_string()))
            })
            .map(|(user, pass)| {
                user == ctx.settings.admin_username
                    && !ctx.settings.admin_password.is_empty()
                    && pass == ctx.settings.admin_password
            })
            .unwrap_or(false)
    } else {
        false
    };

    if !authorized {
        return AppError::from(ApiError::unauthorized("Admin credentials required"))
            .into_response();
    }
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Service endpoints
// ---------------------------------------------------------------------------

async fn healthz(State(ctx): State<Arc<AppContext>>) -> Response {
    match pxr_db::status(&ctx.pool).await {
        Ok(status) if status.ok => {
            (StatusCode::OK, Json(json!({"ok": true}))).into_response()
        }
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"ok": false})),
        )
            .into_response(),
    }
}

async fn version(State(ctx): State<Arc<AppContext>>) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "service": ctx.build.service,
            "version": ctx.build.version,
        })),
    )
        .into_response()
}

async fn status_json(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
) -> Result<Response, AppError> {
    let data = collect_status(&ctx).await?;
    Ok(ok_data(&rid, data))
}

async fn status_page(State(ctx): State<Arc<AppContext>>) -> Result<Response, AppError> {
    let data = collect_status(&ctx).await?;
    let body = format!(
        "<!doctype html><title>{service}</title><h1>{service} {version}</h1><pre>{data}</pre>",
        service = ctx.build.service,
        version = ctx.build.version,
        data = serde_json::to_string_pretty(&data).unwrap_or_default(),
    );
    Ok(Html(body).into_response())
}

async fn docs_page(State(ctx): State<Arc<AppContext>>) -> Response {
    let body = format!(
        "<!doctype html><title>{service}</title><h1>{service}</h1>\
         <p>Public endpoints: /random, /i/{{id}}.{{ext}}, /images, /tags, /authors, \
         /status.json, /healthz, /version.</p>",
        service = ctx.build.service,
    );
    Html(body).into_response()
}

async fn collect_status(ctx: &AppContext) -> Result<serde_json::Value, AppError> {
    let images = pxr_db::images::count_images_by_status(&ctx.pool).await?;
    let jobs = pxr_db::jobs::count_jobs_by_status(&ctx.pool).await?;
    let tokens_enabled = pxr_db::tokens::count_enabled_tokens(&ctx.pool).await?;
    let settings = pxr_db::settings::fetch_runtime_settings(&ctx.pool).await?;

    let images_by_status: serde_json::Map<String, serde_json::Value> = images
        .into_iter()
        .map(|(status, count)| (status.to_string(), json!(count)))
        .collect();
    let jobs_by_status: serde_json::Map<String, serde_json::Value> =
        jobs.into_iter().map(|(status, count)| (status, json!(count))).collect();

    Ok(json!({
        "images_by_status": images_by_status,
        "jobs_by_status": jobs_by_status,
        "tokens_enabled": tokens_enabled,
        "worker": {
            "last_seen": settings.get("worker.last_seen_at"),
            "concurrency": settings.get("worker.concurrency"),
        },
    }))
}
