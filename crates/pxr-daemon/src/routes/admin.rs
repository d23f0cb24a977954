//! Admin API: CRUD over tokens, pools, endpoints, bindings, imports, jobs,
//! hydration runs, runtime settings, and API keys. Bearer/basic protected;
//! thin shells over the store and the recompute/override operations.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::middleware;
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use pxr_db::jobs::NewJob;
use pxr_jobs::handlers::{JOB_TYPE_HYDRATE_METADATA, JOB_TYPE_IMPORT_IMAGES, JOB_TYPE_PROXY_PROBE};
use pxr_proxy::rendezvous::{recompute_token_proxy_bindings, RecomputeError};
use pxr_types::{iso_utc_ms, now_iso, ApiError};

use crate::api::{ok_data, ok_item, ok_items, AppError, RequestId};
use crate::state::AppContext;

pub fn admin_router(ctx: Arc<AppContext>) -> Router<Arc<AppContext>> {
    Router::new()
        .route("/tokens", get(list_tokens).post(create_token))
        .route("/tokens/:id", axum::routing::patch(update_token).delete(delete_token))
        .route("/pools", get(list_pools).post(create_pool))
        .route("/pools/:id", axum::routing::patch(update_pool).delete(delete_pool))
        .route("/pools/:id/endpoints", post(attach_endpoint))
        .route("/pools/:id/endpoints/:endpoint_id", delete(detach_endpoint))
        .route("/proxies", get(list_endpoints).post(create_endpoint))
        .route(
            "/proxies/:id",
            axum::routing::patch(update_endpoint).delete(delete_endpoint),
        )
        .route("/bindings", get(list_bindings))
        .route("/bindings/recompute", post(recompute_bindings))
        .route("/bindings/override", post(set_binding_override))
        .route("/bindings/clear_override", post(clear_binding_override))
        .route("/imports", get(list_imports).post(create_import))
        .route("/imports/:id", get(get_import))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/hydration-runs", get(list_runs).post(create_run))
        .route("/hydration-runs/:id/pause", post(pause_run))
        .route("/hydration-runs/:id/resume", post(resume_run))
        .route("/hydration-runs/:id/cancel", post(cancel_run))
        .route("/settings", get(list_settings))
        .route("/settings/:key", put(put_setting))
        .route("/api-keys", get(list_api_keys).post(create_api_key))
        .route("/api-keys/:id", delete(delete_api_key))
        .route("/probe", post(enqueue_probe))
        .route_layer(middleware::from_fn_with_state(
            ctx,
            super::admin_auth_gate,
        ))
}

fn encryptor_required(ctx: &AppContext) -> Result<&pxr_crypto::FieldEncryptor, AppError> {
    ctx.encryptor
        .as_ref()
        .ok_or_else(|| ApiError::internal("Encryption not configured").into())
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

fn token_item(token: &pxr_db::PixivTokenRow) -> Value {
    json!({
        "id": token.id,
        "label": token.label,
        "enabled": token.enabled,
        "refresh_token_masked": token.refresh_token_masked,
        "weight": token.weight,
        "error_count": token.error_count,
        "backoff_until": token.backoff_until,
        "last_ok_at": token.last_ok_at,
        "last_fail_at": token.last_fail_at,
        "last_error_code": token.last_error_code,
        "last_error_msg": token.last_error_msg,
        "added_at": token.added_at,
        "updated_at": token.updated_at,
    })
}

async fn list_tokens(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
) -> Result<Response, AppError> {
    let tokens = pxr_db::tokens::list_tokens(&ctx.pool).await?;
    let items: Vec<Value> = tokens.iter().map(token_item).collect();
    Ok(ok_items(&rid, json!(items), None))
}

#[derive(Debug, Deserialize)]
struct CreateTokenBody {
    refresh_token: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    weight: Option<i64>,
    #[serde(default)]
    enabled: Option<bool>,
}

async fn create_token(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<CreateTokenBody>,
) -> Result<Response, AppError> {
    let refresh_token = body.refresh_token.trim();
    if refresh_token.is_empty() {
        return Err(ApiError::bad_request("refresh_token is required").into());
    }
    let weight = body.weight.unwrap_or(1);
    if !(0..=100).contains(&weight) {
        return Err(ApiError::bad_request("weight must be in [0, 100]").into());
    }

    let encryptor = encryptor_required(&ctx)?;
    let enc = encryptor
        .encrypt_text(refresh_token)
        .map_err(|_| ApiError::internal("Encryption failed"))?;
    let masked = pxr_crypto::mask_secret(refresh_token);

    let id = pxr_db::tokens::insert_token(
        &ctx.pool,
        body.label.as_deref(),
        &enc,
        &masked,
        weight,
        body.enabled.unwrap_or(true),
        &now_iso(),
    )
    .await?;
    Ok(ok_data(&rid, json!({"id": id})))
}

#[derive(Debug, Deserialize)]
struct UpdateTokenBody {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    weight: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

async fn update_token(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateTokenBody>,
) -> Result<Response, AppError> {
    if let Some(weight) = body.weight {
        if !(0..=100).contains(&weight) {
            return Err(ApiError::bad_request("weight must be in [0, 100]").into());
        }
    }

    let refresh_pair = match body.refresh_token.as_deref().map(str::trim) {
        Some("") | None => None,
        Some(secret) => {
            let encryptor = encryptor_required(&ctx)?;
            let enc = encryptor
                .encrypt_text(secret)
                .map_err(|_| ApiError::internal("Encryption failed"))?;
            Some((enc, pxr_crypto::mask_secret(secret)))
        }
    };

    let updated = pxr_db::tokens::update_token(
        &ctx.pool,
        id,
        body.label.as_ref().map(|label| Some(label.as_str())),
        body.enabled,
        body.weight,
        refresh_pair
            .as_ref()
            .map(|(enc, masked)| (enc.as_str(), masked.as_str())),
        &now_iso(),
    )
    .await?;
    if !updated {
        return Err(ApiError::not_found("Token not found").into());
    }
    Ok(ok_data(&rid, json!({"updated": true})))
}

async fn delete_token(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    if !pxr_db::tokens::delete_token(&ctx.pool, id).await? {
        return Err(ApiError::not_found("Token not found").into());
    }
    Ok(ok_data(&rid, json!({"deleted": true})))
}

// ---------------------------------------------------------------------------
// Pools and endpoints
// ---------------------------------------------------------------------------

async fn list_pools(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
) -> Result<Response, AppError> {
    let pools = pxr_db::proxies::list_pools(&ctx.pool).await?;
    let mut items = Vec::with_capacity(pools.len());
    for pool in &pools {
        let members = pxr_db::proxies::list_pool_members(&ctx.pool, pool.id).await?;
        items.push(json!({
            "id": pool.id,
            "name": pool.name,
            "enabled": pool.enabled,
            "description": pool.description,
            "members": members,
        }));
    }
    Ok(ok_items(&rid, json!(items), None))
}

#[derive(Debug, Deserialize)]
struct CreatePoolBody {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

async fn create_pool(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<CreatePoolBody>,
) -> Result<Response, AppError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name is required").into());
    }
    let id =
        pxr_db::proxies::create_pool(&ctx.pool, name, body.description.as_deref(), &now_iso())
            .await?;
    Ok(ok_data(&rid, json!({"id": id})))
}

#[derive(Debug, Deserialize)]
struct UpdatePoolBody {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    description: Option<String>,
}

async fn update_pool(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
    Json(body): Json<UpdatePoolBody>,
) -> Result<Response, AppError> {
    let updated = pxr_db::proxies::update_pool(
        &ctx.pool,
        id,
        body.enabled,
        body.description.as_ref().map(|d| Some(d.as_str())),
        &now_iso(),
    )
    .await?;
    if !updated {
        return Err(ApiError::not_found("Pool not found").into());
    }
    Ok(ok_data(&rid, json!({"updated": true})))
}

async fn delete_pool(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    if !pxr_db::proxies::delete_pool(&ctx.pool, id).await? {
        return Err(ApiError::not_found("Pool not found").into());
    }
    Ok(ok_data(&rid, json!({"deleted": true})))
}

#[derive(Debug, Deserialize)]
struct AttachEndpointBody {
    endpoint_id: i64,
    #[serde(default)]
    weight: Option<i64>,
}

async fn attach_endpoint(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(pool_id): Path<i64>,
    Json(body): Json<AttachEndpointBody>,
) -> Result<Response, AppError> {
    let weight = body.weight.unwrap_or(1);
    if !(0..=1000).contains(&weight) {
        return Err(ApiError::bad_request("weight must be in [0, 1000]").into());
    }
    pxr_db::proxies::attach_endpoint(&ctx.pool, pool_id, body.endpoint_id, weight).await?;
    Ok(ok_data(&rid, json!({"attached": true})))
}

async fn detach_endpoint(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path((pool_id, endpoint_id)): Path<(i64, i64)>,
) -> Result<Response, AppError> {
    if !pxr_db::proxies::detach_endpoint(&ctx.pool, pool_id, endpoint_id).await? {
        return Err(ApiError::not_found("Membership not found").into());
    }
    Ok(ok_data(&rid, json!({"detached": true})))
}

fn endpoint_item(endpoint: &pxr_db::ProxyEndpointRow) -> Value {
    json!({
        "id": endpoint.id,
        "scheme": endpoint.scheme,
        "host": endpoint.host,
        "port": endpoint.port,
        "username": endpoint.username,
        "enabled": endpoint.enabled,
        "source": endpoint.source,
        "source_ref": endpoint.source_ref,
        "last_latency_ms": endpoint.last_latency_ms,
        "last_ok_at": endpoint.last_ok_at,
        "last_fail_at": endpoint.last_fail_at,
        "blacklisted_until": endpoint.blacklisted_until,
        "success_count": endpoint.success_count,
        "failure_count": endpoint.failure_count,
        "last_error": endpoint.last_error,
    })
}

async fn list_endpoints(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
) -> Result<Response, AppError> {
    let endpoints = pxr_db::proxies::list_endpoints(&ctx.pool).await?;
    let items: Vec<Value> = endpoints.iter().map(endpoint_item).collect();
    Ok(ok_items(&rid, json!(items), None))
}

#[derive(Debug, Deserialize)]
struct CreateEndpointBody {
    scheme: String,
    host: String,
    port: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

async fn create_endpoint(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<CreateEndpointBody>,
) -> Result<Response, AppError> {
    let scheme = body.scheme.trim().to_ascii_lowercase();
    if !matches!(scheme.as_str(), "http" | "https" | "socks5") {
        return Err(ApiError::bad_request("scheme must be http, https, or socks5").into());
    }
    let host = body.host.trim();
    if host.is_empty() || !(1..=65535).contains(&body.port) {
        return Err(ApiError::bad_request("host/port invalid").into());
    }

    let password_enc = match body.password.as_deref().map(str::trim) {
        Some("") | None => String::new(),
        Some(secret) => {
            let encryptor = encryptor_required(&ctx)?;
            encryptor
                .encrypt_text(secret)
                .map_err(|_| ApiError::internal("Encryption failed"))?
        }
    };

    let id = pxr_db::proxies::create_endpoint(
        &ctx.pool,
        &scheme,
        host,
        body.port,
        body.username.as_deref().unwrap_or(""),
        &password_enc,
        "manual",
        None,
        &now_iso(),
    )
    .await?;
    Ok(ok_data(&rid, json!({"id": id})))
}

#[derive(Debug, Deserialize)]
struct UpdateEndpointBody {
    enabled: bool,
}

async fn update_endpoint(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateEndpointBody>,
) -> Result<Response, AppError> {
    if !pxr_db::proxies::update_endpoint_enabled(&ctx.pool, id, body.enabled, &now_iso()).await? {
        return Err(ApiError::not_found("Endpoint not found").into());
    }
    Ok(ok_data(&rid, json!({"updated": true})))
}

async fn delete_endpoint(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    if !pxr_db::proxies::delete_endpoint(&ctx.pool, id).await? {
        return Err(ApiError::not_found("Endpoint not found").into());
    }
    Ok(ok_data(&rid, json!({"deleted": true})))
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BindingsQuery {
    #[serde(default)]
    pool_id: Option<i64>,
}

async fn list_bindings(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Query(query): Query<BindingsQuery>,
) -> Result<Response, AppError> {
    let bindings = pxr_db::bindings::list_bindings(&ctx.pool, query.pool_id).await?;
    let now = now_iso();
    let items: Vec<Value> = bindings
        .iter()
        .map(|binding| {
            let override_active = binding.override_active(&now);
            json!({
                "token_id": binding.token_id,
                "pool_id": binding.pool_id,
                "primary_proxy_id": binding.primary_proxy_id,
                "override_proxy_id": binding.override_proxy_id,
                "override_expires_at": binding.override_expires_at,
                "effective_mode": if override_active { "override" } else { "primary" },
                "effective_proxy_id": if override_active {
                    binding.override_proxy_id.unwrap_or(binding.primary_proxy_id)
                } else {
                    binding.primary_proxy_id
                },
            })
        })
        .collect();
    Ok(ok_items(&rid, json!(items), None))
}

#[derive(Debug, Deserialize)]
struct RecomputeBody {
    pool_id: i64,
    #[serde(default)]
    max_tokens_per_proxy: Option<i64>,
    #[serde(default)]
    strict: Option<bool>,
}

async fn recompute_bindings(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<RecomputeBody>,
) -> Result<Response, AppError> {
    let outcome = recompute_token_proxy_bindings(
        &ctx.pool,
        body.pool_id,
        body.max_tokens_per_proxy.unwrap_or(2),
        body.strict.unwrap_or(true),
        Utc::now(),
    )
    .await
    .map_err(|err| match err {
        RecomputeError::Api(api) => AppError::with_rid(api, &rid),
        RecomputeError::Db(db) => AppError::from(db),
    })?;
    Ok(ok_data(&rid, serde_json::to_value(outcome).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct OverrideBody {
    token_id: i64,
    pool_id: i64,
    proxy_id: i64,
    #[serde(default)]
    ttl_ms: Option<i64>,
}

async fn set_binding_override(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<OverrideBody>,
) -> Result<Response, AppError> {
    let ttl_ms = body.ttl_ms.unwrap_or(30 * 60 * 1000).clamp(1000, 7 * 86_400_000);
    let now = Utc::now();
    let expires_at = iso_utc_ms(now + Duration::milliseconds(ttl_ms));
    let updated = pxr_db::bindings::set_override(
        &ctx.pool,
        body.token_id,
        body.pool_id,
        body.proxy_id,
        &expires_at,
        &iso_utc_ms(now),
    )
    .await?;
    if !updated {
        return Err(ApiError::not_found("Binding not found").into());
    }
    Ok(ok_data(&rid, json!({"override_expires_at": expires_at})))
}

#[derive(Debug, Deserialize)]
struct ClearOverrideBody {
    token_id: i64,
    pool_id: i64,
}

async fn clear_binding_override(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<ClearOverrideBody>,
) -> Result<Response, AppError> {
    let updated =
        pxr_db::bindings::clear_override(&ctx.pool, body.token_id, body.pool_id, &now_iso())
            .await?;
    if !updated {
        return Err(ApiError::not_found("Binding not found").into());
    }
    Ok(ok_data(&rid, json!({"cleared": true})))
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateImportBody {
    text: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    hydrate_on_import: Option<bool>,
}

async fn create_import(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<CreateImportBody>,
) -> Result<Response, AppError> {
    if body.text.trim().is_empty() {
        return Err(ApiError::bad_request("text is required").into());
    }
    if body.text.len() > ctx.settings.import_max_bytes {
        return Err(ApiError::new(
            pxr_types::ErrorCode::PayloadTooLarge,
            "Import text too large",
            413,
        )
        .into());
    }

    let import_id = pxr_db::imports::create_import(
        &ctx.pool,
        "admin",
        body.source.as_deref().unwrap_or("inline"),
        &now_iso(),
    )
    .await?;

    let payload = serde_json::to_string(&json!({
        "import_id": import_id,
        "text": body.text,
        "hydrate_on_import": body.hydrate_on_import.unwrap_or(false),
    }))
    .unwrap_or_else(|_| "{}".to_string());
    let job_id = pxr_db::jobs::enqueue_job(
        &ctx.pool,
        &NewJob {
            job_type: JOB_TYPE_IMPORT_IMAGES,
            payload_json: &payload,
            ref_type: Some("import"),
            ref_id: Some(&import_id.to_string()),
            ..Default::default()
        },
        &now_iso(),
    )
    .await?;

    Ok(ok_data(&rid, json!({"import_id": import_id, "job_id": job_id})))
}

async fn list_imports(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
) -> Result<Response, AppError> {
    let imports = pxr_db::imports::list_imports(&ctx.pool, 100).await?;
    Ok(ok_items(&rid, serde_json::to_value(imports).unwrap_or_default(), None))
}

async fn get_import(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let import = pxr_db::imports::get_import(&ctx.pool, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Import not found"))?;
    Ok(ok_item(&rid, serde_json::to_value(import).unwrap_or_default()))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct JobsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "type")]
    job_type: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn list_jobs(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Query(query): Query<JobsQuery>,
) -> Result<Response, AppError> {
    let jobs = pxr_db::jobs::list_jobs(
        &ctx.pool,
        query.status.as_deref(),
        query.job_type.as_deref(),
        query.limit.unwrap_or(100),
    )
    .await?;
    Ok(ok_items(&rid, serde_json::to_value(jobs).unwrap_or_default(), None))
}

async fn retry_job(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    if !pxr_db::jobs::retry_job(&ctx.pool, id, &now_iso()).await? {
        return Err(ApiError::bad_request("Job is not retryable").into());
    }
    Ok(ok_data(&rid, json!({"retried": true})))
}

async fn cancel_job(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    if !pxr_db::jobs::cancel_job(&ctx.pool, id, &now_iso()).await? {
        return Err(ApiError::bad_request("Job is not cancelable").into());
    }
    Ok(ok_data(&rid, json!({"canceled": true})))
}

// ---------------------------------------------------------------------------
// Hydration runs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateRunBody {
    #[serde(default, rename = "type")]
    run_type: Option<String>,
    #[serde(default)]
    criteria: Option<Value>,
}

async fn create_run(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<CreateRunBody>,
) -> Result<Response, AppError> {
    let run_type = body.run_type.unwrap_or_else(|| "manual".to_string());
    if !matches!(run_type.as_str(), "manual" | "backfill") {
        return Err(ApiError::bad_request("type must be manual or backfill").into());
    }
    let criteria = body.criteria.filter(Value::is_object).unwrap_or_else(|| json!({}));
    let criteria_json = serde_json::to_string(&criteria).unwrap_or_else(|_| "{}".to_string());

    let run_id = pxr_db::runs::create_run(&ctx.pool, &run_type, &criteria_json, &now_iso()).await?;

    let payload = serde_json::to_string(&json!({"hydration_run_id": run_id}))
        .unwrap_or_else(|_| "{}".to_string());
    let job_id = pxr_db::jobs::enqueue_job(
        &ctx.pool,
        &NewJob {
            job_type: JOB_TYPE_HYDRATE_METADATA,
            payload_json: &payload,
            ref_type: Some("hydration_run"),
            ref_id: Some(&run_id.to_string()),
            ..Default::default()
        },
        &now_iso(),
    )
    .await?;

    Ok(ok_data(&rid, json!({"run_id": run_id, "job_id": job_id})))
}

async fn list_runs(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
) -> Result<Response, AppError> {
    let runs = pxr_db::runs::list_runs(&ctx.pool, 100).await?;
    Ok(ok_items(&rid, serde_json::to_value(runs).unwrap_or_default(), None))
}

async fn pause_run(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    if !pxr_db::runs::set_run_status(&ctx.pool, id, &["pending", "running"], "paused", &now_iso())
        .await?
    {
        return Err(ApiError::bad_request("Run is not pausable").into());
    }
    Ok(ok_data(&rid, json!({"paused": true})))
}

async fn resume_run(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    if !pxr_db::runs::set_run_status(&ctx.pool, id, &["paused"], "pending", &now_iso()).await? {
        return Err(ApiError::bad_request("Run is not resumable").into());
    }
    // The driving job may have parked itself; re-enqueue it.
    let payload =
        serde_json::to_string(&json!({"hydration_run_id": id})).unwrap_or_else(|_| "{}".to_string());
    pxr_db::jobs::enqueue_job_unique_ref(
        &ctx.pool,
        &NewJob {
            job_type: JOB_TYPE_HYDRATE_METADATA,
            payload_json: &payload,
            ref_type: Some("hydration_run"),
            ref_id: Some(&id.to_string()),
            ..Default::default()
        },
        &now_iso(),
    )
    .await?;
    Ok(ok_data(&rid, json!({"resumed": true})))
}

async fn cancel_run(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    if !pxr_db::runs::set_run_status(
        &ctx.pool,
        id,
        &["pending", "running", "paused"],
        "canceled",
        &now_iso(),
    )
    .await?
    {
        return Err(ApiError::bad_request("Run is not cancelable").into());
    }
    Ok(ok_data(&rid, json!({"canceled": true})))
}

// ---------------------------------------------------------------------------
// Runtime settings
// ---------------------------------------------------------------------------

async fn list_settings(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
) -> Result<Response, AppError> {
    let settings = pxr_db::settings::list_runtime_settings(&ctx.pool).await?;
    Ok(ok_items(&rid, serde_json::to_value(settings).unwrap_or_default(), None))
}

#[derive(Debug, Deserialize)]
struct PutSettingBody {
    value: Value,
    #[serde(default)]
    description: Option<String>,
}

async fn put_setting(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(key): Path<String>,
    Json(body): Json<PutSettingBody>,
) -> Result<Response, AppError> {
    pxr_db::settings::set_runtime_setting(
        &ctx.pool,
        &key,
        &body.value,
        body.description.as_deref(),
        Some("admin"),
        &now_iso(),
    )
    .await?;
    Ok(ok_data(&rid, json!({"key": key})))
}

// ---------------------------------------------------------------------------
// API keys and probes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateApiKeyBody {
    #[serde(default)]
    label: Option<String>,
}

async fn create_api_key(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<CreateApiKeyBody>,
) -> Result<Response, AppError> {
    // The plaintext key is returned exactly once.
    let key = format!("pk_{}", uuid_simple());
    let hash = hex::encode(Sha256::digest(key.as_bytes()));
    let id = pxr_db::api_keys::create_api_key(
        &ctx.pool,
        body.label.as_deref().unwrap_or(""),
        &hash,
        &now_iso(),
    )
    .await?;
    Ok(ok_data(&rid, json!({"id": id, "key": key})))
}

fn uuid_simple() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn list_api_keys(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
) -> Result<Response, AppError> {
    let keys = pxr_db::api_keys::list_api_keys(&ctx.pool).await?;
    Ok(ok_items(&rid, serde_json::to_value(keys).unwrap_or_default(), None))
}

async fn delete_api_key(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    if !pxr_db::api_keys::delete_api_key(&ctx.pool, id).await? {
        return Err(ApiError::not_found("API key not found").into());
    }
    Ok(ok_data(&rid, json!({"deleted": true})))
}

#[derive(Debug, Deserialize)]
struct ProbeBody {
    #[serde(default)]
    probe_url: Option<String>,
    #[serde(default)]
    timeout_ms: Option<i64>,
    #[serde(default)]
    concurrency: Option<i64>,
}

async fn enqueue_probe(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<ProbeBody>,
) -> Result<Response, AppError> {
    let payload = serde_json::to_string(&json!({
        "probe_url": body.probe_url,
        "timeout_ms": body.timeout_ms,
        "concurrency": body.concurrency,
    }))
    .unwrap_or_else(|_| "{}".to_string());
    let job_id = pxr_db::jobs::enqueue_job(
        &ctx.pool,
        &NewJob {
            job_type: JOB_TYPE_PROXY_PROBE,
            payload_json: &payload,
            ..Default::default()
        },
        &now_iso(),
    )
    .await?;
    Ok(ok_data(&rid, json!({"job_id": job_id})))
}
