//! Public read endpoints: image streaming (`/i/{id}.{ext}` and the legacy
//! aliases), listings, and lookups.

use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Extension;
use serde_json::json;

use pxr_db::random::ImageFilter;
use pxr_db::settings::load_runtime_config;
use pxr_db::ImageRow;
use pxr_pixiv::urls::ALLOWED_IMAGE_EXTS;
use pxr_types::ApiError;

use crate::api::{ok_item, ok_items, AppError, RequestId};
use crate::mirror;
use crate::routes::random::QueryMap;
use crate::routes::serving;
use crate::state::AppContext;

fn bad_request(rid: &RequestId, message: &str) -> AppError {
    AppError::with_rid(ApiError::bad_request(message), rid)
}

fn not_found(rid: &RequestId, message: &str) -> AppError {
    AppError::with_rid(ApiError::not_found(message), rid)
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

struct StreamOptions {
    use_pixiv_cat: bool,
    mirror_host: String,
}

async fn stream_options(
    ctx: &AppContext,
    query: &QueryMap,
    headers: &HeaderMap,
    rid: &RequestId,
) -> Result<(StreamOptions, pxr_db::settings::RuntimeConfig), AppError> {
    let runtime = load_runtime_config(&ctx.pool).await?;

    let pixiv_cat_param = match query.first("pixiv_cat").unwrap_or("0") {
        "0" => false,
        "1" => true,
        _ => return Err(bad_request(rid, "Unsupported pixiv_cat")),
    };
    let mirror_host_override = match query.first("pximg_mirror_host") {
        None => None,
        Some(raw) if raw.trim().is_empty() => None,
        Some(raw) => match mirror::normalize_mirror_host(raw) {
            Some(host) => Some(host),
            None => return Err(bad_request(rid, "Unsupported pximg_mirror_host")),
        },
    };

    let use_pixiv_cat = runtime.image_proxy_use_pixiv_cat || pixiv_cat_param;
    let runtime_mirror = runtime.image_proxy_pximg_mirror_host.trim().to_string();
    let runtime_mirror = if runtime_mirror.is_empty() {
        mirror::DEFAULT_MIRROR_HOST.to_string()
    } else {
        runtime_mirror
    };
    let mirror_host = mirror_host_override.unwrap_or_else(|| {
        if use_pixiv_cat {
            mirror::pick_mirror_for_request(headers, &runtime_mirror)
        } else {
            runtime_mirror
        }
    });

    Ok((
        StreamOptions {
            use_pixiv_cat,
            mirror_host,
        },
        runtime,
    ))
}

/// Stream one image row, marking serve health and (optionally) enqueueing
/// hydration.
async fn stream_image(
    ctx: &AppContext,
    image: &ImageRow,
    options: &StreamOptions,
    runtime: &pxr_db::settings::RuntimeConfig,
    headers: &HeaderMap,
    cache_control: &str,
    opportunistic_reason: Option<&str>,
) -> Result<Response, AppError> {
    let source_url = if options.use_pixiv_cat {
        mirror::rewrite_pximg_to_mirror(&image.original_url, &options.mirror_host)
    } else {
        image.original_url.clone()
    };
    let source_url = ctx.upstream_url(&source_url);

    let proxy = if options.use_pixiv_cat {
        None
    } else {
        serving::select_stream_proxy(ctx, runtime, &image.original_url).await?
    };

    match crate::stream::stream_url(
        &source_url,
        proxy.as_deref(),
        cache_control,
        headers.get("range").and_then(|value| value.to_str().ok()),
    )
    .await
    {
        Ok(response) => {
            match opportunistic_reason {
                Some(reason) => serving::after_successful_stream(ctx, image, reason),
                None => {
                    // Legacy path: health marks only, no hydration enqueue.
                    if image.last_ok_at.is_none() || image.last_error_code.is_some() {
                        let pool = ctx.pool.clone();
                        let image_id = image.id;
                        tokio::spawn(async move {
                            let _ = pxr_db::images::mark_image_ok(
                                &pool,
                                image_id,
                                &pxr_types::now_iso(),
                            )
                            .await;
                        });
                    }
                }
            }
            Ok(response)
        }
        Err(err) => {
            if serving::is_upstream_serve_error(&err.code) {
                serving::mark_failure_best_effort(ctx, image.id, &err);
            }
            Err(err.into())
        }
    }
}

/// `GET /i/{image_id}.{ext}`, the canonical streaming route.
pub async fn image_proxy(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(file): Path<String>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, AppError> {
    let (image_id, ext) = parse_file_name(&file)
        .ok_or_else(|| bad_request(&rid, "Unsupported ext"))?;
    let query = QueryMap::parse(raw_query.as_deref());

    let image = pxr_db::images::get_image_by_id(&ctx.pool, image_id)
        .await?
        .filter(|image| image.ext.eq_ignore_ascii_case(&ext))
        .ok_or_else(|| not_found(&rid, "Image not found"))?;

    // Tag coverage decides opportunism when the scalar fields are complete.
    let needs_hydrate = image.missing_core_metadata()
        || !pxr_db::tags::image_has_tags(&ctx.pool, image.id).await?;

    let (options, runtime) = stream_options(&ctx, &query, &headers, &rid).await?;
    let response = stream_image(
        &ctx,
        &image,
        &options,
        &runtime,
        &headers,
        "public, max-age=31536000, immutable",
        Some("image_proxy").filter(|_| needs_hydrate),
    )
    .await?;
    Ok(response)
}

/// Legacy `GET /{illust_id}.{ext}` and `GET /{illust_id}-{page}.{ext}`.
pub async fn legacy_image(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(file): Path<String>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, AppError> {
    let (stem, ext) = split_ext(&file).ok_or_else(|| not_found(&rid, "Not found"))?;
    let query = QueryMap::parse(raw_query.as_deref());

    let (illust_id, page_index) = match stem.split_once('-') {
        Some((illust, page)) => {
            let illust: i64 = illust.parse().map_err(|_| not_found(&rid, "Not found"))?;
            let page: i64 = page.parse().map_err(|_| not_found(&rid, "Not found"))?;
            if page < 1 {
                return Err(not_found(&rid, "Not found"));
            }
            (illust, page - 1)
        }
        None => {
            let illust: i64 = stem.parse().map_err(|_| not_found(&rid, "Not found"))?;
            (illust, 0)
        }
    };

    let image = pxr_db::images::get_image_by_illust_page(&ctx.pool, illust_id, page_index)
        .await?
        .filter(|image| image.ext.eq_ignore_ascii_case(&ext))
        .ok_or_else(|| not_found(&rid, "Image not found"))?;

    let (options, runtime) = stream_options(&ctx, &query, &headers, &rid).await?;
    stream_image(
        &ctx,
        &image,
        &options,
        &runtime,
        &headers,
        "public, max-age=31536000, immutable",
        None,
    )
    .await
}

fn split_ext(file: &str) -> Option<(&str, String)> {
    let (stem, ext) = file.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    if !ALLOWED_IMAGE_EXTS.contains(&ext.as_str()) {
        return None;
    }
    Some((stem, ext))
}

fn parse_file_name(file: &str) -> Option<(i64, String)> {
    let (stem, ext) = split_ext(file)?;
    let image_id: i64 = stem.parse().ok()?;
    if image_id <= 0 {
        return None;
    }
    Some((image_id, ext))
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

fn list_filter_from_query(query: &QueryMap, rid: &RequestId) -> Result<ImageFilter, AppError> {
    let r18 = match query.first("r18").unwrap_or("0").parse::<i64>() {
        Ok(v @ 0..=2) => v,
        _ => return Err(bad_request(rid, "Unsupported r18")),
    };
    let r18_strict = match query.first("r18_strict").unwrap_or("1") {
        "0" => false,
        "1" => true,
        _ => return Err(bad_request(rid, "Unsupported r18_strict")),
    };
    let ai_type = match query.first("ai_type").unwrap_or("any").trim().to_ascii_lowercase().as_str()
    {
        "" | "any" => None,
        "0" => Some(0),
        "1" => Some(1),
        _ => return Err(bad_request(rid, "Unsupported ai_type")),
    };
    let orientation = match query
        .first("orientation")
        .unwrap_or("any")
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "any" | "" => None,
        "portrait" => Some(1),
        "landscape" => Some(2),
        "square" => Some(3),
        _ => return Err(bad_request(rid, "Unsupported orientation")),
    };

    let min = |key: &str| -> Result<i64, AppError> {
        match query.first(key) {
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|v| *v >= 0)
                .ok_or_else(|| bad_request(rid, "Unsupported min_*")),
            None => Ok(0),
        }
    };

    let included_tag_groups = super::random::parse_tag_groups(query.all("included_tags"));
    let excluded_tags = super::random::parse_flat_tags(query.all("excluded_tags"));

    let user_id = match query.first("user_id") {
        Some(raw) => Some(
            raw.parse::<i64>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| bad_request(rid, "Unsupported user_id"))?,
        ),
        None => None,
    };
    let illust_id = match query.first("illust_id") {
        Some(raw) => Some(
            raw.parse::<i64>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| bad_request(rid, "Unsupported illust_id"))?,
        ),
        None => None,
    };
    let created_from = match query.first("created_from") {
        Some(raw) => Some(
            pxr_types::normalize_iso_utc_seconds(raw)
                .ok_or_else(|| bad_request(rid, "Unsupported created_*"))?,
        ),
        None => None,
    };
    let created_to = match query.first("created_to") {
        Some(raw) => Some(
            pxr_types::normalize_iso_utc_seconds(raw)
                .ok_or_else(|| bad_request(rid, "Unsupported created_*"))?,
        ),
        None => None,
    };
    if let (Some(from), Some(to)) = (&created_from, &created_to) {
        if from > to {
            return Err(bad_request(rid, "created_from > created_to"));
        }
    }

    Ok(ImageFilter {
        r18,
        r18_strict,
        orientation,
        ai_type,
        illust_type: None,
        ai_type_allowed: None,
        illust_type_allowed: None,
        min_width: min("min_width")?,
        min_height: min("min_height")?,
        min_pixels: min("min_pixels")?,
        min_bookmarks: 0,
        min_views: 0,
        min_comments: 0,
        included_tag_groups,
        excluded_tags,
        user_id,
        illust_id,
        created_from,
        created_to,
        exclude_image_ids: Vec::new(),
        fail_cooldown_before: None,
    })
}

fn public_image_item(image: &ImageRow) -> serde_json::Value {
    json!({
        "id": image.id.to_string(),
        "illust_id": image.illust_id.to_string(),
        "page_index": image.page_index,
        "ext": image.ext,
        "width": image.width,
        "height": image.height,
        "x_restrict": image.x_restrict,
        "ai_type": image.ai_type,
        "illust_type": image.illust_type,
        "bookmark_count": image.bookmark_count,
        "view_count": image.view_count,
        "comment_count": image.comment_count,
        "user": {
            "id": image.user_id.map(|id| id.to_string()),
            "name": image.user_name,
        },
        "title": image.title,
        "created_at_pixiv": image.created_at_pixiv,
    })
}

/// `GET /images`.
pub async fn list_images(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, AppError> {
    let query = QueryMap::parse(raw_query.as_deref());

    let limit = match query.first("limit") {
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|v| (1..=200).contains(v))
            .ok_or_else(|| bad_request(&rid, "Unsupported limit"))?,
        None => 50,
    };
    let cursor = match query.first("cursor").map(str::trim).filter(|c| !c.is_empty()) {
        Some(raw) => Some(
            raw.parse::<i64>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| bad_request(&rid, "Unsupported cursor"))?,
        ),
        None => None,
    };

    let filter = list_filter_from_query(&query, &rid)?;
    let (images, next_cursor) = pxr_db::images::list_images(&ctx.pool, &filter, limit, cursor).await?;

    let items: Vec<serde_json::Value> = images.iter().map(public_image_item).collect();
    Ok(ok_items(
        &rid,
        json!(items),
        next_cursor.map(|c| c.to_string()),
    ))
}

/// `GET /images/{id}`.
pub async fn get_image(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    Path(image_id): Path<i64>,
) -> Result<Response, AppError> {
    if image_id <= 0 {
        return Err(bad_request(&rid, "Unsupported image_id"));
    }
    let image = pxr_db::images::get_image_by_id(&ctx.pool, image_id)
        .await?
        .ok_or_else(|| not_found(&rid, "Image not found"))?;
    let tags = pxr_db::tags::get_tag_names_for_image(&ctx.pool, image.id).await?;

    Ok(ok_item(
        &rid,
        json!({
            "image": public_image_item(&image),
            "tags": tags,
        }),
    ))
}

/// `GET /tags`.
pub async fn list_tags(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, AppError> {
    let query = QueryMap::parse(raw_query.as_deref());
    let limit = match query.first("limit") {
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|v| (1..=200).contains(v))
            .ok_or_else(|| bad_request(&rid, "Unsupported limit"))?,
        None => 50,
    };
    let cursor = match query.first("cursor").map(str::trim).filter(|c| !c.is_empty()) {
        Some(raw) => Some(
            raw.parse::<i64>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| bad_request(&rid, "Unsupported cursor"))?,
        ),
        None => None,
    };

    let (tags, next_cursor) =
        pxr_db::tags::list_tags(&ctx.pool, query.first("q"), limit, cursor).await?;
    let items: Vec<serde_json::Value> = tags
        .iter()
        .map(|tag| {
            json!({
                "id": tag.id.to_string(),
                "name": tag.name,
                "translated_name": tag.translated_name,
            })
        })
        .collect();
    Ok(ok_items(&rid, json!(items), next_cursor.map(|c| c.to_string())))
}

/// `GET /authors`.
pub async fn list_authors(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, AppError> {
    let query = QueryMap::parse(raw_query.as_deref());
    let limit = match query.first("limit") {
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|v| (1..=200).contains(v))
            .ok_or_else(|| bad_request(&rid, "Unsupported limit"))?,
        None => 50,
    };
    let cursor = match query.first("cursor").map(str::trim).filter(|c| !c.is_empty()) {
        Some(raw) => Some(
            raw.parse::<i64>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| bad_request(&rid, "Unsupported cursor"))?,
        ),
        None => None,
    };

    let (authors, next_cursor) =
        pxr_db::tags::list_authors(&ctx.pool, query.first("q"), limit, cursor).await?;
    let items: Vec<serde_json::Value> = authors
        .iter()
        .map(|author| {
            json!({
                "user_id": author.user_id.to_string(),
                "user_name": author.user_name,
                "image_count": author.image_count,
            })
        })
        .collect();
    Ok(ok_items(&rid, json!(items), next_cursor.map(|c| c.to_string())))
}

#[cfg(test)]
mod tests {
    use super::{parse_file_name, split_ext};

    #[test]
    fn file_names_parse() {
        assert_eq!(parse_file_name("12.jpg"), Some((12, "jpg".to_string())));
        assert_eq!(parse_file_name("12.JPG"), Some((12, "jpg".to_string())));
        assert_eq!(parse_file_name("x.jpg"), None);
        assert_eq!(parse_file_name("12.tiff"), None);
        assert_eq!(parse_file_name("12"), None);
    }

    #[test]
    fn legacy_stems_split() {
        assert_eq!(split_ext("100-2.png").map(|(s, e)| (s.to_string(), e)),
            Some(("100-2".to_string(), "png".to_string())));
    }
}
