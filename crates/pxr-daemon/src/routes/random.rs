//! `GET /random`: filter-aware random selection with the quality strategy,
//! JSON / redirect formats, and the streaming retry loop.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{RawQuery, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Extension;
use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use pxr_db::random::{pick_random_image, pick_random_images, ImageFilter};
use pxr_db::settings::{load_runtime_config, RuntimeConfig};
use pxr_db::ImageRow;
use pxr_types::{iso_utc_ms, ApiError, ErrorCode};

use crate::api::{AppError, RequestId};
use crate::mirror;
use crate::routes::serving;
use crate::state::AppContext;

const MAX_TAG_FILTERS: usize = 50;

// ---------------------------------------------------------------------------
// Query parsing
// ---------------------------------------------------------------------------

/// Repeated-key-aware query map (`included_tags` may appear many times).
pub(crate) struct QueryMap {
    values: HashMap<String, Vec<String>>,
}

impl QueryMap {
    pub(crate) fn parse(raw: Option<&str>) -> Self {
        let mut values: HashMap<String, Vec<String>> = HashMap::new();
        for pair in raw.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urldecode(key);
            let value = urldecode(value);
            values.entry(key).or_default().push(value);
        }
        Self { values }
    }

    pub(crate) fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub(crate) fn first(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    pub(crate) fn all(&self, key: &str) -> &[String] {
        self.values.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn urldecode(raw: &str) -> String {
    let plus_fixed = raw.replace('+', " ");
    match urlencoding::decode(&plus_fixed) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => plus_fixed,
    }
}

fn bad_request(rid: &RequestId, message: &str) -> AppError {
    AppError::with_rid(ApiError::bad_request(message), rid)
}

pub(crate) fn parse_tag_groups(values: &[String]) -> Vec<Vec<String>> {
    let mut groups = Vec::new();
    for raw in values {
        let mut group = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for part in raw.split('|') {
            let term = part.trim();
            if term.is_empty() || !seen.insert(term.to_string()) {
                continue;
            }
            group.push(term.to_string());
        }
        if !group.is_empty() {
            groups.push(group);
        }
    }
    groups
}

pub(crate) fn parse_flat_tags(values: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for raw in values {
        for part in raw.split('|') {
            let term = part.trim();
            if term.is_empty() || !seen.insert(term.to_string()) {
                continue;
            }
            out.push(term.to_string());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Quality scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ScoreWeights {
    bookmark: f64,
    view: f64,
    comment: f64,
    pixels: f64,
    bookmark_rate: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            bookmark: 4.0,
            view: 0.5,
            comment: 2.0,
            pixels: 1.0,
            bookmark_rate: 3.0,
        }
    }
}

#[derive(Debug, Clone)]
struct Multipliers {
    ai: f64,
    non_ai: f64,
    unknown_ai: f64,
    illust: f64,
    manga: f64,
    ugoira: f64,
    unknown_illust_type: f64,
}

impl Default for Multipliers {
    fn default() -> Self {
        Self {
            ai: 1.0,
            non_ai: 1.0,
            unknown_ai: 1.0,
            illust: 1.0,
            manga: 1.0,
            ugoira: 1.0,
            unknown_illust_type: 1.0,
        }
    }
}

fn quality_score(image: &ImageRow, weights: &ScoreWeights) -> f64 {
    let bookmark = image.bookmark_count.unwrap_or(0).max(0) as f64;
    let view = image.view_count.unwrap_or(0).max(0) as f64;
    let comment = image.comment_count.unwrap_or(0).max(0) as f64;
    let pixels = match (image.width, image.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w * h) as f64,
        _ => 0.0,
    };
    let rate_term = if view > 0.0 {
        ((bookmark / view) * 1000.0).max(0.0).ln_1p()
    } else {
        0.0
    };

    weights.bookmark * bookmark.ln_1p()
        + weights.view * view.ln_1p()
        + weights.comment * comment.ln_1p()
        + weights.pixels * (pixels / 1_000_000.0).ln_1p()
        + weights.bookmark_rate * rate_term
}

fn multiplier_for_image(image: &ImageRow, multipliers: &Multipliers) -> f64 {
    let ai = match image.ai_type {
        Some(1) => multipliers.ai,
        Some(0) => multipliers.non_ai,
        _ => multipliers.unknown_ai,
    };
    let it = match image.illust_type {
        Some(0) => multipliers.illust,
        Some(1) => multipliers.manga,
        Some(2) => multipliers.ugoira,
        _ => multipliers.unknown_illust_type,
    };
    let m = ai * it;
    if m.is_finite() && m > 0.0 {
        m
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Request plan
// ---------------------------------------------------------------------------

struct RandomPlan {
    format: String,
    redirect: bool,
    attempts: i64,
    seed: Option<String>,
    strategy: String,
    quality_samples: i64,
    pick_mode: String,
    temperature: f64,
    weights: ScoreWeights,
    multipliers: Multipliers,
    filter: ImageFilter,
    use_pixiv_cat: bool,
    mirror_host: String,
    mirror_host_override: Option<String>,
    pixiv_cat_param: bool,
    applied_filters: Value,
}

fn runtime_object<'v>(runtime: &'v RuntimeConfig, key: &str) -> Option<&'v Value> {
    runtime.random_defaults.get(key)
}

fn parse_f64(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[allow(clippy::too_many_lines)]
fn build_plan(
    query: &QueryMap,
    headers: &HeaderMap,
    runtime: &RuntimeConfig,
    rid: &RequestId,
) -> Result<RandomPlan, AppError> {
    let format = query.first("format").unwrap_or("image").to_string();
    if !matches!(format.as_str(), "image" | "json" | "simple_json") {
        return Err(bad_request(rid, "Unsupported format"));
    }
    let redirect = match query.first("redirect").unwrap_or("0") {
        "0" => false,
        "1" => true,
        _ => return Err(bad_request(rid, "Unsupported redirect")),
    };

    let seed = match query.first("seed") {
        None => None,
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.len() > 128 {
                return Err(bad_request(rid, "Unsupported seed"));
            }
            Some(trimmed.to_string())
        }
    };

    // r18 family.
    let r18 = match query.first("r18").unwrap_or("0").parse::<i64>() {
        Ok(v @ 0..=2) => v,
        _ => return Err(bad_request(rid, "Unsupported r18")),
    };
    let r18_strict = match query.first("r18_strict") {
        Some(raw) => match raw.parse::<i64>() {
            Ok(0) => false,
            Ok(1) => true,
            _ => return Err(bad_request(rid, "Unsupported r18_strict")),
        },
        None => match runtime_object(runtime, "default_r18_strict") {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(true),
            _ => true,
        },
    };

    // ai / illust type.
    let ai_type = match query.first("ai_type").unwrap_or("any").trim().to_ascii_lowercase().as_str()
    {
        "" | "any" => None,
        "0" => Some(0),
        "1" => Some(1),
        _ => return Err(bad_request(rid, "Unsupported ai_type")),
    };
    let illust_type = match query
        .first("illust_type")
        .unwrap_or("any")
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "" | "any" => None,
        "0" | "illust" | "illustration" => Some(0),
        "1" | "manga" => Some(1),
        "2" | "ugoira" => Some(2),
        _ => return Err(bad_request(rid, "Unsupported illust_type")),
    };

    // orientation / layout (+ aliases).
    let (layout_key, raw_layout) = if query.has("layout") {
        ("layout", query.first("layout").unwrap_or("any"))
    } else {
        ("orientation", query.first("orientation").unwrap_or("any"))
    };
    let mut layout = raw_layout.trim().to_ascii_lowercase();
    layout = match layout.as_str() {
        "vertical" => "portrait".to_string(),
        "horizontal" => "landscape".to_string(),
        other => other.to_string(),
    };
    let mut orientation = match layout.as_str() {
        "any" | "" => None,
        "portrait" => Some(1),
        "landscape" => Some(2),
        "square" => Some(3),
        _ => {
            return Err(bad_request(
                rid,
                if layout_key == "layout" {
                    "Unsupported layout"
                } else {
                    "Unsupported orientation"
                },
            ))
        }
    };

    let adaptive = match query.first("adaptive").unwrap_or("0") {
        "0" => false,
        "1" => true,
        _ => return Err(bad_request(rid, "Unsupported adaptive")),
    };

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

    // Minimum thresholds.
    let mut mins: HashMap<&str, i64> = HashMap::new();
    for key in [
        "min_width",
        "min_height",
        "min_pixels",
        "min_bookmarks",
        "min_views",
        "min_comments",
    ] {
        let value = match query.first(key) {
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|v| *v >= 0)
                .ok_or_else(|| bad_request(rid, "Unsupported min_*"))?,
            None => 0,
        };
        mins.insert(key, value);
    }

    // Adaptive device defaults never override explicit parameters.
    if adaptive {
        let orientation_explicit = query.has("layout") || query.has("orientation");
        let min_explicit =
            query.has("min_width") || query.has("min_height") || query.has("min_pixels");

        let ch_mobile = headers
            .get("sec-ch-ua-mobile")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .trim()
            .to_string();
        let is_mobile = match ch_mobile.as_str() {
            "?1" => true,
            "?0" => false,
            _ => {
                let ua = headers
                    .get("user-agent")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("")
                    .to_ascii_lowercase();
                ["mobi", "android", "iphone", "ipad", "ipod"]
                    .iter()
                    .any(|needle| ua.contains(needle))
            }
        };

        if !orientation_explicit && orientation.is_none() {
            orientation = Some(if is_mobile { 1 } else { 2 });
        }
        if !min_explicit
            && mins["min_width"] == 0
            && mins["min_height"] == 0
            && mins["min_pixels"] == 0
        {
            mins.insert("min_pixels", if is_mobile { 1_000_000 } else { 2_000_000 });
        }
    }

    // Tags.
    let included_tag_groups = parse_tag_groups(query.all("included_tags"));
    let excluded_tags = parse_flat_tags(query.all("excluded_tags"));
    if included_tag_groups.len() > MAX_TAG_FILTERS || excluded_tags.len() > MAX_TAG_FILTERS {
        return Err(bad_request(rid, "Too many tag filters"));
    }

    // Identity / time range filters.
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

    // attempts / strategy / samples, with runtime defaults. Invalid query
    // values are 400s; invalid runtime values silently fall back.
    let attempts = match query.first("attempts") {
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|v| (1..=10).contains(v))
            .ok_or_else(|| bad_request(rid, "Unsupported attempts"))?,
        None => runtime_object(runtime, "default_attempts")
            .and_then(Value::as_i64)
            .filter(|v| (1..=10).contains(v))
            .unwrap_or(3),
    };

    let strategy = match query.first("strategy") {
        Some(raw) => {
            let value = raw.trim().to_ascii_lowercase();
            if !matches!(value.as_str(), "quality" | "random") {
                return Err(bad_request(rid, "Unsupported strategy"));
            }
            value
        }
        None => runtime_object(runtime, "strategy")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| matches!(s.as_str(), "quality" | "random"))
            .unwrap_or_else(|| "quality".to_string()),
    };

    let quality_samples = match query.first("quality_samples") {
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|v| (1..=1000).contains(v))
            .ok_or_else(|| bad_request(rid, "Unsupported quality_samples"))?,
        None => runtime_object(runtime, "quality_samples")
            .and_then(Value::as_i64)
            .filter(|v| (1..=1000).contains(v))
            .unwrap_or(5),
    };

    // Recommendation config: runtime `random.defaults.recommendation`,
    // overridable per request via rec_* parameters.
    let recommendation = runtime_object(runtime, "recommendation")
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or_else(|| json!({}));

    let mut pick_mode = recommendation
        .get("pick_mode")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| matches!(s.as_str(), "best" | "weighted"))
        .unwrap_or_else(|| "weighted".to_string());
    if let Some(raw) = query.first("rec_pick_mode") {
        let value = raw.trim().to_ascii_lowercase();
        if !matches!(value.as_str(), "best" | "weighted") {
            return Err(bad_request(rid, "Unsupported rec_pick_mode"));
        }
        pick_mode = value;
    }

    let mut temperature = recommendation
        .get("temperature")
        .and_then(Value::as_f64)
        .unwrap_or(1.0);
    if let Some(raw) = query.first("rec_temperature") {
        temperature = parse_f64(raw).ok_or_else(|| bad_request(rid, "Unsupported rec_temperature"))?;
    }
    let temperature = temperature.clamp(0.05, 100.0);

    let weight_value = |name: &str, default: f64| -> Result<f64, AppError> {
        let mut value = recommendation
            .get("score_weights")
            .and_then(|w| w.get(name))
            .and_then(Value::as_f64)
            .unwrap_or(default);
        if let Some(raw) = query.first(&format!("rec_w_{name}")) {
            value = parse_f64(raw).ok_or_else(|| bad_request(rid, "Unsupported rec_w_*"))?;
        }
        Ok(value.clamp(-100.0, 100.0))
    };
    let defaults = ScoreWeights::default();
    let weights = ScoreWeights {
        bookmark: weight_value("bookmark", defaults.bookmark)?,
        view: weight_value("view", defaults.view)?,
        comment: weight_value("comment", defaults.comment)?,
        pixels: weight_value("pixels", defaults.pixels)?,
        bookmark_rate: weight_value("bookmark_rate", defaults.bookmark_rate)?,
    };

    let multiplier_value = |name: &str| -> Result<f64, AppError> {
        let mut value = recommendation
            .get("multipliers")
            .and_then(|m| m.get(name))
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        if let Some(raw) = query.first(&format!("rec_m_{name}")) {
            value = parse_f64(raw).ok_or_else(|| bad_request(rid, "Unsupported rec_m_*"))?;
        }
        Ok(value.clamp(0.0, 100.0))
    };
    let multipliers = Multipliers {
        ai: multiplier_value("ai")?,
        non_ai: multiplier_value("non_ai")?,
        unknown_ai: multiplier_value("unknown_ai")?,
        illust: multiplier_value("illust")?,
        manga: multiplier_value("manga")?,
        ugoira: multiplier_value("ugoira")?,
        unknown_illust_type: multiplier_value("unknown_illust_type")?,
    };

    // Failure cooldown window for serving.
    let fail_cooldown_ms = runtime_object(runtime, "fail_cooldown_ms")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| {
            let seconds = std::env::var("RANDOM_FAIL_COOLDOWN_SECONDS")
                .ok()
                .and_then(|raw| raw.trim().parse::<i64>().ok())
                .unwrap_or(600)
                .clamp(0, 86_400);
            seconds * 1000
        })
        .clamp(0, 86_400_000);
    let fail_cooldown_before = if fail_cooldown_ms > 0 {
        Some(iso_utc_ms(Utc::now() - Duration::milliseconds(fail_cooldown_ms)))
    } else {
        None
    };

    let use_pixiv_cat = runtime.image_proxy_use_pixiv_cat || pixiv_cat_param;
    let runtime_mirror = runtime.image_proxy_pximg_mirror_host.trim();
    let runtime_mirror = if runtime_mirror.is_empty() {
        mirror::DEFAULT_MIRROR_HOST
    } else {
        runtime_mirror
    };
    let mirror_host = mirror_host_override.clone().unwrap_or_else(|| {
        if use_pixiv_cat {
            mirror::pick_mirror_for_request(headers, runtime_mirror)
        } else {
            runtime_mirror.to_string()
        }
    });

    let applied_filters = json!({
        "r18": r18,
        "r18_strict": r18_strict as i64,
        "ai_type": ai_type.map(|v| v.to_string()).unwrap_or_else(|| "any".to_string()),
        "illust_type": illust_type.map(|v| v.to_string()).unwrap_or_else(|| "any".to_string()),
        "adaptive": adaptive as i64,
        "orientation": layout,
        "min_width": mins["min_width"],
        "min_height": mins["min_height"],
        "min_pixels": mins["min_pixels"],
        "min_bookmarks": mins["min_bookmarks"],
        "min_views": mins["min_views"],
        "min_comments": mins["min_comments"],
        "included_tags": included_tag_groups,
        "excluded_tags": excluded_tags,
        "user_id": user_id,
        "illust_id": illust_id,
        "created_from": created_from,
        "created_to": created_to,
    });

    let filter = ImageFilter {
        r18,
        r18_strict,
        orientation,
        ai_type,
        illust_type,
        ai_type_allowed: None,
        illust_type_allowed: None,
        min_width: mins["min_width"],
        min_height: mins["min_height"],
        min_pixels: mins["min_pixels"],
        min_bookmarks: mins["min_bookmarks"],
        min_views: mins["min_views"],
        min_comments: mins["min_comments"],
        included_tag_groups,
        excluded_tags,
        user_id,
        illust_id,
        created_from,
        created_to,
        exclude_image_ids: Vec::new(),
        fail_cooldown_before,
    };

    Ok(RandomPlan {
        format,
        redirect,
        attempts,
        seed,
        strategy,
        quality_samples,
        pick_mode,
        temperature,
        weights,
        multipliers,
        filter,
        use_pixiv_cat,
        mirror_host,
        mirror_host_override,
        pixiv_cat_param,
        applied_filters,
    })
}

fn no_match_error(plan: &RandomPlan, rid: &RequestId) -> AppError {
    let mut suggestions: Vec<&str> = vec!["run a hydration backfill to improve metadata coverage"];
    if plan.filter.r18 == 0 && plan.filter.r18_strict {
        suggestions.push("set r18_strict=0 to allow images with unknown x_restrict");
    }
    if plan.filter.orientation.is_some() {
        suggestions.push("set orientation=any");
    }
    if plan.filter.min_width > 0 || plan.filter.min_height > 0 || plan.filter.min_pixels > 0 {
        suggestions.push("lower min_width/min_height/min_pixels");
    }
    if plan.filter.min_bookmarks > 0 || plan.filter.min_views > 0 || plan.filter.min_comments > 0 {
        suggestions.push("lower min_bookmarks/min_views/min_comments");
    }
    if !plan.filter.included_tag_groups.is_empty() {
        suggestions.push("relax included_tags");
    }
    if !plan.filter.excluded_tags.is_empty() {
        suggestions.push("relax excluded_tags");
    }
    if plan.filter.user_id.is_some() {
        suggestions.push("remove the user_id filter");
    }
    if plan.filter.illust_id.is_some() {
        suggestions.push("remove the illust_id filter");
    }
    if plan.filter.ai_type.is_some() {
        suggestions.push("set ai_type=any");
    }
    if plan.filter.illust_type.is_some() {
        suggestions.push("set illust_type=any");
    }
    if plan.filter.created_from.is_some() || plan.filter.created_to.is_some() {
        suggestions.push("widen created_from/created_to");
    }

    AppError::with_rid(
        ApiError::new(ErrorCode::NoMatch, "No image matches the filters", 404).with_details(json!({
            "hints": {
                "applied_filters": plan.applied_filters,
                "suggestions": suggestions,
            }
        })),
        rid,
    )
}

// ---------------------------------------------------------------------------
// Picking
// ---------------------------------------------------------------------------

fn seeded_rng(seed: Option<&str>) -> StdRng {
    match seed {
        Some(seed) => {
            let digest = Sha256::digest(seed.as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest[..8]);
            StdRng::seed_from_u64(u64::from_le_bytes(bytes))
        }
        None => StdRng::seed_from_u64(rand::thread_rng().next_u64()),
    }
}

async fn pick_with_strategy(
    ctx: &AppContext,
    plan: &RandomPlan,
    rng: &mut StdRng,
    exclude: &[i64],
) -> Result<(Option<ImageRow>, Value), AppError> {
    let mut filter = plan.filter.clone();
    filter.exclude_image_ids = exclude.to_vec();

    if plan.strategy == "random" {
        let image = pick_random_image(&ctx.pool, &filter, rng.gen_range(0.0..1.0)).await?;
        return Ok((image, json!({"picked_by": "random_key"})));
    }

    // Zero multipliers remove whole categories in SQL up front.
    let mut ai_allowed: Vec<Option<i64>> = Vec::new();
    if plan.multipliers.ai > 0.0 {
        ai_allowed.push(Some(1));
    }
    if plan.multipliers.non_ai > 0.0 {
        ai_allowed.push(Some(0));
    }
    if plan.multipliers.unknown_ai > 0.0 {
        ai_allowed.push(None);
    }
    let mut illust_allowed: Vec<Option<i64>> = Vec::new();
    if plan.multipliers.illust > 0.0 {
        illust_allowed.push(Some(0));
    }
    if plan.multipliers.manga > 0.0 {
        illust_allowed.push(Some(1));
    }
    if plan.multipliers.ugoira > 0.0 {
        illust_allowed.push(Some(2));
    }
    if plan.multipliers.unknown_illust_type > 0.0 {
        illust_allowed.push(None);
    }
    filter.ai_type_allowed = Some(ai_allowed);
    filter.illust_type_allowed = Some(illust_allowed);

    let candidates =
        pick_random_images(&ctx.pool, &filter, rng.gen_range(0.0..1.0), plan.quality_samples)
            .await?;
    let drawn = candidates.len();

    let mut scored: Vec<(ImageRow, f64, f64, f64)> = Vec::new();
    for image in candidates {
        let multiplier = multiplier_for_image(&image, &plan.multipliers);
        if multiplier <= 0.0 {
            continue;
        }
        let score = quality_score(&image, &plan.weights);
        let logit = score / plan.temperature + multiplier.ln();
        scored.push((image, score, multiplier, logit));
    }

    let picked_by = if plan.pick_mode == "best" {
        "quality_best"
    } else {
        "quality_weighted"
    };
    let debug = json!({
        "picked_by": picked_by,
        "candidates_drawn": drawn,
        "candidates_accepted": scored.len(),
        "quality_pick_mode": plan.pick_mode,
        "quality_temperature": plan.temperature,
    });

    if scored.is_empty() {
        return Ok((None, debug));
    }

    let index = if plan.pick_mode == "best" {
        argmax(&scored)
    } else {
        // Stable softmax over the logits.
        let max_logit = scored
            .iter()
            .map(|(_, _, _, logit)| *logit)
            .fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = scored
            .iter()
            .map(|(_, _, _, logit)| (logit - max_logit).exp())
            .collect();
        let total: f64 = weights.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            argmax(&scored)
        } else {
            let mut roll = rng.gen_range(0.0..1.0) * total;
            let mut chosen = weights.len() - 1;
            for (i, weight) in weights.iter().enumerate() {
                roll -= weight;
                if roll <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        }
    };

    let (image, score, multiplier, _) = scored.swap_remove(index);
    let mut debug = debug;
    debug["quality_score"] = json!(score);
    debug["quality_multiplier"] = json!(multiplier);
    Ok((Some(image), debug))
}

fn argmax(scored: &[(ImageRow, f64, f64, f64)]) -> usize {
    let mut best = 0;
    for (i, entry) in scored.iter().enumerate() {
        if entry.3 > scored[best].3 {
            best = i;
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

fn image_json(image: &ImageRow, tags: Option<&[String]>, hide_origin: bool) -> Value {
    let mut body = json!({
        "image": {
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
        },
        "urls": {
            "proxy": format!("/i/{}.{}", image.id, image.ext),
            "origin": if hide_origin { Value::Null } else { json!(image.original_url) },
            "legacy_single": format!("/{}.{}", image.illust_id, image.ext),
            "legacy_multi": format!("/{}-{}.{}", image.illust_id, image.page_index + 1, image.ext),
        },
    });
    if let Some(tags) = tags {
        body["tags"] = json!(tags);
    }
    body
}

pub async fn random(
    State(ctx): State<Arc<AppContext>>,
    Extension(rid): Extension<RequestId>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, AppError> {
    let query = QueryMap::parse(raw_query.as_deref());
    let runtime = load_runtime_config(&ctx.pool).await?;
    let plan = build_plan(&query, &headers, &runtime, &rid)?;
    let mut rng = seeded_rng(plan.seed.as_deref());

    // JSON formats and the redirect variant pick exactly once.
    if plan.format != "image" || plan.redirect {
        let (image, debug) = pick_with_strategy(&ctx, &plan, &mut rng, &[]).await?;
        let Some(image) = image else {
            return Err(no_match_error(&plan, &rid));
        };

        if image.missing_core_metadata() {
            serving::spawn_opportunistic_hydrate(&ctx, image.illust_id, "random");
        }

        if plan.format == "image" {
            let mut target = format!("/i/{}.{}", image.id, image.ext);
            let mut params: Vec<String> = Vec::new();
            if plan.pixiv_cat_param {
                params.push("pixiv_cat=1".to_string());
            }
            if let Some(host) = &plan.mirror_host_override {
                params.push(format!("pximg_mirror_host={host}"));
            }
            if !params.is_empty() {
                target = format!("{target}?{}", params.join("&"));
            }
            return Ok(Redirect::temporary(&target).into_response());
        }

        let tags = if plan.format == "json" {
            Some(pxr_db::tags::get_tag_names_for_image(&ctx.pool, image.id).await?)
        } else {
            None
        };
        let mut data = image_json(
            &image,
            tags.as_deref(),
            runtime.hide_origin_url_in_public_json,
        );
        data["debug"] = debug;
        return Ok(crate::api::ok_data(&rid, data));
    }

    // Image format: retry across picks while upstream streaming fails.
    let mut tried: Vec<i64> = Vec::new();
    let mut last_error: Option<ApiError> = None;

    for _ in 0..plan.attempts {
        let (image, _debug) = pick_with_strategy(&ctx, &plan, &mut rng, &tried).await?;
        let Some(image) = image else { break };

        let source_url = if plan.use_pixiv_cat {
            mirror::rewrite_pximg_to_mirror(&image.original_url, &plan.mirror_host)
        } else {
            image.original_url.clone()
        };
        let source_url = ctx.upstream_url(&source_url);

        let proxy = if plan.use_pixiv_cat {
            None
        } else {
            serving::select_stream_proxy(&ctx, &runtime, &image.original_url).await?
        };

        match crate::stream::stream_url(
            &source_url,
            proxy.as_deref(),
            "no-store",
            headers.get("range").and_then(|value| value.to_str().ok()),
        )
        .await
        {
            Ok(response) => {
                serving::after_successful_stream(&ctx, &image, "random");
                return Ok(response);
            }
            Err(err) if serving::is_upstream_serve_error(&err.code) => {
                serving::mark_failure_best_effort(&ctx, image.id, &err);
                tried.push(image.id);
                last_error = Some(err);
            }
            Err(err) => return Err(AppError::with_rid(err, &rid)),
        }
    }

    match last_error {
        None => Err(no_match_error(&plan, &rid)),
        Some(last) => Err(AppError::with_rid(
            ApiError::new(
                ErrorCode::UpstreamStreamError,
                "Upstream streaming failed after retries",
                502,
            )
            .with_details(json!({
                "attempts_used": tried.len(),
                "last_upstream_code": last.code.as_str(),
            })),
            &rid,
        )),
    }
}
