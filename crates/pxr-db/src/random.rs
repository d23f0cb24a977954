//! Filter-aware random sampling over the image population.
//!
//! The sort key is `random_key`, a uniform value in [0,1) fixed at insert.
//! A pick draws `r`, takes rows with `random_key >= r` in key order, and
//! wraps around below `r` for the remainder. Uniform over the filtered
//! population, no full scan, stable under concurrent picks.

use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::entities::ImageRow;

const IMAGE_COLUMNS: &str = "id, illust_id, page_index, ext, original_url, proxy_path, random_key, \
     status, width, height, aspect_ratio, orientation, x_restrict, ai_type, illust_type, \
     user_id, user_name, title, created_at_pixiv, bookmark_count, view_count, comment_count, \
     last_ok_at, last_fail_at, last_error_code, fail_count, created_import_id, added_at, updated_at";

/// Predicates applied to the enabled population. All fields are conjunctive;
/// `included_tag_groups` is AND-of-OR (each group must match at least one of
/// its names).
#[derive(Debug, Clone, Default)]
pub struct ImageFilter {
    /// 0 = safe only, 1 = r18 only, 2 = any.
    pub r18: i64,
    /// When filtering safe-only, whether NULL `x_restrict` is excluded.
    pub r18_strict: bool,
    pub orientation: Option<i64>,
    pub ai_type: Option<i64>,
    pub illust_type: Option<i64>,
    /// Allowed-set pushdown for zero quality multipliers. `None` in the set
    /// admits rows with NULL. An empty set matches nothing (callers short-
    /// circuit before querying).
    pub ai_type_allowed: Option<Vec<Option<i64>>>,
    pub illust_type_allowed: Option<Vec<Option<i64>>>,
    pub min_width: i64,
    pub min_height: i64,
    pub min_pixels: i64,
    pub min_bookmarks: i64,
    pub min_views: i64,
    pub min_comments: i64,
    pub included_tag_groups: Vec<Vec<String>>,
    pub excluded_tags: Vec<String>,
    pub user_id: Option<i64>,
    pub illust_id: Option<i64>,
    pub created_from: Option<String>,
    pub created_to: Option<String>,
    pub exclude_image_ids: Vec<i64>,
    /// Rows with `last_fail_at` after this instant are skipped (cooldown).
    pub fail_cooldown_before: Option<String>,
}

impl ImageFilter {
    /// An allowed-set that admits nothing makes the whole filter unmatchable.
    pub fn is_unsatisfiable(&self) -> bool {
        matches!(&self.ai_type_allowed, Some(v) if v.is_empty())
            || matches!(&self.illust_type_allowed, Some(v) if v.is_empty())
    }

    fn push_allowed_set(
        qb: &mut QueryBuilder<'_, Sqlite>,
        column: &str,
        allowed: &[Option<i64>],
        full_domain: &[i64],
    ) {
        let ints: Vec<i64> = {
            let mut v: Vec<i64> = allowed.iter().filter_map(|x| *x).collect();
            v.sort_unstable();
            v.dedup();
            v
        };
        let has_null = allowed.iter().any(|x| x.is_none());

        // Full domain incl. NULL constrains nothing.
        if has_null && ints == full_domain {
            return;
        }

        qb.push(" AND (");
        if !ints.is_empty() {
            qb.push(column).push(" IN (");
            let mut sep = qb.separated(", ");
            for v in &ints {
                sep.push_bind(*v);
            }
            qb.push(")");
            if has_null {
                qb.push(" OR ").push(column).push(" IS NULL");
            }
        } else {
            qb.push(column).push(" IS NULL");
        }
        qb.push(")");
    }

    /// Append the shared `WHERE` body (everything except the random_key
    /// window). Starts from `status=1`.
    pub fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" WHERE status = 1");

        match self.r18 {
            1 => {
                qb.push(" AND x_restrict = 1");
            }
            0 => {
                if self.r18_strict {
                    qb.push(" AND x_restrict = 0");
                } else {
                    qb.push(" AND (x_restrict = 0 OR x_restrict IS NULL)");
                }
            }
            _ => {}
        }

        if let Some(orientation) = self.orientation {
            qb.push(" AND orientation = ").push_bind(orientation);
        }
        if let Some(ai_type) = self.ai_type {
            qb.push(" AND ai_type = ").push_bind(ai_type);
        }
        if let Some(illust_type) = self.illust_type {
            qb.push(" AND illust_type = ").push_bind(illust_type);
        }
        if let Some(allowed) = &self.ai_type_allowed {
            Self::push_allowed_set(qb, "ai_type", allowed, &[0, 1]);
        }
        if let Some(allowed) = &self.illust_type_allowed {
            Self::push_allowed_set(qb, "illust_type", allowed, &[0, 1, 2]);
        }

        if self.min_width > 0 {
            qb.push(" AND width >= ").push_bind(self.min_width);
        }
        if self.min_height > 0 {
            qb.push(" AND height >= ").push_bind(self.min_height);
        }
        if self.min_pixels > 0 {
            qb.push(" AND (width * height) >= ").push_bind(self.min_pixels);
        }
        if self.min_bookmarks > 0 {
            qb.push(" AND bookmark_count >= ").push_bind(self.min_bookmarks);
        }
        if self.min_views > 0 {
            qb.push(" AND view_count >= ").push_bind(self.min_views);
        }
        if self.min_comments > 0 {
            qb.push(" AND comment_count >= ").push_bind(self.min_comments);
        }

        for group in &self.included_tag_groups {
            if group.is_empty() {
                continue;
            }
            qb.push(
                " AND id IN (SELECT it.image_id FROM image_tags it \
                 JOIN tags t ON t.id = it.tag_id WHERE t.name IN (",
            );
            let mut sep = qb.separated(", ");
            for name in group {
                sep.push_bind(name.clone());
            }
            qb.push("))");
        }

        if !self.excluded_tags.is_empty() {
            qb.push(
                " AND id NOT IN (SELECT it.image_id FROM image_tags it \
                 JOIN tags t ON t.id = it.tag_id WHERE t.name IN (",
            );
            let mut sep = qb.separated(", ");
            for name in &self.excluded_tags {
                sep.push_bind(name.clone());
            }
            qb.push("))");
        }

        if let Some(user_id) = self.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(illust_id) = self.illust_id {
            qb.push(" AND illust_id = ").push_bind(illust_id);
        }
        if let Some(from) = &self.created_from {
            qb.push(" AND created_at_pixiv >= ").push_bind(from.clone());
        }
        if let Some(to) = &self.created_to {
            qb.push(" AND created_at_pixiv <= ").push_bind(to.clone());
        }

        if !self.exclude_image_ids.is_empty() {
            qb.push(" AND id NOT IN (");
            let mut sep = qb.separated(", ");
            for id in &self.exclude_image_ids {
                sep.push_bind(*id);
            }
            qb.push(")");
        }

        if let Some(before) = &self.fail_cooldown_before {
            qb.push(" AND (last_fail_at IS NULL OR last_fail_at <= ")
                .push_bind(before.clone())
                .push(")");
        }
    }
}

fn clamp_r(r: f64) -> f64 {
    if !(0.0..1.0).contains(&r) {
        if r < 0.0 {
            0.0
        } else {
            0.999_999_999
        }
    } else {
        r
    }
}

async fn select_window(
    pool: &SqlitePool,
    filter: &ImageFilter,
    window: Option<(&str, f64)>,
    limit: i64,
) -> Result<Vec<ImageRow>> {
    let mut qb: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(format!("SELECT {IMAGE_COLUMNS} FROM images"));
    filter.push_where(&mut qb);
    if let Some((cmp, r)) = window {
        qb.push(" AND random_key ").push(cmp).push(" ").push_bind(r);
    }
    qb.push(" ORDER BY random_key ASC LIMIT ").push_bind(limit);

    qb.build_query_as::<ImageRow>()
        .fetch_all(pool)
        .await
        .context("random pick query failed")
}

/// Pick one image uniformly from the filtered population, or `None` when the
/// population is empty. `r` is the wrap-around cursor start.
pub async fn pick_random_image(
    pool: &SqlitePool,
    filter: &ImageFilter,
    r: f64,
) -> Result<Option<ImageRow>> {
    Ok(pick_random_images(pool, filter, r, 1).await?.into_iter().next())
}

/// Draw up to `limit` images starting at cursor `r`, wrapping around below
/// `r` when the tail of the key space runs short.
pub async fn pick_random_images(
    pool: &SqlitePool,
    filter: &ImageFilter,
    r: f64,
    limit: i64,
) -> Result<Vec<ImageRow>> {
    let limit = limit.clamp(0, 5000);
    if limit == 0 || filter.is_unsatisfiable() {
        return Ok(Vec::new());
    }
    let r = clamp_r(r);

    let mut items = select_window(pool, filter, Some((">=", r)), limit).await?;
    let remain = limit - items.len() as i64;
    if remain > 0 {
        let more = select_window(pool, filter, Some(("<", r)), remain).await?;
        items.extend(more);
    }
    Ok(items)
}
