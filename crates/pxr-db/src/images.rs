//! Image store functions: keyed upserts, lookups, listing, and the
//! serving-path health marks.

use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::entities::ImageRow;
use crate::random::ImageFilter;

const IMAGE_COLUMNS: &str = "id, illust_id, page_index, ext, original_url, proxy_path, random_key, \
     status, width, height, aspect_ratio, orientation, x_restrict, ai_type, illust_type, \
     user_id, user_name, title, created_at_pixiv, bookmark_count, view_count, comment_count, \
     last_ok_at, last_fail_at, last_error_code, fail_count, created_import_id, added_at, updated_at";

/// Insert-or-touch an image keyed by `(illust_id, page_index)`, returning its
/// id. `random_key` applies only on insert; existing rows keep theirs. The
/// caller updates `proxy_path` once the id is known (two-step, because the
/// path embeds the id).
pub async fn upsert_image_by_illust_page(
    pool: &SqlitePool,
    illust_id: i64,
    page_index: i64,
    ext: &str,
    original_url: &str,
    random_key: f64,
    created_import_id: Option<i64>,
    now_iso: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO images (illust_id, page_index, ext, original_url, proxy_path, random_key,
                            created_import_id, added_at, updated_at)
        VALUES (?, ?, ?, ?, '', ?, ?, ?, ?)
        ON CONFLICT (illust_id, page_index) DO UPDATE SET
            ext = excluded.ext,
            original_url = excluded.original_url,
            updated_at = excluded.updated_at
        RETURNING id
        "#,
    )
    .bind(illust_id)
    .bind(page_index)
    .bind(ext)
    .bind(original_url)
    .bind(random_key)
    .bind(created_import_id)
    .bind(now_iso)
    .bind(now_iso)
    .fetch_one(pool)
    .await
    .context("upsert_image_by_illust_page failed")?;
    Ok(id)
}

/// Full-metadata upsert used by hydration. Same keying and random_key rules
/// as [`upsert_image_by_illust_page`]; hydrated fields always overwrite.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_image_metadata(
    pool: &SqlitePool,
    illust_id: i64,
    page_index: i64,
    ext: &str,
    original_url: &str,
    random_key: f64,
    meta: &HydratedMeta,
    created_import_id: Option<i64>,
    now_iso: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO images (illust_id, page_index, ext, original_url, proxy_path, random_key,
                            width, height, aspect_ratio, orientation, x_restrict, ai_type,
                            illust_type, user_id, user_name, title, created_at_pixiv,
                            bookmark_count, view_count, comment_count, created_import_id,
                            added_at, updated_at)
        VALUES (?, ?, ?, ?, '', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (illust_id, page_index) DO UPDATE SET
            ext = excluded.ext,
            original_url = excluded.original_url,
            width = excluded.width,
            height = excluded.height,
            aspect_ratio = excluded.aspect_ratio,
            orientation = excluded.orientation,
            x_restrict = excluded.x_restrict,
            ai_type = excluded.ai_type,
            illust_type = excluded.illust_type,
            user_id = excluded.user_id,
            user_name = excluded.user_name,
            title = excluded.title,
            created_at_pixiv = excluded.created_at_pixiv,
            bookmark_count = excluded.bookmark_count,
            view_count = excluded.view_count,
            comment_count = excluded.comment_count,
            updated_at = excluded.updated_at
        RETURNING id
        "#,
    )
    .bind(illust_id)
    .bind(page_index)
    .bind(ext)
    .bind(original_url)
    .bind(random_key)
    .bind(meta.width)
    .bind(meta.height)
    .bind(meta.aspect_ratio)
    .bind(meta.orientation)
    .bind(meta.x_restrict)
    .bind(meta.ai_type)
    .bind(meta.illust_type)
    .bind(meta.user_id)
    .bind(meta.user_name.as_deref())
    .bind(meta.title.as_deref())
    .bind(meta.created_at_pixiv.as_deref())
    .bind(meta.bookmark_count)
    .bind(meta.view_count)
    .bind(meta.comment_count)
    .bind(created_import_id)
    .bind(now_iso)
    .bind(now_iso)
    .fetch_one(pool)
    .await
    .context("upsert_image_metadata failed")?;
    Ok(id)
}

/// Hydrated per-illust metadata shared by every page row of the illust.
#[derive(Debug, Clone, Default)]
pub struct HydratedMeta {
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub aspect_ratio: Option<f64>,
    pub orientation: Option<i64>,
    pub x_restrict: Option<i64>,
    pub ai_type: Option<i64>,
    pub illust_type: Option<i64>,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub title: Option<String>,
    pub created_at_pixiv: Option<String>,
    pub bookmark_count: Option<i64>,
    pub view_count: Option<i64>,
    pub comment_count: Option<i64>,
}

pub async fn set_proxy_path(pool: &SqlitePool, image_id: i64, proxy_path: &str) -> Result<()> {
    sqlx::query("UPDATE images SET proxy_path = ? WHERE id = ?")
        .bind(proxy_path)
        .bind(image_id)
        .execute(pool)
        .await
        .context("set_proxy_path failed")?;
    Ok(())
}

pub async fn get_image_by_id(pool: &SqlitePool, image_id: i64) -> Result<Option<ImageRow>> {
    let row = sqlx::query_as::<_, ImageRow>(&format!(
        "SELECT {IMAGE_COLUMNS} FROM images WHERE id = ?"
    ))
    .bind(image_id)
    .fetch_optional(pool)
    .await
    .context("get_image_by_id failed")?;
    Ok(row)
}

pub async fn get_image_by_illust_page(
    pool: &SqlitePool,
    illust_id: i64,
    page_index: i64,
) -> Result<Option<ImageRow>> {
    let row = sqlx::query_as::<_, ImageRow>(&format!(
        "SELECT {IMAGE_COLUMNS} FROM images WHERE illust_id = ? AND page_index = ?"
    ))
    .bind(illust_id)
    .bind(page_index)
    .fetch_optional(pool)
    .await
    .context("get_image_by_illust_page failed")?;
    Ok(row)
}

/// Cursor-paginated listing (descending id). Returns the page plus the next
/// cursor when more rows remain.
pub async fn list_images(
    pool: &SqlitePool,
    filter: &ImageFilter,
    limit: i64,
    cursor: Option<i64>,
) -> Result<(Vec<ImageRow>, Option<i64>)> {
    let limit = limit.clamp(1, 200);
    if filter.is_unsatisfiable() {
        return Ok((Vec::new(), None));
    }

    let mut qb: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(format!("SELECT {IMAGE_COLUMNS} FROM images"));
    filter.push_where(&mut qb);
    if let Some(cursor) = cursor {
        qb.push(" AND id < ").push_bind(cursor);
    }
    qb.push(" ORDER BY id DESC LIMIT ").push_bind(limit + 1);

    let mut rows: Vec<ImageRow> = qb
        .build_query_as()
        .fetch_all(pool)
        .await
        .context("list_images failed")?;

    let next_cursor = if rows.len() as i64 > limit {
        rows.truncate(limit as usize);
        rows.last().map(|r| r.id)
    } else {
        None
    };
    Ok((rows, next_cursor))
}

/// Record a successful serve: clears the failure trail and stamps last_ok_at.
pub async fn mark_image_ok(pool: &SqlitePool, image_id: i64, now_iso: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE images
        SET last_ok_at = ?, last_error_code = NULL, fail_count = 0, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(now_iso)
    .bind(now_iso)
    .bind(image_id)
    .execute(pool)
    .await
    .context("mark_image_ok failed")?;
    Ok(())
}

/// Record a failed serve with its upstream code; bumps the consecutive
/// failure counter used by the pick cooldown.
pub async fn mark_image_failure(
    pool: &SqlitePool,
    image_id: i64,
    now_iso: &str,
    error_code: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE images
        SET last_fail_at = ?, last_error_code = ?, fail_count = fail_count + 1, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(now_iso)
    .bind(error_code)
    .bind(now_iso)
    .bind(image_id)
    .execute(pool)
    .await
    .context("mark_image_failure failed")?;
    Ok(())
}

/// `status → count` over all images (for /status.json).
pub async fn count_images_by_status(pool: &SqlitePool) -> Result<Vec<(i64, i64)>> {
    let rows: Vec<(i64, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM images GROUP BY status")
            .fetch_all(pool)
            .await
            .context("count_images_by_status failed")?;
    Ok(rows)
}
