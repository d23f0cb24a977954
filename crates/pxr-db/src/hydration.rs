//! Transactional persistence for one hydrated illust: tag upserts, per-page
//! image upserts, proxy-path stamping, and tag-set replacement, committed
//! atomically.

use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::images::HydratedMeta;

#[derive(Debug, Clone)]
pub struct PersistPage {
    pub page_index: i64,
    pub original_url: String,
    pub ext: String,
    /// Random sort key used only when this page row is first inserted.
    pub random_key: f64,
}

#[derive(Debug, Clone)]
pub struct PersistIllust {
    pub illust_id: i64,
    pub pages: Vec<PersistPage>,
    pub meta: HydratedMeta,
    /// `(name, translated_name)`, already deduped and capped by the parser.
    pub tags: Vec<(String, Option<String>)>,
    pub created_import_id: Option<i64>,
}

/// Persist one illust. Returns the image row ids, page order.
pub async fn persist_illust(
    pool: &SqlitePool,
    illust: &PersistIllust,
    now_iso: &str,
) -> Result<Vec<i64>> {
    let mut tx = pool.begin().await.context("persist_illust begin failed")?;

    // Tags by name, collecting ids; a provided translation overwrites.
    let mut tag_ids: Vec<i64> = Vec::with_capacity(illust.tags.len());
    for (name, translated) in &illust.tags {
        let (tag_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO tags (name, translated_name, added_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                translated_name = COALESCE(excluded.translated_name, tags.translated_name),
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(translated.as_deref())
        .bind(now_iso)
        .bind(now_iso)
        .fetch_one(&mut *tx)
        .await
        .context("persist_illust tag upsert failed")?;
        tag_ids.push(tag_id);
    }

    // Page rows. random_key only applies on insert; two-step proxy_path
    // because the path embeds the row id.
    let mut image_ids: Vec<i64> = Vec::with_capacity(illust.pages.len());
    for page in &illust.pages {
        let (image_id,): (i64,) = sqlx::query_as(
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
        .bind(illust.illust_id)
        .bind(page.page_index)
        .bind(&page.ext)
        .bind(&page.original_url)
        .bind(page.random_key)
        .bind(illust.meta.width)
        .bind(illust.meta.height)
        .bind(illust.meta.aspect_ratio)
        .bind(illust.meta.orientation)
        .bind(illust.meta.x_restrict)
        .bind(illust.meta.ai_type)
        .bind(illust.meta.illust_type)
        .bind(illust.meta.user_id)
        .bind(illust.meta.user_name.as_deref())
        .bind(illust.meta.title.as_deref())
        .bind(illust.meta.created_at_pixiv.as_deref())
        .bind(illust.meta.bookmark_count)
        .bind(illust.meta.view_count)
        .bind(illust.meta.comment_count)
        .bind(illust.created_import_id)
        .bind(now_iso)
        .bind(now_iso)
        .fetch_one(&mut *tx)
        .await
        .context("persist_illust image upsert failed")?;

        sqlx::query("UPDATE images SET proxy_path = ? WHERE id = ?")
            .bind(format!("/i/{image_id}.{}", page.ext))
            .bind(image_id)
            .execute(&mut *tx)
            .await
            .context("persist_illust proxy_path update failed")?;

        image_ids.push(image_id);
    }

    // Replace the tag set of every page row (delete + insert).
    if !image_ids.is_empty() {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("DELETE FROM image_tags WHERE image_id IN (");
        let mut sep = qb.separated(", ");
        for id in &image_ids {
            sep.push_bind(*id);
        }
        qb.push(")");
        qb.build()
            .execute(&mut *tx)
            .await
            .context("persist_illust tag delete failed")?;

        if !tag_ids.is_empty() {
            let mut qb: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new("INSERT OR IGNORE INTO image_tags (image_id, tag_id) ");
            qb.push_values(
                image_ids
                    .iter()
                    .flat_map(|img| tag_ids.iter().map(move |t| (*img, *t))),
                |mut row, (image_id, tag_id)| {
                    row.push_bind(image_id).push_bind(tag_id);
                },
            );
            qb.build()
                .execute(&mut *tx)
                .await
                .context("persist_illust tag insert failed")?;
        }
    }

    tx.commit().await.context("persist_illust commit failed")?;
    Ok(image_ids)
}
