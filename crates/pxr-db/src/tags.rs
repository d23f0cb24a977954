//! Tag store: name-keyed upserts, per-image tag sets, and the public
//! tag/author lookups.

use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::entities::TagRow;

/// Upsert one tag by name, returning its id. A provided `translated_name`
/// overwrites; an absent one leaves the stored value in place.
pub async fn upsert_tag(
    pool: &SqlitePool,
    name: &str,
    translated_name: Option<&str>,
    now_iso: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
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
    .bind(translated_name)
    .bind(now_iso)
    .bind(now_iso)
    .fetch_one(pool)
    .await
    .context("upsert_tag failed")?;
    Ok(id)
}

/// Replace the tag set of each image with `tag_ids` (delete + insert; set
/// semantics per image).
pub async fn replace_image_tags(
    pool: &SqlitePool,
    image_ids: &[i64],
    tag_ids: &[i64],
) -> Result<()> {
    if image_ids.is_empty() {
        return Ok(());
    }

    let mut qb: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new("DELETE FROM image_tags WHERE image_id IN (");
    let mut sep = qb.separated(", ");
    for id in image_ids {
        sep.push_bind(*id);
    }
    qb.push(")");
    qb.build()
        .execute(pool)
        .await
        .context("replace_image_tags delete failed")?;

    if tag_ids.is_empty() {
        return Ok(());
    }

    let mut qb: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new("INSERT OR IGNORE INTO image_tags (image_id, tag_id) ");
    qb.push_values(
        image_ids.iter().flat_map(|img| tag_ids.iter().map(move |t| (*img, *t))),
        |mut row, (image_id, tag_id)| {
            row.push_bind(image_id).push_bind(tag_id);
        },
    );
    qb.build()
        .execute(pool)
        .await
        .context("replace_image_tags insert failed")?;
    Ok(())
}

pub async fn get_tag_names_for_image(pool: &SqlitePool, image_id: i64) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT t.name FROM image_tags it
        JOIN tags t ON t.id = it.tag_id
        WHERE it.image_id = ?
        ORDER BY t.name ASC
        "#,
    )
    .bind(image_id)
    .fetch_all(pool)
    .await
    .context("get_tag_names_for_image failed")?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

pub async fn image_has_tags(pool: &SqlitePool, image_id: i64) -> Result<bool> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT image_id FROM image_tags WHERE image_id = ? LIMIT 1")
            .bind(image_id)
            .fetch_optional(pool)
            .await
            .context("image_has_tags failed")?;
    Ok(row.is_some())
}

/// Cursor-paginated tag list, ascending id, optional substring match on name
/// or translated name.
pub async fn list_tags(
    pool: &SqlitePool,
    q: Option<&str>,
    limit: i64,
    cursor: Option<i64>,
) -> Result<(Vec<TagRow>, Option<i64>)> {
    let limit = limit.clamp(1, 200);
    let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
        "SELECT id, name, translated_name, added_at, updated_at FROM tags WHERE 1=1",
    );
    if let Some(cursor) = cursor {
        qb.push(" AND id > ").push_bind(cursor);
    }
    if let Some(q) = q.map(str::trim).filter(|s| !s.is_empty()) {
        let needle = format!("%{q}%");
        qb.push(" AND (name LIKE ")
            .push_bind(needle.clone())
            .push(" OR translated_name LIKE ")
            .push_bind(needle)
            .push(")");
    }
    qb.push(" ORDER BY id ASC LIMIT ").push_bind(limit + 1);

    let mut rows: Vec<TagRow> = qb
        .build_query_as()
        .fetch_all(pool)
        .await
        .context("list_tags failed")?;
    let next_cursor = if rows.len() as i64 > limit {
        rows.truncate(limit as usize);
        rows.last().map(|r| r.id)
    } else {
        None
    };
    Ok((rows, next_cursor))
}

/// One author row for the public lookup: distinct user over enabled images.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuthorRow {
    pub user_id: i64,
    pub user_name: Option<String>,
    pub image_count: i64,
}

/// Cursor-paginated author list over enabled images, ascending user_id.
pub async fn list_authors(
    pool: &SqlitePool,
    q: Option<&str>,
    limit: i64,
    cursor: Option<i64>,
) -> Result<(Vec<AuthorRow>, Option<i64>)> {
    let limit = limit.clamp(1, 200);
    let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
        "SELECT user_id, MAX(user_name) AS user_name, COUNT(*) AS image_count \
         FROM images WHERE status = 1 AND user_id IS NOT NULL",
    );
    if let Some(cursor) = cursor {
        qb.push(" AND user_id > ").push_bind(cursor);
    }
    if let Some(q) = q.map(str::trim).filter(|s| !s.is_empty()) {
        qb.push(" AND user_name LIKE ").push_bind(format!("%{q}%"));
    }
    qb.push(" GROUP BY user_id ORDER BY user_id ASC LIMIT ")
        .push_bind(limit + 1);

    let raw: Vec<(i64, Option<String>, i64)> = qb
        .build_query_as()
        .fetch_all(pool)
        .await
        .context("list_authors failed")?;

    let mut rows: Vec<AuthorRow> = raw
        .into_iter()
        .map(|(user_id, user_name, image_count)| AuthorRow {
            user_id,
            user_name,
            image_count,
        })
        .collect();
    let next_cursor = if rows.len() as i64 > limit {
        rows.truncate(limit as usize);
        rows.last().map(|r| r.user_id)
    } else {
        None
    };
    Ok((rows, next_cursor))
}
