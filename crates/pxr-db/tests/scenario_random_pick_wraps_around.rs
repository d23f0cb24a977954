use pxr_db::images;
use pxr_db::random::{pick_random_image, pick_random_images, ImageFilter};
use pxr_db::tags;

async fn memory_pool() -> sqlx::SqlitePool {
    let pool = pxr_db::connect("sqlite::memory:").await.unwrap();
    pxr_db::migrate(&pool).await.unwrap();
    pool
}

const NOW: &str = "2024-06-01T00:00:00.000Z";

async fn seed_image(pool: &sqlx::SqlitePool, illust_id: i64, random_key: f64) -> i64 {
    let id = images::upsert_image_by_illust_page(
        pool,
        illust_id,
        0,
        "jpg",
        &format!("https://i.pximg.net/img-original/img/2020/01/01/00/00/00/{illust_id}_p0.jpg"),
        random_key,
        None,
        NOW,
    )
    .await
    .unwrap();
    images::set_proxy_path(pool, id, &format!("/i/{id}.jpg")).await.unwrap();
    id
}

async fn tag_image(pool: &sqlx::SqlitePool, image_id: i64, names: &[&str]) {
    let mut tag_ids = Vec::new();
    for name in names {
        tag_ids.push(tags::upsert_tag(pool, name, None, NOW).await.unwrap());
    }
    tags::replace_image_tags(pool, &[image_id], &tag_ids).await.unwrap();
}

#[tokio::test]
async fn wraps_below_the_cursor_when_the_tail_runs_short() -> anyhow::Result<()> {
    let pool = memory_pool().await;
    // Keys 0.05, 0.15, ..., 0.95.
    for i in 0..10 {
        seed_image(&pool, 100 + i, 0.05 + 0.1 * i as f64).await;
    }

    let filter = ImageFilter {
        r18: 2,
        ..Default::default()
    };

    // Cursor above every key: wrap-around must still return rows, starting
    // from the smallest key.
    let picked = pick_random_image(&pool, &filter, 0.99).await?.unwrap();
    assert!((picked.random_key - 0.05).abs() < 1e-9);

    // A batch larger than the tail wraps and returns everything once.
    let batch = pick_random_images(&pool, &filter, 0.75, 10).await?;
    assert_eq!(batch.len(), 10);
    let mut ids: Vec<i64> = batch.iter().map(|i| i.illust_id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 10, "wrap-around must not duplicate rows");

    Ok(())
}

#[tokio::test]
async fn returns_some_row_whenever_one_matches() -> anyhow::Result<()> {
    let pool = memory_pool().await;
    let only = seed_image(&pool, 7, 0.42).await;

    let filter = ImageFilter {
        r18: 2,
        ..Default::default()
    };
    for r in [0.0, 0.41, 0.42, 0.43, 0.999] {
        let picked = pick_random_image(&pool, &filter, r).await?;
        assert_eq!(picked.map(|i| i.id), Some(only), "r={r}");
    }

    // Excluding the only match empties the population.
    let filter = ImageFilter {
        r18: 2,
        exclude_image_ids: vec![only],
        ..Default::default()
    };
    assert!(pick_random_image(&pool, &filter, 0.1).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn tag_groups_are_and_of_or() -> anyhow::Result<()> {
    let pool = memory_pool().await;
    let a = seed_image(&pool, 1, 0.1).await;
    let b = seed_image(&pool, 2, 0.4).await;
    let c = seed_image(&pool, 3, 0.7).await;
    tag_image(&pool, a, &["cat", "sky"]).await;
    tag_image(&pool, b, &["cat"]).await;
    tag_image(&pool, c, &["dog", "sky"]).await;

    // ("cat" OR "dog") AND "sky" → images a and c.
    let filter = ImageFilter {
        r18: 2,
        included_tag_groups: vec![
            vec!["cat".into(), "dog".into()],
            vec!["sky".into()],
        ],
        ..Default::default()
    };
    let batch = pick_random_images(&pool, &filter, 0.0, 10).await?;
    let mut ids: Vec<i64> = batch.iter().map(|i| i.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![a, c]);

    // Excluding "dog" removes c.
    let filter = ImageFilter {
        r18: 2,
        excluded_tags: vec!["dog".into()],
        ..Default::default()
    };
    let batch = pick_random_images(&pool, &filter, 0.0, 10).await?;
    let mut ids: Vec<i64> = batch.iter().map(|i| i.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![a, b]);

    Ok(())
}

#[tokio::test]
async fn r18_strict_controls_null_x_restrict() -> anyhow::Result<()> {
    let pool = memory_pool().await;
    let unknown = seed_image(&pool, 11, 0.2).await;
    let safe = seed_image(&pool, 12, 0.5).await;
    sqlx::query("UPDATE images SET x_restrict = 0 WHERE id = ?")
        .bind(safe)
        .execute(&pool)
        .await?;
    let r18 = seed_image(&pool, 13, 0.8).await;
    sqlx::query("UPDATE images SET x_restrict = 1 WHERE id = ?")
        .bind(r18)
        .execute(&pool)
        .await?;

    let strict = ImageFilter {
        r18: 0,
        r18_strict: true,
        ..Default::default()
    };
    let ids: Vec<i64> = pick_random_images(&pool, &strict, 0.0, 10)
        .await?
        .iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(ids, vec![safe]);

    let lenient = ImageFilter {
        r18: 0,
        r18_strict: false,
        ..Default::default()
    };
    let mut ids: Vec<i64> = pick_random_images(&pool, &lenient, 0.0, 10)
        .await?
        .iter()
        .map(|i| i.id)
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![unknown, safe]);

    Ok(())
}

#[tokio::test]
async fn random_key_survives_re_upsert() -> anyhow::Result<()> {
    let pool = memory_pool().await;
    let id = seed_image(&pool, 55, 0.123).await;

    // Re-import of the same (illust_id, page_index) must keep the key.
    let id2 = images::upsert_image_by_illust_page(
        &pool,
        55,
        0,
        "jpg",
        "https://i.pximg.net/img-original/img/2020/01/01/00/00/00/55_p0.jpg",
        0.999,
        None,
        NOW,
    )
    .await?;
    assert_eq!(id, id2);

    let row = images::get_image_by_id(&pool, id).await?.unwrap();
    assert!((row.random_key - 0.123).abs() < 1e-9);

    Ok(())
}
