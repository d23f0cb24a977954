//! Storage adapter: sqlite pool setup, embedded migrations, the bounded
//! busy-retry wrapper for writer contention, and typed access modules for
//! every entity.
//!
//! Conventions:
//! - All timestamps are canonical UTC strings from `pxr_types::iso_utc_ms`,
//!   compared lexicographically in SQL.
//! - Write paths that can hit `SQLITE_BUSY` go through [`with_busy_retry`].
//! - Store functions are flat `async fn(&SqlitePool, ...)` with `anyhow`
//!   contexts; policy stays in the calling crates.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

pub mod api_keys;
pub mod bindings;
pub mod entities;
pub mod hydration;
pub mod images;
pub mod imports;
pub mod jobs;
pub mod proxies;
pub mod random;
pub mod runs;
pub mod settings;
pub mod tags;
pub mod tokens;

pub use entities::*;

pub const ENV_DB_URL: &str = "DATABASE_URL";

/// Open a pool against `database_url` (e.g. `sqlite://./data/app.db` or
/// `sqlite::memory:`). WAL keeps readers concurrent with the single writer;
/// the busy timeout is the first line of defense against writer contention,
/// [`with_busy_retry`] the second.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database url: {database_url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    // An in-memory database exists per connection; pooling more than one
    // (or letting the single one idle out) would hand out empty databases.
    let in_memory = database_url.contains(":memory:");
    let mut pool_options = SqlitePoolOptions::new();
    if in_memory {
        pool_options = pool_options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        pool_options = pool_options.max_connections(10);
    }

    let pool = pool_options
        .connect_with(options)
        .await
        .context("failed to open sqlite database")?;

    Ok(pool)
}

/// Run embedded migrations.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

fn is_busy(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(sqlx::Error::Database(db)) = cause.downcast_ref::<sqlx::Error>() {
            let msg = db.message().to_ascii_lowercase();
            if msg.contains("database is locked") || msg.contains("database table is locked") {
                return true;
            }
        }
    }
    false
}

/// Retry `op` on sqlite writer contention with exponential backoff.
///
/// Bounded at 5 attempts (1 + 4 retries), sleeping 25/50/100/200 ms between
/// tries. Non-busy errors propagate immediately.
pub async fn with_busy_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(25);
    let mut last: Option<anyhow::Error> = None;
    for attempt in 0..5 {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) => {
                tracing::debug!("sqlite_busy_retry attempt={}", attempt + 1);
                last = Some(err);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| anyhow::anyhow!("sqlite busy retry exhausted")))
}

/// Connectivity + schema presence, used by /healthz and startup logging.
#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_images_table: bool,
}

pub async fn status(pool: &SqlitePool) -> Result<DbStatus> {
    let (one,): (i64,) = sqlx::query_as("SELECT 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='images'",
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_images_table: exists > 0,
    })
}
