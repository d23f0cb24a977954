//! Standalone job worker. Several worker processes may run side by side;
//! the atomic claim keeps their job sets disjoint.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "pxr-worker", about = "Background job worker")]
struct Args {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let _args = Args::parse();
    let settings = pxr_config::load_settings()?;

    let pool = pxr_db::connect(&settings.database_url).await?;
    pxr_db::migrate(&pool).await?;

    let job_ctx = pxr_jobs::JobContext::new(pool.clone(), settings.clone());
    let dispatcher = Arc::new(pxr_jobs::handlers::build_default_dispatcher(job_ctx));
    let config = pxr_jobs::scheduler::WorkerConfig::from_env();
    info!("worker_boot env={} worker_id={}", settings.app_env, config.worker_id);

    let scheduler = pxr_jobs::scheduler::WorkerScheduler::new(pool, dispatcher, config);
    scheduler
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    Ok(())
}
