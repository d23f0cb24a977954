//! pxr-daemon entry point.
//!
//! This file is intentionally thin: it resolves settings, opens the store,
//! optionally starts the embedded worker, wires middleware, and serves the
//! router. All handlers live under `routes/`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use pxr_daemon::state::AppContext;

#[derive(Debug, Parser)]
#[command(name = "pxr-daemon", about = "Random image API daemon")]
struct Args {
    /// Listen address, e.g. 127.0.0.1:8080. Overrides PXR_DAEMON_ADDR.
    #[arg(long)]
    addr: Option<SocketAddr>,
    /// Run the embedded job worker in-process (or set WORKER_EMBEDDED=1).
    #[arg(long)]
    worker: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let args = Args::parse();
    let settings = pxr_config::load_settings()?;

    let pool = pxr_db::connect(&settings.database_url).await?;
    pxr_db::migrate(&pool).await?;

    let embedded_worker = args.worker
        || std::env::var("WORKER_EMBEDDED")
            .map(|raw| matches!(raw.trim(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
    if embedded_worker {
        let job_ctx = pxr_jobs::JobContext::new(pool.clone(), settings.clone());
        let dispatcher = Arc::new(pxr_jobs::handlers::build_default_dispatcher(job_ctx));
        let scheduler = pxr_jobs::scheduler::WorkerScheduler::new(
            pool.clone(),
            dispatcher,
            pxr_jobs::scheduler::WorkerConfig::from_env(),
        );
        tokio::spawn(scheduler.run(shutdown_signal()));
        info!("embedded_worker_started");
    }

    let ctx = Arc::new(AppContext::new(pool, settings));
    let app = pxr_daemon::build_router(ctx)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive());

    let addr = args
        .addr
        .or_else(addr_from_env)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));
    info!("pxr-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn addr_from_env() -> Option<SocketAddr> {
    std::env::var("PXR_DAEMON_ADDR").ok()?.parse().ok()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
