//! Built-in job handlers.

pub mod hydrate;
pub mod import_images;
pub mod probe;

use std::sync::Arc;

use crate::dispatch::JobDispatcher;
use crate::JobContext;

pub const JOB_TYPE_HYDRATE_METADATA: &str = "hydrate_metadata";
pub const JOB_TYPE_IMPORT_IMAGES: &str = "import_images";
pub const JOB_TYPE_PROXY_PROBE: &str = "proxy_probe";

/// Enqueue a low-priority hydration for an illust served with missing
/// metadata. Idempotent: a no-op while a pending/running job with the same
/// `(type, ref_type, ref_id)` exists.
pub async fn enqueue_opportunistic_hydrate(
    pool: &sqlx::SqlitePool,
    illust_id: i64,
    reason: &str,
) -> anyhow::Result<Option<i64>> {
    let payload = serde_json::to_string(&serde_json::json!({
        "illust_id": illust_id,
        "reason": reason,
    }))?;
    let ref_id = illust_id.to_string();
    pxr_db::jobs::enqueue_job_unique_ref(
        pool,
        &pxr_db::jobs::NewJob {
            job_type: JOB_TYPE_HYDRATE_METADATA,
            payload_json: &payload,
            priority: pxr_db::jobs::OPPORTUNISTIC_PRIORITY,
            ref_type: Some("opportunistic_hydrate"),
            ref_id: Some(&ref_id),
            ..Default::default()
        },
        &pxr_types::now_iso(),
    )
    .await
}

/// Wire the default handler set.
pub fn build_default_dispatcher(ctx: Arc<JobContext>) -> JobDispatcher {
    let mut dispatcher = JobDispatcher::new();
    dispatcher.register(
        JOB_TYPE_HYDRATE_METADATA,
        Arc::new(hydrate::HydrateMetadataHandler::new(ctx.clone())),
    );
    dispatcher.register(
        JOB_TYPE_IMPORT_IMAGES,
        Arc::new(import_images::ImportImagesHandler::new(ctx.clone())),
    );
    dispatcher.register(
        JOB_TYPE_PROXY_PROBE,
        Arc::new(probe::ProxyProbeHandler::new(ctx)),
    );
    dispatcher
}
