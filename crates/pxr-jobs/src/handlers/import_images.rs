//! URL-list import: parse lines, dedupe, upsert image rows in chunks, record
//! line errors, and optionally enqueue per-illust hydration.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use pxr_db::jobs::NewJob;
use pxr_db::JobRow;
use pxr_pixiv::urls::{parse_pixiv_original_url, ParsedPixivUrl};
use pxr_types::{iso_utc_ms, now_iso};

use crate::dispatch::{HandlerError, HandlerOutcome, JobHandler};
use crate::handlers::JOB_TYPE_HYDRATE_METADATA;
use crate::JobContext;

const MAX_ERRORS: usize = 200;
const CHUNK_SIZE: usize = 200;

#[derive(Debug, Deserialize)]
struct ImportPayload {
    import_id: Option<i64>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    text_lines: Option<Vec<String>>,
    #[serde(default)]
    hydrate_on_import: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ImportLineError {
    line: usize,
    url: String,
    code: &'static str,
    message: String,
}

pub struct ImportImagesHandler {
    ctx: Arc<JobContext>,
}

impl ImportImagesHandler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    async fn flush_chunk(
        &self,
        chunk: &[(String, ParsedPixivUrl)],
        import_id: i64,
    ) -> Result<(), HandlerError> {
        for (url, parsed) in chunk {
            let now = now_iso();
            let random_key = rand::thread_rng().gen_range(0.0..1.0);
            let image_id = pxr_db::images::upsert_image_by_illust_page(
                &self.ctx.pool,
                parsed.illust_id,
                parsed.page_index,
                &parsed.ext,
                url,
                random_key,
                Some(import_id),
                &now,
            )
            .await
            .map_err(HandlerError::from)?;
            pxr_db::images::set_proxy_path(
                &self.ctx.pool,
                image_id,
                &format!("/i/{image_id}.{}", parsed.ext),
            )
            .await
            .map_err(HandlerError::from)?;
        }
        Ok(())
    }

    async fn enqueue_hydrations(
        &self,
        import_id: i64,
        illust_ids: &BTreeSet<i64>,
    ) -> Result<i64, HandlerError> {
        let existing = pxr_db::jobs::list_ref_ids_with_prefix(
            &self.ctx.pool,
            JOB_TYPE_HYDRATE_METADATA,
            "import",
            &format!("{import_id}:"),
        )
        .await
        .map_err(HandlerError::from)?;
        let existing: std::collections::HashSet<String> = existing.into_iter().collect();

        let mut added = 0;
        for illust_id in illust_ids {
            let ref_id = format!("{import_id}:{illust_id}");
            if existing.contains(&ref_id) {
                continue;
            }
            let payload = serde_json::to_string(&json!({
                "illust_id": illust_id,
                "reason": "import",
            }))
            .unwrap_or_else(|_| "{}".to_string());
            pxr_db::jobs::enqueue_job(
                &self.ctx.pool,
                &NewJob {
                    job_type: JOB_TYPE_HYDRATE_METADATA,
                    payload_json: &payload,
                    ref_type: Some("import"),
                    ref_id: Some(&ref_id),
                    ..Default::default()
                },
                &now_iso(),
            )
            .await
            .map_err(HandlerError::from)?;
            added += 1;
        }
        Ok(added)
    }
}

#[async_trait]
impl JobHandler for ImportImagesHandler {
    async fn run(&self, job: &JobRow) -> Result<HandlerOutcome, HandlerError> {
        let payload: ImportPayload = serde_json::from_str(&job.payload_json)
            .map_err(|_| HandlerError::permanent("payload_json is not a valid import payload"))?;

        let import_id = payload
            .import_id
            .filter(|id| *id > 0)
            .ok_or_else(|| HandlerError::permanent("payload.import_id is required"))?;

        pxr_db::imports::get_import(&self.ctx.pool, import_id)
            .await
            .map_err(HandlerError::from)?
            .ok_or_else(|| HandlerError::permanent("Import not found"))?;

        let lines: Vec<String> = match (&payload.text_lines, &payload.text) {
            (Some(lines), _) => lines.clone(),
            (None, Some(text)) => text.lines().map(str::to_string).collect(),
            (None, None) => {
                return Err(HandlerError::permanent(
                    "payload.text_lines or payload.text is required",
                ))
            }
        };
        let hydrate_on_import = payload.hydrate_on_import.unwrap_or(false);

        let mut total: i64 = 0;
        let mut accepted: i64 = 0;
        let mut success: i64 = 0;
        let mut deduped: i64 = 0;
        let mut error_total: i64 = 0;
        let mut errors: Vec<ImportLineError> = Vec::new();
        let mut seen: std::collections::HashSet<(i64, i64)> = std::collections::HashSet::new();
        let mut illust_ids: BTreeSet<i64> = BTreeSet::new();
        let mut chunk: Vec<(String, ParsedPixivUrl)> = Vec::new();

        for (line_no, raw) in lines.iter().enumerate() {
            let url = raw.trim();
            if url.is_empty() {
                continue;
            }
            total += 1;

            let parsed = match parse_pixiv_original_url(url) {
                Ok(parsed) => parsed,
                Err(err) => {
                    error_total += 1;
                    if errors.len() < MAX_ERRORS {
                        errors.push(ImportLineError {
                            line: line_no + 1,
                            url: url.to_string(),
                            code: "unsupported_url",
                            message: err.to_string(),
                        });
                    }
                    continue;
                }
            };

            if !seen.insert((parsed.illust_id, parsed.page_index)) {
                deduped += 1;
                continue;
            }
            // Rows already present (e.g. a re-run of the same list) are
            // deduped, not rewritten; their random_key and metadata stand.
            if pxr_db::images::get_image_by_illust_page(
                &self.ctx.pool,
                parsed.illust_id,
                parsed.page_index,
            )
            .await
            .map_err(HandlerError::from)?
            .is_some()
            {
                deduped += 1;
                continue;
            }
            accepted += 1;
            if hydrate_on_import {
                illust_ids.insert(parsed.illust_id);
            }
            chunk.push((url.to_string(), parsed));

            if chunk.len() >= CHUNK_SIZE {
                self.flush_chunk(&chunk, import_id).await?;
                success += chunk.len() as i64;
                pxr_db::imports::update_import_counters(
                    &self.ctx.pool,
                    import_id,
                    total,
                    accepted,
                    success,
                    error_total,
                )
                .await
                .map_err(HandlerError::from)?;
                chunk.clear();
            }
        }

        if !chunk.is_empty() {
            self.flush_chunk(&chunk, import_id).await?;
            success += chunk.len() as i64;
        }

        pxr_db::imports::update_import_counters(
            &self.ctx.pool,
            import_id,
            total,
            accepted,
            success,
            error_total,
        )
        .await
        .map_err(HandlerError::from)?;

        let detail = serde_json::to_string(&json!({
            "deduped": deduped,
            "errors": errors,
        }))
        .unwrap_or_else(|_| "{}".to_string());
        pxr_db::imports::set_import_detail(&self.ctx.pool, import_id, &detail)
            .await
            .map_err(HandlerError::from)?;

        if hydrate_on_import && !illust_ids.is_empty() {
            let added = self.enqueue_hydrations(import_id, &illust_ids).await?;
            tracing::info!(
                "import_hydrations_enqueued import_id={import_id} added={added} at={}",
                iso_utc_ms(chrono::Utc::now())
            );
        }

        Ok(HandlerOutcome::Completed)
    }
}
