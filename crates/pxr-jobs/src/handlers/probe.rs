//! Bulk proxy health probe: hit a cheap URL through every enabled endpoint
//! in parallel and feed the results to the circuit-breaker columns.
//!
//! Unlike the hydrate path, a probe failure blacklists only after
//! `BLACKLIST_AFTER_FAILURES` consecutive failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Semaphore;

use pxr_config::redact_text;
use pxr_db::JobRow;
use pxr_types::iso_utc_ms;

use crate::dispatch::{HandlerError, HandlerOutcome, JobHandler};
use crate::JobContext;

pub const DEFAULT_PROBE_URL: &str = "https://www.pixiv.net/robots.txt";
pub const DEFAULT_TIMEOUT_MS: i64 = 8000;
pub const DEFAULT_CONCURRENCY: i64 = 10;

pub const BLACKLIST_AFTER_FAILURES: i64 = 3;
pub const BLACKLIST_TTL_S: i64 = 30 * 60;

#[derive(Debug, Deserialize)]
struct ProbePayload {
    #[serde(default)]
    probe_url: Option<String>,
    #[serde(default)]
    timeout_ms: Option<i64>,
    #[serde(default)]
    concurrency: Option<i64>,
}

#[derive(Debug)]
struct ProbeResult {
    endpoint_id: i64,
    ok: bool,
    latency_ms: Option<f64>,
    error: Option<String>,
}

async fn probe_one(endpoint_id: i64, proxy_uri: String, url: String, timeout: Duration) -> ProbeResult {
    let start = std::time::Instant::now();

    let outcome: Result<u16, String> = async {
        let proxy = reqwest::Proxy::all(&proxy_uri).map_err(|err| format!("invalid proxy: {err}"))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            .build()
            .map_err(|err| format!("client build: {err}"))?;
        let response = client.get(&url).send().await.map_err(|err| err.to_string())?;
        Ok(response.status().as_u16())
    }
    .await;

    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    match outcome {
        Ok(status) if status < 400 => ProbeResult {
            endpoint_id,
            ok: true,
            latency_ms: Some(latency_ms),
            error: None,
        },
        Ok(status) => ProbeResult {
            endpoint_id,
            ok: false,
            latency_ms: Some(latency_ms),
            error: Some(format!("status={status}")),
        },
        Err(err) => ProbeResult {
            endpoint_id,
            ok: false,
            latency_ms: Some(latency_ms),
            error: Some(err),
        },
    }
}

pub struct ProxyProbeHandler {
    ctx: Arc<JobContext>,
    probe_url_override: Option<String>,
}

impl ProxyProbeHandler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self {
            ctx,
            probe_url_override: None,
        }
    }

    /// Point every probe at a fixed URL regardless of payload (tests).
    pub fn with_probe_url(ctx: Arc<JobContext>, url: &str) -> Self {
        Self {
            ctx,
            probe_url_override: Some(url.to_string()),
        }
    }
}

#[async_trait]
impl JobHandler for ProxyProbeHandler {
    async fn run(&self, job: &JobRow) -> Result<HandlerOutcome, HandlerError> {
        let payload: ProbePayload = serde_json::from_str(&job.payload_json)
            .map_err(|_| HandlerError::permanent("payload_json is not a valid probe payload"))?;

        let probe_url = self
            .probe_url_override
            .clone()
            .or(payload.probe_url.filter(|u| !u.trim().is_empty()))
            .unwrap_or_else(|| DEFAULT_PROBE_URL.to_string());

        let timeout_ms = payload.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        if timeout_ms <= 0 || timeout_ms > 600_000 {
            return Err(HandlerError::permanent("payload.timeout_ms invalid"));
        }
        let concurrency = payload
            .concurrency
            .unwrap_or(DEFAULT_CONCURRENCY)
            .clamp(1, 200) as usize;
        let timeout = Duration::from_millis(timeout_ms as u64);

        let endpoints = pxr_db::proxies::list_enabled_endpoints(&self.ctx.pool)
            .await
            .map_err(HandlerError::from)?;
        if endpoints.is_empty() {
            return Ok(HandlerOutcome::Completed);
        }

        // Build URIs first; endpoints with broken credentials fail without a
        // network round trip.
        let mut immediate: Vec<ProbeResult> = Vec::new();
        let mut targets: Vec<(i64, String)> = Vec::new();
        for endpoint in &endpoints {
            let candidate = pxr_db::proxies::CandidateEndpoint {
                id: endpoint.id,
                scheme: endpoint.scheme.clone(),
                host: endpoint.host.clone(),
                port: endpoint.port,
                username: endpoint.username.clone(),
                password_enc: endpoint.password_enc.clone(),
                weight: 1,
                last_ok_at: None,
                last_fail_at: None,
            };
            match pxr_proxy::routing::build_proxy_uri(self.ctx.encryptor.as_ref(), &candidate) {
                Ok(uri) => targets.push((endpoint.id, uri)),
                Err(err) => immediate.push(ProbeResult {
                    endpoint_id: endpoint.id,
                    ok: false,
                    latency_ms: None,
                    error: Some(err.message),
                }),
            }
        }

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks = tokio::task::JoinSet::new();
        for (endpoint_id, uri) in targets {
            let semaphore = semaphore.clone();
            let url = probe_url.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                probe_one(endpoint_id, uri, url, timeout).await
            });
        }

        let mut results = immediate;
        while let Some(joined) = tasks.join_next().await {
            if let Ok(result) = joined {
                results.push(result);
            }
        }

        let now = Utc::now();
        let now_iso = iso_utc_ms(now);
        let blacklist_until = iso_utc_ms(now + chrono::Duration::seconds(BLACKLIST_TTL_S));

        for result in &results {
            let outcome = if result.ok {
                pxr_db::proxies::mark_endpoint_ok(
                    &self.ctx.pool,
                    result.endpoint_id,
                    result.latency_ms,
                    &now_iso,
                )
                .await
            } else {
                let msg = redact_text(result.error.as_deref().unwrap_or("probe_failed"));
                pxr_db::proxies::mark_endpoint_fail_threshold(
                    &self.ctx.pool,
                    result.endpoint_id,
                    result.latency_ms,
                    &blacklist_until,
                    BLACKLIST_AFTER_FAILURES,
                    &msg,
                    &now_iso,
                )
                .await
            };
            if let Err(err) = outcome {
                tracing::warn!(
                    "probe_result_persist_failed endpoint={} err={err:#}",
                    result.endpoint_id
                );
            }
        }

        tracing::info!(
            "proxy_probe_done total={} ok={}",
            results.len(),
            results.iter().filter(|r| r.ok).count()
        );
        Ok(HandlerOutcome::Completed)
    }
}
