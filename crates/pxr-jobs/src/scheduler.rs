//! Worker scheduler: the tick loop that sweeps leases, adapts concurrency to
//! the credential supply, publishes heartbeats, claims jobs, and supervises
//! their tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::task::JoinSet;

use pxr_db::jobs;
use pxr_types::{default_worker_id, iso_utc_ms};

use crate::dispatch::JobDispatcher;
use crate::executor::{execute_claimed_job, RetryPolicy};

fn env_i64(name: &str, default: i64, min: i64, max: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => true,
            "0" | "false" | "no" | "n" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Env-derived scheduler configuration (see the ops interface for names).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub lock_ttl_s: i64,
    pub max_claims_per_tick: i64,
    pub max_concurrency: i64,
    pub auto_concurrency: bool,
    pub auto_refresh_s: i64,
    pub heartbeat_interval_s: i64,
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let worker_id = std::env::var("WORKER_ID")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(default_worker_id);
        Self {
            worker_id,
            lock_ttl_s: env_i64("WORKER_JOBS_LOCK_TTL_SECONDS", jobs::DEFAULT_LOCK_TTL_S, 5, 3600),
            max_claims_per_tick: env_i64("WORKER_MAX_JOBS_PER_TICK", 10, 1, 1000),
            max_concurrency: env_i64("WORKER_MAX_CONCURRENCY", 20, 1, 200),
            auto_concurrency: env_bool("WORKER_AUTO_CONCURRENCY", true),
            auto_refresh_s: env_i64("WORKER_AUTO_CONCURRENCY_REFRESH_SECONDS", 15, 1, 3600),
            heartbeat_interval_s: env_i64("WORKER_HEARTBEAT_INTERVAL_SECONDS", 10, 1, 300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// `clamp(1, max, enabled_tokens)` when auto mode is on: hydration
/// concurrency never exceeds the credential supply.
pub fn compute_desired_concurrency(
    auto_enabled: bool,
    enabled_tokens: Option<i64>,
    max_concurrency: i64,
) -> i64 {
    let max = max_concurrency.max(1);
    if !auto_enabled {
        return max;
    }
    enabled_tokens.unwrap_or(0).max(1).min(max)
}

/// The embedded worker loop. Runs until `shutdown` resolves, then stops
/// claiming, aborts in-flight tasks, and drains them.
pub struct WorkerScheduler {
    pool: SqlitePool,
    dispatcher: Arc<JobDispatcher>,
    config: WorkerConfig,
    retry_policy: RetryPolicy,
}

impl WorkerScheduler {
    pub fn new(pool: SqlitePool, dispatcher: Arc<JobDispatcher>, config: WorkerConfig) -> Self {
        Self {
            pool,
            dispatcher,
            config,
            retry_policy: RetryPolicy::default(),
        }
    }

    async fn heartbeat(&self, enabled_tokens: Option<i64>, desired: i64) {
        let now = iso_utc_ms(Utc::now());
        let worker_id = &self.config.worker_id;
        let result = pxr_db::settings::set_runtime_setting(
            &self.pool,
            "worker.last_seen_at",
            &json!({"at": now, "worker_id": worker_id, "pid": std::process::id()}),
            Some("worker heartbeat"),
            Some(&format!("worker:{worker_id}")),
            &now,
        )
        .await;
        let result2 = pxr_db::settings::set_runtime_setting(
            &self.pool,
            "worker.concurrency",
            &json!({
                "at": now,
                "worker_id": worker_id,
                "auto": self.config.auto_concurrency,
                "enabled_tokens": enabled_tokens.unwrap_or(0),
                "desired": desired,
                "max": self.config.max_concurrency,
            }),
            Some("worker concurrency"),
            Some(&format!("worker:{worker_id}")),
            &now,
        )
        .await;
        if result.is_err() || result2.is_err() {
            tracing::warn!("worker_heartbeat_update_failed");
        }
    }

    /// Claim up to `min(slots, max_claims)` jobs and spawn them. Returns the
    /// number claimed.
    async fn claim_into(&self, tasks: &mut JoinSet<()>, desired: i64) -> i64 {
        let slots = (desired - tasks.len() as i64).max(0);
        if slots == 0 {
            return 0;
        }

        let mut claimed = 0;
        for _ in 0..slots.min(self.config.max_claims_per_tick.max(1)) {
            let now_iso = iso_utc_ms(Utc::now());
            let job = match jobs::claim_next_job(&self.pool, &self.config.worker_id, &now_iso).await
            {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("jobs_claim_failed err={err:#}");
                    break;
                }
            };

            let pool = self.pool.clone();
            let dispatcher = self.dispatcher.clone();
            let worker_id = self.config.worker_id.clone();
            let policy = self.retry_policy.clone();
            tasks.spawn(async move {
                if let Err(err) =
                    execute_claimed_job(&pool, &dispatcher, &job, &worker_id, &policy).await
                {
                    tracing::warn!("job_execute_failed id={} err={err:#}", job.id);
                }
            });
            claimed += 1;
        }
        claimed
    }

    /// Run the loop. `shutdown` is any future that resolves when the process
    /// should stop (e.g. a ctrl-c listener).
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut last_auto_refresh = tokio::time::Instant::now() - Duration::from_secs(3600);
        let mut last_heartbeat = tokio::time::Instant::now() - Duration::from_secs(3600);
        let mut cached_enabled_tokens: Option<i64> = None;

        tracing::info!("worker_start worker_id={}", self.config.worker_id);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            // Reap finished tasks without blocking.
            while tasks.try_join_next().is_some() {}

            let now_m = tokio::time::Instant::now();
            if self.config.auto_concurrency
                && now_m.duration_since(last_auto_refresh).as_secs() as i64
                    >= self.config.auto_refresh_s
            {
                last_auto_refresh = now_m;
                cached_enabled_tokens = pxr_db::tokens::count_enabled_tokens(&self.pool).await.ok();
            }
            let desired = compute_desired_concurrency(
                self.config.auto_concurrency,
                cached_enabled_tokens,
                self.config.max_concurrency,
            );

            if now_m.duration_since(last_heartbeat).as_secs() as i64
                >= self.config.heartbeat_interval_s
            {
                last_heartbeat = now_m;
                self.heartbeat(cached_enabled_tokens, desired).await;
            }

            // Lease maintenance ahead of claiming.
            let now = Utc::now();
            let cutoff = iso_utc_ms(now - chrono::Duration::seconds(self.config.lock_ttl_s));
            let now_iso = iso_utc_ms(now);
            if let Err(err) = jobs::sweep_stale_leases(&self.pool, &cutoff, &now_iso).await {
                tracing::warn!("jobs_lease_sweep_failed err={err:#}");
            }
            if let Err(err) = jobs::promote_due_failed(&self.pool, &now_iso).await {
                tracing::warn!("jobs_promote_failed err={err:#}");
            }

            self.claim_into(&mut tasks, desired).await;
        }

        tracing::info!("worker_stop worker_id={}", self.config.worker_id);
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::compute_desired_concurrency;

    #[test]
    fn concurrency_tracks_token_supply() {
        assert_eq!(compute_desired_concurrency(true, Some(3), 20), 3);
        assert_eq!(compute_desired_concurrency(true, Some(50), 20), 20);
        assert_eq!(compute_desired_concurrency(true, Some(0), 20), 1);
        assert_eq!(compute_desired_concurrency(true, None, 20), 1);
        assert_eq!(compute_desired_concurrency(false, Some(3), 20), 20);
        assert_eq!(compute_desired_concurrency(false, None, 0), 1);
    }
}
