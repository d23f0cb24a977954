//! Executes one claimed job and maps the handler outcome onto the job-store
//! state machine.

use chrono::{Duration, Utc};
use rand::Rng;
use sqlx::SqlitePool;

use pxr_config::redact_text;
use pxr_db::jobs;
use pxr_db::JobRow;
use pxr_types::iso_utc_ms;

use crate::dispatch::{HandlerError, HandlerOutcome, JobDispatcher};

/// Retry curve for recoverable failures: exponential with jitter, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_s: i64,
    pub cap_s: i64,
    pub jitter_s: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_s: 10,
            cap_s: 3600,
            jitter_s: 10,
        }
    }
}

impl RetryPolicy {
    /// Seconds to wait before the `attempt`-th retry (attempt ≥ 1).
    pub fn backoff_seconds(&self, attempt: i64, jitter_roll: f64) -> i64 {
        let attempt = attempt.max(1).min(20) as u32;
        let base = self
            .base_s
            .saturating_mul(2i64.saturating_pow(attempt - 1))
            .min(self.cap_s);
        base + (jitter_roll.clamp(0.0, 1.0) * self.jitter_s as f64) as i64
    }
}

fn truncate(text: String, max_len: usize) -> String {
    if text.len() <= max_len {
        return text;
    }
    let mut cut = max_len.saturating_sub(3);
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

fn error_text(err: &HandlerError) -> String {
    truncate(redact_text(&err.to_string()), 500)
}

/// Run the handler for a claimed job and apply the resulting transition.
///
/// Transitions (see the job state machine):
/// - `Ok(Completed)` → `completed`
/// - `Ok(LockReleased)` → nothing (the handler moved the row itself)
/// - `Err(Permanent)` → `dlq`
/// - `Err(Defer)` → `failed` with `run_after`, attempt NOT incremented
/// - `Err(Recoverable)` → attempt+1; `failed` with backoff, or `dlq` once
///   attempts are exhausted
pub async fn execute_claimed_job(
    pool: &SqlitePool,
    dispatcher: &JobDispatcher,
    job: &JobRow,
    worker_id: &str,
    policy: &RetryPolicy,
) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    let result = dispatcher.dispatch(job).await;
    let now = Utc::now();
    let now_iso = iso_utc_ms(now);

    match result {
        Ok(HandlerOutcome::Completed) => {
            jobs::complete_job(pool, job.id, worker_id, &now_iso).await?;
            tracing::info!(
                "job_completed id={} type={} elapsed_ms={}",
                job.id,
                job.job_type,
                started.elapsed().as_millis()
            );
        }
        Ok(HandlerOutcome::LockReleased) => {
            tracing::debug!("job_lock_released id={} type={}", job.id, job.job_type);
        }
        Err(err @ HandlerError::Permanent(_)) => {
            jobs::fail_job_dlq(pool, job.id, worker_id, job.attempt, &error_text(&err), &now_iso)
                .await?;
            tracing::warn!("job_dlq id={} type={} err={}", job.id, job.job_type, error_text(&err));
        }
        Err(HandlerError::Defer { msg, run_after }) => {
            let err_text = truncate(redact_text(&msg), 500);
            jobs::release_job_lock(
                pool,
                job.id,
                worker_id,
                "failed",
                Some(&run_after),
                Some(&err_text),
                &now_iso,
            )
            .await?;
            tracing::info!(
                "job_deferred id={} type={} run_after={} err={}",
                job.id,
                job.job_type,
                run_after,
                err_text
            );
        }
        Err(err @ HandlerError::Recoverable(_)) => {
            let attempt = job.attempt + 1;
            if attempt >= job.max_attempts {
                jobs::fail_job_dlq(pool, job.id, worker_id, attempt, &error_text(&err), &now_iso)
                    .await?;
                tracing::warn!(
                    "job_dlq_exhausted id={} type={} attempt={} err={}",
                    job.id,
                    job.job_type,
                    attempt,
                    error_text(&err)
                );
            } else {
                let jitter_roll = rand::thread_rng().gen_range(0.0..1.0);
                let backoff_s = policy.backoff_seconds(attempt, jitter_roll);
                let run_after = iso_utc_ms(now + Duration::seconds(backoff_s));
                jobs::fail_job_recoverable(
                    pool,
                    job.id,
                    worker_id,
                    attempt,
                    &run_after,
                    &error_text(&err),
                    &now_iso,
                )
                .await?;
                tracing::info!(
                    "job_retry_scheduled id={} type={} attempt={} run_after={}",
                    job.id,
                    job.job_type,
                    attempt,
                    run_after
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::RetryPolicy;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_seconds(1, 0.0), 10);
        assert_eq!(policy.backoff_seconds(2, 0.0), 20);
        assert_eq!(policy.backoff_seconds(3, 0.0), 40);
        assert_eq!(policy.backoff_seconds(12, 0.0), 3600);
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = RetryPolicy::default();
        let low = policy.backoff_seconds(1, 0.0);
        let high = policy.backoff_seconds(1, 1.0);
        assert!(high - low <= policy.jitter_s);
    }
}
