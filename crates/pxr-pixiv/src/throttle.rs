//! Per-token minimum-interval throttle for outbound App API calls.
//!
//! One lock per token id, lazily created; a coarse lock guards the map only
//! during first insert. Calls with no token id serialize on a single global
//! slot instead.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

#[derive(Default)]
pub struct PixivThrottle {
    global: Mutex<Option<Instant>>,
    per_token: Mutex<HashMap<i64, Arc<Mutex<Option<Instant>>>>>,
}

impl PixivThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot_for(&self, token_id: i64) -> Arc<Mutex<Option<Instant>>> {
        let mut map = self.per_token.lock().await;
        map.entry(token_id).or_default().clone()
    }

    /// Sleep until at least `min_interval_ms + uniform[0, jitter_ms)` has
    /// passed since the previous call on the same token (or the global slot),
    /// then record this call's issue time.
    pub async fn wait(&self, token_id: Option<i64>, min_interval_ms: u64, jitter_ms: u64) {
        if min_interval_ms == 0 && jitter_ms == 0 {
            return;
        }
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0.0..1.0) * jitter_ms as f64
        } else {
            0.0
        };
        let interval = Duration::from_millis(min_interval_ms) + Duration::from_secs_f64(jitter / 1000.0);

        match token_id.filter(|id| *id > 0) {
            Some(token_id) => {
                let slot = self.slot_for(token_id).await;
                let mut last = slot.lock().await;
                Self::pace(&mut last, interval).await;
            }
            None => {
                let mut last = self.global.lock().await;
                Self::pace(&mut last, interval).await;
            }
        }
    }

    async fn pace(last: &mut Option<Instant>, interval: Duration) {
        let now = Instant::now();
        if let Some(previous) = *last {
            let due = previous + interval;
            if due > now {
                sleep(due - now).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_call_on_same_token_waits_the_interval() {
        let throttle = PixivThrottle::new();
        throttle.wait(Some(1), 800, 0).await;

        let start = Instant::now();
        throttle.wait(Some(1), 800, 0).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(800), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn different_tokens_do_not_serialize() {
        let throttle = PixivThrottle::new();
        throttle.wait(Some(1), 800, 0).await;

        let start = Instant::now();
        throttle.wait(Some(2), 800, 0).await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test]
    async fn zero_interval_is_free() {
        let throttle = PixivThrottle::new();
        let start = std::time::Instant::now();
        for _ in 0..100 {
            throttle.wait(Some(1), 0, 0).await;
        }
        assert!(start.elapsed() < std::time::Duration::from_millis(100));
    }
}
