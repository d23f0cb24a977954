//! Per-token access-token cache with singleflight refresh.
//!
//! Concurrent misses on the same token id coalesce: one caller runs the
//! refresher while the rest wait on the per-token gate and then read the
//! freshly cached value. Entries expire `EARLY_EXPIRY_MARGIN` before the
//! upstream lifetime so a token is never used right at its deadline.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::oauth::RefreshedToken;

pub const EARLY_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Entry {
    access_token: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct AccessTokenCache {
    entries: Mutex<HashMap<i64, Entry>>,
    gates: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl AccessTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn gate_for(&self, token_id: i64) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().await;
        gates.entry(token_id).or_default().clone()
    }

    async fn cached(&self, token_id: i64) -> Option<String> {
        let entries = self.entries.lock().await;
        entries.get(&token_id).and_then(|entry| {
            if Instant::now() < entry.expires_at {
                Some(entry.access_token.clone())
            } else {
                None
            }
        })
    }

    /// Return the cached access token, or run `refresher` exactly once across
    /// concurrent callers and cache its result.
    pub async fn get_or_refresh<F, Fut, E>(&self, token_id: i64, refresher: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RefreshedToken, E>>,
    {
        if let Some(token) = self.cached(token_id).await {
            return Ok(token);
        }

        let gate = self.gate_for(token_id).await;
        let _held = gate.lock().await;

        // A concurrent refresh may have landed while we waited on the gate.
        if let Some(token) = self.cached(token_id).await {
            return Ok(token);
        }

        let refreshed = refresher().await?;
        let ttl = Duration::from_secs(refreshed.expires_in.max(0) as u64);
        let expires_at = Instant::now() + ttl.saturating_sub(EARLY_EXPIRY_MARGIN);

        let mut entries = self.entries.lock().await;
        entries.insert(
            token_id,
            Entry {
                access_token: refreshed.access_token.clone(),
                expires_at,
            },
        );
        Ok(refreshed.access_token)
    }

    pub async fn invalidate(&self, token_id: i64) {
        let mut entries = self.entries.lock().await;
        entries.remove(&token_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn refreshed(token: &str, expires_in: i64) -> RefreshedToken {
        RefreshedToken {
            access_token: token.to_string(),
            refresh_token: None,
            expires_in,
        }
    }

    #[tokio::test]
    async fn concurrent_misses_refresh_once() {
        let cache = Arc::new(AccessTokenCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_refresh(1, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, std::convert::Infallible>(refreshed("at1", 3600))
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "at1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "waiters must coalesce");
    }

    #[tokio::test]
    async fn invalidate_forces_a_new_refresh() {
        let cache = AccessTokenCache::new();
        let token = cache
            .get_or_refresh(1, || async {
                Ok::<_, std::convert::Infallible>(refreshed("first", 3600))
            })
            .await
            .unwrap();
        assert_eq!(token, "first");

        cache.invalidate(1).await;
        let token = cache
            .get_or_refresh(1, || async {
                Ok::<_, std::convert::Infallible>(refreshed("second", 3600))
            })
            .await
            .unwrap();
        assert_eq!(token, "second");
    }

    #[tokio::test]
    async fn short_lived_tokens_expire_immediately_under_the_margin() {
        let cache = AccessTokenCache::new();
        cache
            .get_or_refresh(1, || async {
                Ok::<_, std::convert::Infallible>(refreshed("short", 30))
            })
            .await
            .unwrap();
        // 30s lifetime < 60s margin: next call must refresh again.
        let token = cache
            .get_or_refresh(1, || async {
                Ok::<_, std::convert::Infallible>(refreshed("again", 3600))
            })
            .await
            .unwrap();
        assert_eq!(token, "again");
    }

    #[tokio::test]
    async fn refresh_errors_do_not_poison_the_cache() {
        let cache = AccessTokenCache::new();
        let err = cache
            .get_or_refresh(1, || async { Err::<RefreshedToken, &str>("boom") })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");

        let token = cache
            .get_or_refresh(1, || async {
                Ok::<_, std::convert::Infallible>(refreshed("ok", 3600))
            })
            .await
            .unwrap();
        assert_eq!(token, "ok");
    }
}
