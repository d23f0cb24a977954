//! Backoff curves and rate-limit classification, kept together so the
//! operational tuning surface is one file.
//!
//! All curves are pure in `(attempt, status)`: monotonic in attempt, capped,
//! with distinct shapes per failure class (auth failures sit out longest,
//! rate limits shortest).

/// Tunable curve parameters. The defaults match production behavior; ops can
/// construct a custom policy without touching call sites.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Auth-class refresh failures (400/401/403 from the OAuth host).
    pub auth_base_s: u64,
    pub auth_cap_s: u64,
    /// Generic refresh failures (5xx / transport).
    pub generic_base_s: u64,
    pub generic_cap_s: u64,
    /// App API rate limiting.
    pub rate_limit_base_s: u64,
    pub rate_limit_cap_s: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            auth_base_s: 300,
            auth_cap_s: 6 * 60 * 60,
            generic_base_s: 30,
            generic_cap_s: 30 * 60,
            rate_limit_base_s: 30,
            rate_limit_cap_s: 15 * 60,
        }
    }
}

fn curve(base: u64, cap: u64, attempt: i64) -> u64 {
    let attempt = attempt.max(1) as u32;
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1).min(20));
    base.saturating_mul(factor).min(cap)
}

impl BackoffPolicy {
    /// Backoff after a failed OAuth refresh. Auth-class statuses get the long
    /// curve; everything else (5xx, transport, unknown) the medium one.
    pub fn refresh_backoff_seconds(&self, attempt: i64, status: Option<u16>) -> u64 {
        match status {
            Some(400) | Some(401) | Some(403) => curve(self.auth_base_s, self.auth_cap_s, attempt),
            _ => curve(self.generic_base_s, self.generic_cap_s, attempt),
        }
    }

    /// Backoff after the App API rate-limits a token.
    pub fn rate_limit_backoff_seconds(&self, attempt: i64) -> u64 {
        curve(self.rate_limit_base_s, self.rate_limit_cap_s, attempt)
    }
}

/// Does this App API response mean the token is rate limited? Pixiv answers
/// 403 with a "Rate Limit" body (and 429 on some edges).
pub fn classify_rate_limit(status: u16, body: Option<&str>) -> bool {
    if status == 429 {
        return true;
    }
    if status == 403 {
        return body
            .map(|b| b.to_ascii_lowercase().contains("rate limit"))
            .unwrap_or(false);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curves_are_monotonic_and_capped() {
        let policy = BackoffPolicy::default();
        let mut previous = 0;
        for attempt in 1..=24 {
            let s = policy.refresh_backoff_seconds(attempt, Some(401));
            assert!(s >= previous, "attempt {attempt}");
            previous = s;
        }
        assert_eq!(policy.refresh_backoff_seconds(24, Some(401)), policy.auth_cap_s);
        assert_eq!(policy.rate_limit_backoff_seconds(24), policy.rate_limit_cap_s);
    }

    #[test]
    fn auth_failures_back_off_longer_than_5xx() {
        let policy = BackoffPolicy::default();
        assert!(
            policy.refresh_backoff_seconds(1, Some(400))
                > policy.refresh_backoff_seconds(1, Some(503))
        );
        assert_eq!(
            policy.refresh_backoff_seconds(1, None),
            policy.refresh_backoff_seconds(1, Some(500))
        );
    }

    #[test]
    fn first_rate_limit_is_short() {
        let policy = BackoffPolicy::default();
        let s = policy.rate_limit_backoff_seconds(1);
        assert!((10..180).contains(&(s as i64)));
    }

    #[test]
    fn rate_limit_classification() {
        assert!(classify_rate_limit(429, None));
        assert!(classify_rate_limit(403, Some(r#"{"error":{"message":"Rate Limit"}}"#)));
        assert!(!classify_rate_limit(403, Some("forbidden")));
        assert!(!classify_rate_limit(403, None));
        assert!(!classify_rate_limit(500, Some("Rate Limit")));
    }
}
