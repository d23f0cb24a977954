//! Token selection. Pure over a candidate snapshot; the caller loads rows,
//! supplies the clock and the random roll, and remembers `last_token_id` for
//! stickiness.

/// Selection strategy name, parsed leniently from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    LeastError,
    Weighted,
    Sticky,
}

impl Strategy {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "weighted" => Strategy::Weighted,
            "sticky" => Strategy::Sticky,
            _ => Strategy::LeastError,
        }
    }
}

/// Selection-relevant snapshot of one token row. Times are epoch seconds.
#[derive(Debug, Clone)]
pub struct TokenCandidate {
    pub id: i64,
    pub enabled: bool,
    pub weight: i64,
    pub error_count: i64,
    pub backoff_until: Option<f64>,
    pub last_ok_at: Option<f64>,
}

impl TokenCandidate {
    fn eligible(&self, now: f64, exclude: &[i64]) -> bool {
        self.enabled
            && self.weight > 0
            && self.backoff_until.map_or(true, |until| until <= now)
            && !exclude.contains(&self.id)
    }
}

/// No token can serve right now. `next_retry_at` is the earliest instant a
/// backed-off token becomes eligible again, or `None` when every token is
/// disabled outright.
#[derive(Debug, thiserror::Error)]
#[error("no eligible token available")]
pub struct NoTokenAvailable {
    pub next_retry_at: Option<f64>,
}

/// Pick a token id.
///
/// - `least_error`: smallest `error_count`; ties go to the most recently used
///   token, then the smaller id.
/// - `weighted`: reservoir over `weight` using the roll `r`.
/// - `sticky`: re-use `last_id` when still eligible, else least_error.
pub fn choose_token(
    candidates: &[TokenCandidate],
    strategy: Strategy,
    now: f64,
    last_id: Option<i64>,
    r: f64,
    exclude: &[i64],
) -> Result<i64, NoTokenAvailable> {
    let eligible: Vec<&TokenCandidate> = candidates
        .iter()
        .filter(|c| c.eligible(now, exclude))
        .collect();

    if eligible.is_empty() {
        // Earliest recovery among tokens blocked only by backoff.
        let next_retry_at = candidates
            .iter()
            .filter(|c| c.enabled && c.weight > 0 && !exclude.contains(&c.id))
            .filter_map(|c| c.backoff_until)
            .filter(|until| *until > now)
            .fold(None::<f64>, |acc, until| {
                Some(acc.map_or(until, |a| a.min(until)))
            });
        return Err(NoTokenAvailable { next_retry_at });
    }

    match strategy {
        Strategy::Sticky => {
            if let Some(last_id) = last_id {
                if let Some(found) = eligible.iter().find(|c| c.id == last_id) {
                    return Ok(found.id);
                }
            }
            Ok(least_error(&eligible))
        }
        Strategy::Weighted => Ok(weighted(&eligible, r)),
        Strategy::LeastError => Ok(least_error(&eligible)),
    }
}

fn least_error(eligible: &[&TokenCandidate]) -> i64 {
    let mut best = eligible[0];
    for c in &eligible[1..] {
        let better = match c.error_count.cmp(&best.error_count) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => {
                // More recently used wins the tie (warm credential), then id.
                let c_last = c.last_ok_at.unwrap_or(0.0);
                let best_last = best.last_ok_at.unwrap_or(0.0);
                if c_last != best_last {
                    c_last > best_last
                } else {
                    c.id < best.id
                }
            }
        };
        if better {
            best = c;
        }
    }
    best.id
}

fn weighted(eligible: &[&TokenCandidate], r: f64) -> i64 {
    let total: i64 = eligible.iter().map(|c| c.weight.max(0)).sum();
    if total <= 0 {
        return eligible[0].id;
    }
    let mut roll = r.clamp(0.0, 0.999_999_999) * total as f64;
    for c in eligible {
        let w = c.weight.max(0) as f64;
        if w <= 0.0 {
            continue;
        }
        if roll < w {
            return c.id;
        }
        roll -= w;
    }
    eligible[eligible.len() - 1].id
}
