//! Token→primary-proxy assignment via weighted rendezvous hashing.
//!
//! Each token scores every endpoint with fnv1a64 over
//! `"{token_id}|{endpoint_id}|pool:{pool_id}"` and walks its preference list
//! (descending score, ascending id on ties) to the first endpoint with spare
//! capacity. Deterministic for a given (tokens, endpoints, salt, capacity);
//! minimal churn when endpoints come and go.

use std::collections::HashMap;

use serde_json::json;
use sqlx::SqlitePool;

use pxr_types::{iso_utc_ms, ApiError, ErrorCode};

pub fn fnv1a64(text: &str) -> u64 {
    let mut hash: u64 = 14695981039346656037;
    for byte in text.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash
}

/// Endpoint ids in this token's preference order.
fn rendezvous_order(token_id: i64, endpoint_ids: &[i64], salt: &str) -> Vec<i64> {
    let mut scored: Vec<(u64, i64)> = endpoint_ids
        .iter()
        .map(|eid| (fnv1a64(&format!("{token_id}|{eid}|{salt}")), *eid))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.into_iter().map(|(_, eid)| eid).collect()
}

/// Capacity-constrained assignment. Tokens walk their preference lists in id
/// order; an over-capacity token stays unassigned.
fn compute_primary_assignments(
    token_ids: &[i64],
    endpoint_ids: &[i64],
    capacity: &HashMap<i64, i64>,
    salt: &str,
) -> HashMap<i64, i64> {
    let mut remaining = capacity.clone();
    let mut out = HashMap::with_capacity(token_ids.len());
    for token_id in token_ids {
        for endpoint_id in rendezvous_order(*token_id, endpoint_ids, salt) {
            let slot = remaining.entry(endpoint_id).or_insert(0);
            if *slot > 0 {
                *slot -= 1;
                out.insert(*token_id, endpoint_id);
                break;
            }
        }
    }
    out
}

/// Soft variant: over-capacity tokens fall back to their first preference.
fn compute_primary_assignments_soft(
    token_ids: &[i64],
    endpoint_ids: &[i64],
    capacity: &HashMap<i64, i64>,
    salt: &str,
) -> (HashMap<i64, i64>, i64) {
    let mut out = compute_primary_assignments(token_ids, endpoint_ids, capacity, salt);
    let mut over_capacity = 0;
    for token_id in token_ids {
        if out.contains_key(token_id) {
            continue;
        }
        let order = rendezvous_order(*token_id, endpoint_ids, salt);
        if let Some(first) = order.first() {
            out.insert(*token_id, *first);
            over_capacity += 1;
        }
    }
    (out, over_capacity)
}

/// Result summary returned to the admin caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecomputeOutcome {
    pub recomputed: i64,
    pub strict: bool,
    pub over_capacity_assigned: i64,
    pub token_count: i64,
    pub proxy_count: i64,
    pub max_tokens_per_proxy: i64,
    pub weight_sum: i64,
    pub capacity: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum RecomputeError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// Recompute every binding for `pool_id`.
///
/// `capacity[e] = max_tokens_per_proxy * weight_e`. With `strict`, exceeding
/// total capacity is a `BAD_REQUEST` carrying the counts; without it, the
/// overflow rides on first preferences and is reported.
pub async fn recompute_token_proxy_bindings(
    pool: &SqlitePool,
    pool_id: i64,
    max_tokens_per_proxy: i64,
    strict: bool,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<RecomputeOutcome, RecomputeError> {
    if pool_id <= 0 {
        return Err(ApiError::bad_request("Invalid pool_id").into());
    }
    if max_tokens_per_proxy <= 0 || max_tokens_per_proxy > 1000 {
        return Err(ApiError::bad_request("Invalid max_tokens_per_proxy").into());
    }

    let members = pxr_db::proxies::list_weighted_members(pool, pool_id).await?;

    let mut capacity: HashMap<i64, i64> = HashMap::new();
    let mut endpoint_ids: Vec<i64> = Vec::new();
    let mut weight_sum: i64 = 0;
    for (endpoint_id, weight) in &members {
        let cap = max_tokens_per_proxy * (*weight).max(0);
        if cap > 0 {
            capacity.insert(*endpoint_id, cap);
            endpoint_ids.push(*endpoint_id);
            weight_sum += (*weight).max(0);
        }
    }
    if endpoint_ids.is_empty() {
        return Err(ApiError::bad_request("No enabled proxies in pool").into());
    }

    let token_ids = pxr_db::tokens::list_bindable_token_ids(pool).await?;
    if token_ids.is_empty() {
        return Ok(RecomputeOutcome {
            recomputed: 0,
            strict,
            over_capacity_assigned: 0,
            token_count: 0,
            proxy_count: endpoint_ids.len() as i64,
            max_tokens_per_proxy,
            weight_sum,
            capacity: capacity.values().sum(),
        });
    }

    let total_capacity: i64 = capacity.values().sum();
    if strict && token_ids.len() as i64 > total_capacity {
        return Err(ApiError::bad_request("Proxy capacity exceeded for this pool")
            .with_details(json!({
                "token_count": token_ids.len(),
                "proxy_count": endpoint_ids.len(),
                "max_tokens_per_proxy": max_tokens_per_proxy,
                "weight_sum": weight_sum,
                "capacity": total_capacity,
            }))
            .into());
    }

    let salt = format!("pool:{pool_id}");
    let (assignments, over_capacity_assigned) = if strict {
        (
            compute_primary_assignments(&token_ids, &endpoint_ids, &capacity, &salt),
            0,
        )
    } else {
        compute_primary_assignments_soft(&token_ids, &endpoint_ids, &capacity, &salt)
    };

    let now_iso = iso_utc_ms(now);
    for token_id in &token_ids {
        let Some(primary) = assignments.get(token_id) else {
            return Err(ApiError::new(
                ErrorCode::InternalError,
                "Binding recompute produced no assignment",
                500,
            )
            .into());
        };
        pxr_db::bindings::upsert_binding_primary(pool, *token_id, pool_id, *primary, &now_iso)
            .await?;
    }

    Ok(RecomputeOutcome {
        recomputed: token_ids.len() as i64,
        strict,
        over_capacity_assigned,
        token_count: token_ids.len() as i64,
        proxy_count: endpoint_ids.len() as i64,
        max_tokens_per_proxy,
        weight_sum,
        capacity: total_capacity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a64_reference_values() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a64(""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64("a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a64("foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn order_is_deterministic_and_permutation() {
        let endpoints = vec![10, 20, 30, 40];
        let a = rendezvous_order(1, &endpoints, "pool:1");
        let b = rendezvous_order(1, &endpoints, "pool:1");
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, endpoints);
        // A different salt reshuffles.
        let c = rendezvous_order(1, &endpoints, "pool:2");
        assert_eq!(a.len(), c.len());
    }

    #[test]
    fn endpoint_removal_only_moves_affected_tokens() {
        let full = vec![10, 20, 30];
        let reduced = vec![10, 30];
        for token_id in 0..50 {
            let before = rendezvous_order(token_id, &full, "pool:1");
            let after = rendezvous_order(token_id, &reduced, "pool:1");
            if before[0] != 20 {
                assert_eq!(before[0], after[0], "token {token_id} should not move");
            }
        }
    }

    #[test]
    fn strict_assignment_respects_capacity() {
        let tokens: Vec<i64> = (1..=4).collect();
        let endpoints = vec![100, 200];
        let capacity: HashMap<i64, i64> = [(100, 2), (200, 2)].into();
        let out = compute_primary_assignments(&tokens, &endpoints, &capacity, "pool:7");
        assert_eq!(out.len(), 4);
        let assigned_to_100 = out.values().filter(|e| **e == 100).count();
        let assigned_to_200 = out.values().filter(|e| **e == 200).count();
        assert!(assigned_to_100 <= 2);
        assert!(assigned_to_200 <= 2);
    }

    #[test]
    fn soft_assignment_reports_overflow() {
        let tokens: Vec<i64> = (1..=5).collect();
        let endpoints = vec![100, 200];
        let capacity: HashMap<i64, i64> = [(100, 2), (200, 2)].into();
        let (out, over) = compute_primary_assignments_soft(&tokens, &endpoints, &capacity, "pool:7");
        assert_eq!(out.len(), 5, "every token gets a primary");
        assert_eq!(over, 1);
    }
}
