//! Host→proxy routing and endpoint selection.
//!
//! Policy comes from runtime settings; endpoints come from pool membership.
//! Fail-closed discipline: when routing says a proxy is required and none is
//! eligible, selection raises `PROXY_REQUIRED` with per-pool diagnostics
//! instead of silently going direct.

use rand::Rng;
use serde_json::json;
use sqlx::SqlitePool;

use pxr_crypto::FieldEncryptor;
use pxr_db::proxies::{self, CandidateEndpoint};
use pxr_db::settings::RuntimeConfig;
use pxr_types::{ApiError, ErrorCode};

const PIXIV_HOST_SUFFIXES: &[&str] = &["pixiv.net", "pximg.net", "secure.pixiv.net"];

#[derive(Debug, thiserror::Error)]
pub enum ProxySelectError {
    /// Fail-closed: routing demands a proxy and none is available.
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// A selected upstream proxy, ready for `reqwest::Proxy::all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyUri {
    pub uri: String,
    pub endpoint_id: i64,
    pub pool_id: i64,
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_matches('.').to_ascii_lowercase()
}

/// Extract the (normalized) host from an http(s) URL.
pub fn host_from_url(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    // Strip userinfo, then the port (brackets for IPv6 literals).
    let host_port = authority.rsplit('@').next()?;
    let host = if let Some(stripped) = host_port.strip_prefix('[') {
        stripped.split(']').next()?
    } else {
        host_port.split(':').next()?
    };
    let host = normalize_host(host);
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Equality or strict subdomain; never a substring match.
fn suffix_match(host: &str, suffix: &str) -> bool {
    let host = normalize_host(host);
    let suffix = normalize_host(suffix);
    if host.is_empty() || suffix.is_empty() {
        return false;
    }
    host == suffix || host.ends_with(&format!(".{suffix}"))
}

/// Routing policy: does this host go through a proxy at all?
pub fn should_use_proxy_for_host(runtime: &RuntimeConfig, host: &str) -> bool {
    if !runtime.proxy_enabled {
        return false;
    }
    let host = normalize_host(host);
    if host.is_empty() {
        return false;
    }
    match runtime.proxy_route_mode.as_str() {
        "all" => true,
        "allowlist" => runtime
            .proxy_allowlist_domains
            .iter()
            .any(|suffix| suffix_match(&host, suffix)),
        "pixiv_only" => PIXIV_HOST_SUFFIXES
            .iter()
            .any(|suffix| suffix_match(&host, suffix)),
        _ => false,
    }
}

/// Longest-suffix match against `proxy.route_pools`, falling back to the
/// default pool.
pub fn resolve_pool_id_for_host(runtime: &RuntimeConfig, host: &str) -> Option<i64> {
    let host = normalize_host(host);
    if host.is_empty() {
        return None;
    }

    let mut best: Option<(usize, i64)> = None;
    for (suffix, pool_id) in &runtime.proxy_route_pools {
        if !suffix_match(&host, suffix) {
            continue;
        }
        if best.map_or(true, |(len, _)| suffix.len() > len) {
            best = Some((suffix.len(), *pool_id));
        }
    }
    best.map(|(_, pool_id)| pool_id)
        .filter(|id| *id > 0)
        .or(runtime.proxy_default_pool_id.filter(|id| *id > 0))
}

/// Weighted pick over `(endpoint_id, weight)`. Zero total weight degrades to
/// uniform.
fn weighted_choice(items: &[(i64, i64)], roll: f64) -> Option<i64> {
    if items.is_empty() {
        return None;
    }
    let total: i64 = items.iter().map(|(_, w)| (*w).max(0)).sum();
    if total <= 0 {
        let idx = ((roll * items.len() as f64) as usize).min(items.len() - 1);
        return Some(items[idx].0);
    }
    let mut remaining = roll.clamp(0.0, 0.999_999_999) * total as f64;
    for (id, weight) in items {
        let w = (*weight).max(0) as f64;
        if w <= 0.0 {
            continue;
        }
        if remaining < w {
            return Some(*id);
        }
        remaining -= w;
    }
    Some(items[items.len() - 1].0)
}

/// Build `scheme://[user:pass@]host:port`, decrypting the stored password.
pub fn build_proxy_uri(
    encryptor: Option<&FieldEncryptor>,
    candidate: &CandidateEndpoint,
) -> Result<String, ApiError> {
    let scheme = candidate.scheme.trim().to_ascii_lowercase();
    let host = candidate.host.trim();
    if scheme.is_empty() || host.is_empty() || candidate.port <= 0 {
        return Err(ApiError::internal("Invalid proxy endpoint"));
    }

    let password = if candidate.password_enc.trim().is_empty() {
        String::new()
    } else {
        let encryptor = encryptor.ok_or_else(|| {
            ApiError::internal("Encryption not configured for proxy credentials")
        })?;
        encryptor
            .decrypt_text(&candidate.password_enc)
            .map_err(|_| ApiError::internal("Proxy credential decryption failed"))?
    };

    // Bracket bare IPv6 literals.
    let host_part = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };

    let auth = if candidate.username.trim().is_empty() {
        String::new()
    } else {
        format!(
            "{}:{}@",
            urlencoding::encode(candidate.username.trim()),
            urlencoding::encode(&password)
        )
    };

    Ok(format!("{scheme}://{auth}{host_part}:{}", candidate.port))
}

fn candidate_to_proxy_uri(
    encryptor: Option<&FieldEncryptor>,
    candidate: &CandidateEndpoint,
    pool_id: i64,
) -> Result<ProxyUri, ApiError> {
    Ok(ProxyUri {
        uri: build_proxy_uri(encryptor, candidate)?,
        endpoint_id: candidate.id,
        pool_id,
    })
}

/// Pick an endpoint within one pool: binding override first (when active and
/// still eligible), then the binding primary, then a health-partitioned
/// weighted pick over all eligible members.
async fn select_in_pool(
    pool: &SqlitePool,
    encryptor: Option<&FieldEncryptor>,
    pool_id: i64,
    token_id: Option<i64>,
    now_iso: &str,
) -> Result<Option<ProxyUri>, ProxySelectError> {
    if pool_id <= 0 {
        return Ok(None);
    }

    if let Some(token_id) = token_id.filter(|id| *id > 0) {
        if let Some(binding) = pxr_db::bindings::load_binding(pool, token_id, pool_id).await? {
            let mut preferred: Vec<i64> = Vec::new();
            if binding.override_active(now_iso) {
                if let Some(override_id) = binding.override_proxy_id {
                    preferred.push(override_id);
                }
            }
            preferred.push(binding.primary_proxy_id);

            for endpoint_id in preferred {
                if let Some(candidate) =
                    proxies::load_eligible_endpoint(pool, pool_id, endpoint_id, now_iso).await?
                {
                    return Ok(Some(candidate_to_proxy_uri(encryptor, &candidate, pool_id)?));
                }
            }
        }
    }

    let candidates = proxies::eligible_endpoints_in_pool(pool, pool_id, now_iso).await?;
    if candidates.is_empty() {
        return Ok(None);
    }

    // Partition by health: healthy (last ok at or after last fail), unknown
    // (never used), unhealthy. Pick weighted from the first non-empty class.
    let mut healthy: Vec<(i64, i64)> = Vec::new();
    let mut unknown: Vec<(i64, i64)> = Vec::new();
    let mut unhealthy: Vec<(i64, i64)> = Vec::new();
    for c in &candidates {
        let entry = (c.id, c.weight);
        match (&c.last_ok_at, &c.last_fail_at) {
            (Some(ok), Some(fail)) if ok >= fail => healthy.push(entry),
            (Some(_), None) => healthy.push(entry),
            (None, None) => unknown.push(entry),
            _ => unhealthy.push(entry),
        }
    }
    let class = if !healthy.is_empty() {
        healthy
    } else if !unknown.is_empty() {
        unknown
    } else {
        unhealthy
    };

    let roll = rand::thread_rng().gen_range(0.0..1.0);
    let Some(chosen_id) = weighted_choice(&class, roll) else {
        return Ok(None);
    };
    let Some(candidate) = candidates.iter().find(|c| c.id == chosen_id) else {
        return Ok(None);
    };
    Ok(Some(candidate_to_proxy_uri(encryptor, candidate, pool_id)?))
}

/// Select the proxy for one outbound request, or `None` when routing says to
/// go direct. See module docs for the fail-closed contract.
pub async fn select_proxy_uri_for_url(
    pool: &SqlitePool,
    encryptor: Option<&FieldEncryptor>,
    runtime: &RuntimeConfig,
    url: &str,
    token_id: Option<i64>,
    now_iso: &str,
) -> Result<Option<ProxyUri>, ProxySelectError> {
    let Some(host) = host_from_url(url) else {
        return Ok(None);
    };
    if !should_use_proxy_for_host(runtime, &host) {
        return Ok(None);
    }

    let preferred_pool_id = resolve_pool_id_for_host(runtime, &host);
    let enabled_pools = proxies::list_enabled_pool_ids(pool).await?;

    let mut pool_candidates: Vec<i64> = Vec::new();
    if let Some(preferred) = preferred_pool_id {
        if enabled_pools.contains(&preferred) {
            pool_candidates.push(preferred);
        }
    }
    for pid in &enabled_pools {
        if !pool_candidates.contains(pid) {
            pool_candidates.push(*pid);
        }
    }

    if pool_candidates.is_empty() {
        if runtime.proxy_fail_closed {
            return Err(ApiError::new(
                ErrorCode::ProxyRequired,
                "Proxy required but no proxy pool is configured",
                502,
            )
            .with_details(json!({
                "reason": "no_proxy_pool_configured",
                "host": host,
                "url": url,
            }))
            .into());
        }
        return Ok(None);
    }

    for pool_id in &pool_candidates {
        if let Some(picked) = select_in_pool(pool, encryptor, *pool_id, token_id, now_iso).await? {
            return Ok(Some(picked));
        }
    }

    if runtime.proxy_fail_closed {
        let mut pools = Vec::new();
        let mut endpoints_total = 0i64;
        let mut endpoints_eligible = 0i64;
        let mut next_available_at: Option<String> = None;
        for pid in &pool_candidates {
            let stats = proxies::pool_health_stats(pool, *pid, now_iso).await?;
            endpoints_total += stats.endpoints_total;
            endpoints_eligible += stats.endpoints_eligible;
            if let Some(next) = &stats.next_available_at {
                if next_available_at.as_deref().map_or(true, |cur| next.as_str() < cur) {
                    next_available_at = Some(next.clone());
                }
            }
            pools.push(stats);
        }

        let reason = if endpoints_total <= 0 {
            "pool_has_no_endpoints"
        } else if endpoints_eligible <= 0 && next_available_at.is_some() {
            "all_endpoints_blacklisted"
        } else {
            "no_healthy_proxy_available"
        };

        return Err(ApiError::new(
            ErrorCode::ProxyRequired,
            "Proxy required but no eligible endpoint is available",
            502,
        )
        .with_details(json!({
            "reason": reason,
            "host": host,
            "url": url,
            "pool_id": preferred_pool_id.unwrap_or(pool_candidates[0]),
            "attempted_pool_ids": pool_candidates,
            "pools": pools,
            "endpoints_total": endpoints_total,
            "endpoints_eligible": endpoints_eligible,
            "next_available_at": next_available_at,
        }))
        .into());
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(mode: &str) -> RuntimeConfig {
        RuntimeConfig {
            proxy_enabled: true,
            proxy_route_mode: mode.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn host_extraction() {
        assert_eq!(
            host_from_url("https://i.pximg.net/img-original/x.jpg").as_deref(),
            Some("i.pximg.net")
        );
        assert_eq!(
            host_from_url("http://user:pw@Example.COM:8080/p?q=1").as_deref(),
            Some("example.com")
        );
        assert_eq!(host_from_url("https://[::1]:443/x").as_deref(), Some("::1"));
        assert_eq!(host_from_url("not a url"), None);
    }

    #[test]
    fn suffix_matching_is_not_substring_matching() {
        let rt = runtime("pixiv_only");
        assert!(should_use_proxy_for_host(&rt, "app-api.pixiv.net"));
        assert!(should_use_proxy_for_host(&rt, "pixiv.net"));
        assert!(should_use_proxy_for_host(&rt, "i.pximg.net"));
        // "evilpixiv.net" must not match the "pixiv.net" suffix.
        assert!(!should_use_proxy_for_host(&rt, "evilpixiv.net"));
        assert!(!should_use_proxy_for_host(&rt, "example.com"));
    }

    #[test]
    fn route_modes() {
        assert!(!should_use_proxy_for_host(&runtime("off"), "pixiv.net"));
        assert!(should_use_proxy_for_host(&runtime("all"), "anything.example"));

        let mut rt = runtime("allowlist");
        rt.proxy_allowlist_domains = vec!["example.org".to_string()];
        assert!(should_use_proxy_for_host(&rt, "cdn.example.org"));
        assert!(!should_use_proxy_for_host(&rt, "example.com"));

        let mut disabled = runtime("all");
        disabled.proxy_enabled = false;
        assert!(!should_use_proxy_for_host(&disabled, "pixiv.net"));
    }

    #[test]
    fn pool_resolution_longest_suffix_wins() {
        let mut rt = runtime("all");
        rt.proxy_route_pools.insert("pixiv.net".to_string(), 1);
        rt.proxy_route_pools.insert("app-api.pixiv.net".to_string(), 2);
        rt.proxy_default_pool_id = Some(9);

        assert_eq!(resolve_pool_id_for_host(&rt, "app-api.pixiv.net"), Some(2));
        assert_eq!(resolve_pool_id_for_host(&rt, "www.pixiv.net"), Some(1));
        assert_eq!(resolve_pool_id_for_host(&rt, "unrelated.example"), Some(9));

        rt.proxy_default_pool_id = None;
        assert_eq!(resolve_pool_id_for_host(&rt, "unrelated.example"), None);
    }

    #[test]
    fn weighted_choice_bands() {
        let items = vec![(1, 3), (2, 1)];
        assert_eq!(weighted_choice(&items, 0.0), Some(1));
        assert_eq!(weighted_choice(&items, 0.74), Some(1));
        assert_eq!(weighted_choice(&items, 0.76), Some(2));
        assert_eq!(weighted_choice(&[], 0.5), None);
        // All-zero weights degrade to uniform.
        assert!(weighted_choice(&[(7, 0), (8, 0)], 0.9).is_some());
    }

    #[test]
    fn proxy_uri_quotes_credentials() {
        let candidate = CandidateEndpoint {
            id: 1,
            scheme: "socks5".to_string(),
            host: "10.0.0.1".to_string(),
            port: 1080,
            username: "user name".to_string(),
            password_enc: String::new(),
            weight: 1,
            last_ok_at: None,
            last_fail_at: None,
        };
        let uri = build_proxy_uri(None, &candidate).unwrap();
        assert_eq!(uri, "socks5://user%20name:@10.0.0.1:1080");

        let bare = CandidateEndpoint {
            username: String::new(),
            ..candidate
        };
        assert_eq!(build_proxy_uri(None, &bare).unwrap(), "socks5://10.0.0.1:1080");
    }
}
