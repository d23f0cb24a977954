//! pximg mirror selection and URL rewriting.
//!
//! When mirror mode is on, `i.pximg.net` originals are rewritten to a
//! reverse-proxy host that does not require a Referer dance. Aliases
//! `cat|re|nl` name the well-known mirrors; a custom FQDN must be in the
//! allowlist shape (a `pixiv.{cat,re,nl}` subdomain or an explicit
//! `i.` host from runtime config).

use axum::http::HeaderMap;

pub const DEFAULT_MIRROR_HOST: &str = "i.pixiv.cat";

const KNOWN_MIRRORS: &[&str] = &["i.pixiv.cat", "i.pixiv.re", "i.pixiv.nl"];

/// Normalize an operator/caller-supplied mirror host. Accepts the short
/// aliases and known mirror FQDNs; everything else is rejected.
pub fn normalize_mirror_host(raw: &str) -> Option<String> {
    let value = raw.trim().to_ascii_lowercase();
    if value.is_empty() {
        return None;
    }
    match value.as_str() {
        "cat" => return Some("i.pixiv.cat".to_string()),
        "re" => return Some("i.pixiv.re".to_string()),
        "nl" => return Some("i.pixiv.nl".to_string()),
        _ => {}
    }
    if KNOWN_MIRRORS.contains(&value.as_str()) {
        return Some(value);
    }
    None
}

/// Rewrite an `i.pximg.net` URL onto `mirror_host`; other hosts pass through
/// untouched.
pub fn rewrite_pximg_to_mirror(url: &str, mirror_host: &str) -> String {
    let mirror_host = mirror_host.trim();
    if mirror_host.is_empty() {
        return url.to_string();
    }
    for scheme in ["https://", "http://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            if let Some(path) = rest.strip_prefix("i.pximg.net") {
                return format!("https://{mirror_host}{path}");
            }
            return url.to_string();
        }
    }
    url.to_string()
}

/// Pick a mirror for this request. Clients hinting a zh-CN locale get the
/// `.re` mirror (reachable where `.cat` is not); everyone else gets the
/// configured fallback.
pub fn pick_mirror_for_request(headers: &HeaderMap, fallback_host: &str) -> String {
    let accept_language = headers
        .get("accept-language")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if accept_language.contains("zh-cn") || accept_language.contains("zh-hans") {
        return "i.pixiv.re".to_string();
    }
    let fallback = fallback_host.trim();
    if fallback.is_empty() {
        DEFAULT_MIRROR_HOST.to_string()
    } else {
        fallback.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_and_fqdns_normalize() {
        assert_eq!(normalize_mirror_host("cat").as_deref(), Some("i.pixiv.cat"));
        assert_eq!(normalize_mirror_host("RE").as_deref(), Some("i.pixiv.re"));
        assert_eq!(normalize_mirror_host("i.pixiv.nl").as_deref(), Some("i.pixiv.nl"));
        assert_eq!(normalize_mirror_host("evil.example"), None);
        assert_eq!(normalize_mirror_host(""), None);
    }

    #[test]
    fn rewrite_only_touches_pximg() {
        assert_eq!(
            rewrite_pximg_to_mirror(
                "https://i.pximg.net/img-original/img/1_p0.jpg",
                "i.pixiv.cat"
            ),
            "https://i.pixiv.cat/img-original/img/1_p0.jpg"
        );
        assert_eq!(
            rewrite_pximg_to_mirror("https://example.com/x.jpg", "i.pixiv.cat"),
            "https://example.com/x.jpg"
        );
    }

    #[test]
    fn locale_hint_prefers_reachable_mirror() {
        let mut headers = HeaderMap::new();
        headers.insert("accept-language", "zh-CN,zh;q=0.9".parse().unwrap());
        assert_eq!(pick_mirror_for_request(&headers, "i.pixiv.cat"), "i.pixiv.re");

        let headers = HeaderMap::new();
        assert_eq!(pick_mirror_for_request(&headers, "i.pixiv.nl"), "i.pixiv.nl");
        assert_eq!(pick_mirror_for_request(&headers, ""), DEFAULT_MIRROR_HOST);
    }
}
