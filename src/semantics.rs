//! The slice of HTTP caching semantics the proxy enforces: extracting a TTL
//! from an upstream `Cache-Control` header and deciding whether a
//! `Content-Type` is worth caching.
//!
//! Client-supplied `Cache-Control` is deliberately never consulted; only the
//! origin decides what is cacheable.

/// Media types admitted into the cache, as `(type, subtype-or-suffix)`.
const CACHEABLE_TYPES: &[(&str, &str)] = &[
    ("application", "xml"),
    ("application", "json"),
    ("application", "javascript"),
    ("text", "javascript"),
    ("text", "xml"),
    ("text", "css"),
    ("text", "html"),
    ("text", "plain"),
];

/// Extracts a TTL in seconds from a `Cache-Control` header value.
///
/// `no-cache` and `private` short-circuit to 0, even when an explicit
/// `s-maxage` is also present. Otherwise `s-maxage` wins over `max-age`,
/// and a value with neither yields 0. Parsing is decimal and saturating.
pub fn ttl_from_cache_control(value: &str) -> u32 {
    if value.contains("no-cache") || value.contains("private") {
        return 0;
    }
    if let Some(ttl) = digits_after(value, "s-maxage=") {
        return ttl;
    }
    if let Some(ttl) = digits_after(value, "max-age=") {
        return ttl;
    }
    0
}

fn digits_after(value: &str, token: &str) -> Option<u32> {
    let rest = &value[value.find(token)? + token.len()..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let digits = &rest[..end];
    if digits.is_empty() {
        return None;
    }
    Some(digits.bytes().fold(0u32, |acc, b| {
        acc.saturating_mul(10).saturating_add(u32::from(b - b'0'))
    }))
}

/// Returns true when a `Content-Type` value names a representation the
/// proxy is willing to cache.
///
/// The value is parsed into `type/subtype` (parameters after `;` are
/// discarded, matching is ASCII case-insensitive) and admitted when either
/// the subtype or its `+suffix` is in the allow list. Unparseable values
/// are rejected.
pub fn cacheable_media_type(value: &str) -> bool {
    let essence = value.split(';').next().unwrap_or("").trim();
    let Some((main, subtype)) = essence.split_once('/') else {
        return false;
    };
    let main = main.trim().to_ascii_lowercase();
    let subtype = subtype.trim().to_ascii_lowercase();
    if main.is_empty() || subtype.is_empty() {
        return false;
    }
    let suffix = subtype.rsplit_once('+').map(|(_, s)| s.to_string());
    CACHEABLE_TYPES.iter().any(|(t, s)| {
        *t == main && (*s == subtype || suffix.as_deref() == Some(s))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_parses_max_age() {
        assert_eq!(ttl_from_cache_control("max-age=300"), 300);
        assert_eq!(ttl_from_cache_control("public, max-age=60"), 60);
        assert_eq!(ttl_from_cache_control("max-age=007"), 7);
    }

    #[test]
    fn ttl_prefers_s_maxage() {
        assert_eq!(ttl_from_cache_control("max-age=60, s-maxage=600"), 600);
        assert_eq!(ttl_from_cache_control("s-maxage=10, max-age=99"), 10);
    }

    #[test]
    fn ttl_no_cache_short_circuits() {
        assert_eq!(ttl_from_cache_control("no-cache"), 0);
        assert_eq!(ttl_from_cache_control("private, max-age=60"), 0);
        // An explicit s-maxage does not rescue a no-cache response.
        assert_eq!(ttl_from_cache_control("no-cache, s-maxage=300"), 0);
    }

    #[test]
    fn ttl_without_directives_is_zero() {
        assert_eq!(ttl_from_cache_control(""), 0);
        assert_eq!(ttl_from_cache_control("public"), 0);
        assert_eq!(ttl_from_cache_control("max-age="), 0);
        assert_eq!(ttl_from_cache_control("max-age=abc"), 0);
    }

    #[test]
    fn ttl_saturates() {
        assert_eq!(
            ttl_from_cache_control("max-age=99999999999999999999"),
            u32::MAX
        );
    }

    #[test]
    fn media_gate_accepts_listed_types() {
        assert!(cacheable_media_type("text/html"));
        assert!(cacheable_media_type("text/plain; charset=utf-8"));
        assert!(cacheable_media_type("application/json"));
        assert!(cacheable_media_type("Application/JSON"));
        assert!(cacheable_media_type("application/javascript"));
    }

    #[test]
    fn media_gate_accepts_suffix_types() {
        assert!(cacheable_media_type("application/vnd.api+json"));
        assert!(cacheable_media_type("application/atom+xml"));
        assert!(!cacheable_media_type("image/svg+xml"));
    }

    #[test]
    fn media_gate_rejects_everything_else() {
        assert!(!cacheable_media_type("image/png"));
        assert!(!cacheable_media_type("application/octet-stream"));
        assert!(!cacheable_media_type("video/mp4"));
        assert!(!cacheable_media_type("texthtml"));
        assert!(!cacheable_media_type(""));
        assert!(!cacheable_media_type("/"));
    }
}
