//! URL canonicalisation.
//!
//! Every inbound request target is combined with the configured upstream
//! base and reduced to a single canonical form, which serves both as the
//! rewritten origin target and as the input to the cache-key fingerprint.
//! Canonicalisation is idempotent, so equivalent spellings of a URL
//! (`/a?b=1&c=2` vs `/a?c=2&b=1`, stray `..` segments, lowercase vs
//! uppercase escapes) land on the same cache entry on every instance.

use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use url::Url;

use crate::entry::fingerprint;
use crate::error::{Error, Result};

/// Raw-target memoisation capacity. Purely a performance aid; correctness
/// never depends on the memo.
const MEMO_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(n) => n,
    None => unreachable!(),
};

/// The canonical form of one request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canonical {
    /// Absolute canonical URL.
    pub url: String,
    /// Canonical path plus query, used as the rewritten origin target and
    /// the fingerprint input.
    pub target: String,
    /// 64-bit fingerprint of `target`, shared by every proxy instance.
    pub fingerprint: u64,
}

/// Combines inbound request targets with the upstream base and memoises
/// the canonical result.
pub struct Canonicalizer {
    base: String,
    strip_keys: HashSet<String>,
    memo: Mutex<LruCache<String, Canonical>>,
}

impl fmt::Debug for Canonicalizer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Canonicalizer")
            .field("base", &self.base)
            .field("strip_keys", &self.strip_keys)
            .finish_non_exhaustive()
    }
}

impl Canonicalizer {
    /// Builds a canonicaliser for the given upstream base. `http://` is
    /// prefixed when the base carries no scheme; the base itself must parse
    /// as an HTTP URL.
    pub fn new<I, S>(upstream: &str, strip_keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let base = if upstream.contains("://") {
            upstream.to_string()
        } else {
            format!("http://{upstream}")
        };
        let parsed = canonicalize_url(&base, &HashSet::new())?;
        Ok(Self {
            base: parsed.as_str().trim_end_matches('/').to_string(),
            strip_keys: strip_keys.into_iter().map(Into::into).collect(),
            memo: Mutex::new(LruCache::new(MEMO_CAPACITY)),
        })
    }

    /// The canonicalised upstream base URL.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Canonicalises one inbound request target (origin-form path+query).
    pub fn canonicalize(&self, target: &str) -> Result<Canonical> {
        if let Ok(mut memo) = self.memo.lock() {
            if let Some(hit) = memo.get(target) {
                return Ok(hit.clone());
            }
        }
        let url = canonicalize_url(
            &format!("{}{}", self.base, target),
            &self.strip_keys,
        )?;
        let mut path_and_query = url.path().to_string();
        if let Some(query) = url.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        let canonical = Canonical {
            fingerprint: fingerprint(&path_and_query),
            url: url.into(),
            target: path_and_query,
        };
        if let Ok(mut memo) = self.memo.lock() {
            memo.put(target.to_string(), canonical.clone());
        }
        Ok(canonical)
    }
}

/// Normalises a raw absolute URL into its canonical form.
///
/// The parser already lowercases scheme and host, drops the default port
/// and resolves `.`/`..` segments; on top of that duplicate slashes are
/// collapsed, percent escapes are normalised (unreserved octets decoded,
/// everything else uppercased) and query parameters are stably sorted by
/// key with `strip_keys` removed.
pub fn canonicalize_url(raw: &str, strip_keys: &HashSet<String>) -> Result<Url> {
    let mut url = Url::parse(raw)
        .map_err(|e| Error::InvalidUrl(format!("{raw}: {e}")))?;
    if !url.has_host() || !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidUrl(format!("{raw}: not a HTTP URL")));
    }
    let path = normalize_escapes(&collapse_slashes(url.path()));
    url.set_path(&path);
    match url.query().map(|q| normalize_query(q, strip_keys)) {
        Some(q) if !q.is_empty() => url.set_query(Some(&q)),
        _ => url.set_query(None),
    }
    Ok(url)
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut previous_slash = false;
    for c in path.chars() {
        if c == '/' && previous_slash {
            continue;
        }
        previous_slash = c == '/';
        out.push(c);
    }
    out
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

/// Rewrites percent escapes: unreserved octets are decoded, all other
/// escapes get uppercase hex digits. Malformed escapes pass through.
fn normalize_escapes(component: &str) -> String {
    let bytes = component.as_bytes();
    let mut out = String::with_capacity(component.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                let octet = (hi * 16 + lo) as u8;
                if is_unreserved(octet) {
                    out.push(octet as char);
                } else {
                    out.push('%');
                    out.push(char::from_digit(hi, 16)
                        .unwrap_or('0')
                        .to_ascii_uppercase());
                    out.push(char::from_digit(lo, 16)
                        .unwrap_or('0')
                        .to_ascii_uppercase());
                }
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Normalises a raw query string: escapes per parameter, remove-keys
/// stripped by exact match, then a stable sort by key so multi-valued
/// parameters keep their internal order.
fn normalize_query(query: &str, strip_keys: &HashSet<String>) -> String {
    let mut params: Vec<(String, Option<String>)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => {
                (normalize_escapes(k), Some(normalize_escapes(v)))
            }
            None => (normalize_escapes(p), None),
        })
        .filter(|(k, _)| !strip_keys.contains(k))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    params
        .iter()
        .map(|(k, v)| match v {
            Some(v) => format!("{k}={v}"),
            None => k.clone(),
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(raw: &str) -> String {
        canonicalize_url(raw, &HashSet::new()).unwrap().into()
    }

    #[test]
    fn lowercases_and_drops_default_port() {
        assert_eq!(canon("HTTP://Example.COM:80/a"), "http://example.com/a");
        assert_eq!(canon("http://example.com:8080/a"), "http://example.com:8080/a");
    }

    #[test]
    fn resolves_dot_segments_and_duplicate_slashes() {
        assert_eq!(canon("http://h/a/./b/../c"), "http://h/a/c");
        assert_eq!(canon("http://h//a///b"), "http://h/a/b");
    }

    #[test]
    fn normalizes_percent_escapes() {
        assert_eq!(canon("http://h/%7Euser/%2fx"), "http://h/~user/%2Fx");
        assert_eq!(canon("http://h/a?k=%41"), "http://h/a?k=A");
    }

    #[test]
    fn sorts_query_parameters_stably() {
        assert_eq!(canon("http://h/a?b=1&c=2"), canon("http://h/a?c=2&b=1"));
        // Repeated keys keep their internal order.
        assert_eq!(canon("http://h/a?z=9&b=2&b=1"), "http://h/a?b=2&b=1&z=9");
    }

    #[test]
    fn strips_configured_keys() {
        let strip: HashSet<String> = ["utm_source".to_string()].into();
        let url = canonicalize_url("http://h/a?utm_source=x&q=1", &strip).unwrap();
        assert_eq!(String::from(url), "http://h/a?q=1");
        let url = canonicalize_url("http://h/a?utm_source=x", &strip).unwrap();
        assert_eq!(String::from(url), "http://h/a");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for raw in [
            "http://Example.com:80//a/../b?z=1&a=%2f&a=2",
            "http://h/a%41b?x",
            "http://h/?b=1&B=2",
        ] {
            let once = canon(raw);
            assert_eq!(canon(&once), once);
        }
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(canonicalize_url("not a url", &HashSet::new()).is_err());
        assert!(canonicalize_url("mailto:x@y", &HashSet::new()).is_err());
    }

    #[test]
    fn canonicalizer_joins_base_and_target() {
        let canonicalizer = Canonicalizer::new("example.com:8080/api", Vec::<String>::new()).unwrap();
        let canonical = canonicalizer.canonicalize("/users?b=1&a=2").unwrap();
        assert_eq!(canonical.url, "http://example.com:8080/api/users?a=2&b=1");
        assert_eq!(canonical.target, "/api/users?a=2&b=1");
    }

    #[test]
    fn fingerprint_is_stable_under_query_reordering() {
        let canonicalizer = Canonicalizer::new("h", Vec::<String>::new()).unwrap();
        let one = canonicalizer.canonicalize("/a?b=1&c=2").unwrap();
        let two = canonicalizer.canonicalize("/a?c=2&b=1").unwrap();
        assert_eq!(one.fingerprint, two.fingerprint);
        let other = canonicalizer.canonicalize("/a?b=1&c=3").unwrap();
        assert_ne!(one.fingerprint, other.fingerprint);
    }

    #[test]
    fn memoised_lookups_return_the_same_canonical() {
        let canonicalizer = Canonicalizer::new("h", Vec::<String>::new()).unwrap();
        let first = canonicalizer.canonicalize("/memo?x=1").unwrap();
        let second = canonicalizer.canonicalize("/memo?x=1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_upstream_is_rejected() {
        assert!(Canonicalizer::new("://", Vec::<String>::new()).is_err());
        assert!(Canonicalizer::new("", Vec::<String>::new()).is_err());
    }
}
