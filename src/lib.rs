#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
//! A horizontally scalable reverse HTTP proxy that absorbs bursts of
//! duplicated GET traffic by serving cached representations out of a shared
//! memcached cluster.
//!
//! Several stateless proxy instances cooperate through the same cache: under
//! a spike for one URL, a single instance refreshes the entry from the origin
//! while the others keep serving the previous representation. Refresh
//! coordination uses an advisory lock key in the cache itself, so no proxy
//! instance owns any durable state.
//!
//! Per request the pipeline is:
//!
//! ```text
//! canonicalise URL -> fetch data/meta/lock in parallel -> classify
//!     fresh            -> serve from cache        (x-rampart: hit)
//!     expired + lock   -> serve stale             (x-rampart: stale)
//!     expired, no lock -> take lock, fetch origin (x-rampart: updating)
//!     otherwise        -> fetch origin            (x-rampart: miss)
//! ```
//!
//! Origin responses stream straight through to the client; a background task
//! accumulates the body and, when the response is admissible (200, cacheable
//! media type, positive `Cache-Control` TTL, body under 1 MiB), writes the
//! entry back as `data`, then `meta`, then deletes the `lock`.
//!
//! The cache is strictly advisory: no cache failure is ever surfaced to a
//! client, and a cold or partitioned cluster simply degrades the proxy to a
//! pass-through.

pub mod admit;
pub mod canonical;
pub mod cluster;
pub mod config;
pub mod entry;
pub mod error;
pub mod handler;
pub mod managers;
pub mod metrics;
pub mod origin;
pub mod semantics;
pub mod server;

use std::fmt;

use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full};

pub use crate::cluster::ClusterCache;
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::handler::Proxy;
pub use crate::managers::memcached::MemcacheCluster;
pub use crate::managers::memory::MemoryCluster;
pub use crate::metrics::Metrics;

/// `x-rampart` header: set on every cache-pipeline response to one of
/// `hit`, `stale`, `updating` or `miss`.
pub const XRAMPART: &str = "x-rampart";

/// Largest origin body the proxy will cache, exclusive. Bodies of this many
/// bytes or more stream through without being admitted.
pub const MAX_CACHEABLE_BODY: usize = 1_048_576;

/// A boxed error type for HTTP body plumbing.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The response body type produced by the proxy: either buffered cache bytes
/// or a stream relayed from the origin. Unsync because relayed origin
/// bodies are `Send` but not `Sync`.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// How a response was produced, as advertised in the [`XRAMPART`] header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from cache, entry still fresh.
    Hit,
    /// Served the expired entry because another requester holds the
    /// refresh lock.
    Stale,
    /// Entry expired and this requester took the lock; response comes from
    /// the origin.
    Updating,
    /// No usable entry; response comes from the origin.
    Miss,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "hit"),
            Self::Stale => write!(f, "stale"),
            Self::Updating => write!(f, "updating"),
            Self::Miss => write!(f, "miss"),
        }
    }
}

/// A buffered body holding the given bytes.
pub fn full(data: Bytes) -> ProxyBody {
    Full::new(data).map_err(|never| match never {}).boxed_unsync()
}

/// An empty body.
pub fn empty() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}
