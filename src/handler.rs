//! The request handler: canonicalise, look up, classify, respond.

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{
    CACHE_CONTROL, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
    DATE, ETAG, SERVER,
};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body::Body;
use http_body_util::BodyExt;
use log::{debug, warn};
use url::Url;

use crate::admit::Admitter;
use crate::canonical::{Canonical, Canonicalizer};
use crate::cluster::ClusterCache;
use crate::config::Config;
use crate::entry::{classify, now_millis, Decision, EntryKeys, Lookup, MetaRecord, LOCK_SENTINEL};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::origin::OriginClient;
use crate::{empty, full, BoxError, CacheStatus, ProxyBody, XRAMPART};

/// One proxy instance: stateless apart from the canonicaliser memo and the
/// metrics counters, with all cache state living in the shared cluster.
pub struct Proxy {
    canonicalizer: Canonicalizer,
    cluster: Arc<dyn ClusterCache>,
    origin: OriginClient,
    admitter: Admitter,
    metrics: Arc<Metrics>,
    lock_ttl: u32,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("canonicalizer", &self.canonicalizer)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl Proxy {
    /// Builds a proxy from its configuration and a cache backend.
    pub fn new(
        config: &Config,
        cluster: Arc<dyn ClusterCache>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let canonicalizer =
            Canonicalizer::new(&config.upstream, config.strip_params.clone())?;
        let base = Url::parse(canonicalizer.base())
            .map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let origin = OriginClient::new(&base, config.origin_timeout)?;
        Ok(Self {
            canonicalizer,
            admitter: Admitter::new(cluster.clone(), metrics.clone()),
            cluster,
            origin,
            metrics,
            lock_ttl: config.lock_ttl,
        })
    }

    /// Handles one inbound request. Never fails: errors become 400/502
    /// responses here.
    pub async fn handle<B>(&self, req: Request<B>, peer: IpAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Metrics::bump(&self.metrics.requests);

        // Caching is only semantically safe for GET; everything else is a
        // plain pass-through with no cache interaction.
        if req.method() != Method::GET {
            return self.passthrough(req, peer).await;
        }

        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let canonical = match self.canonicalizer.canonicalize(&target) {
            Ok(canonical) => canonical,
            Err(e) => {
                debug!("rejecting target {target}: {e}");
                return plain_response(StatusCode::BAD_REQUEST, "invalid URL\n");
            }
        };

        let keys = EntryKeys::new(canonical.fingerprint);
        let lookup = self.lookup(&keys).await;
        let now = now_millis();

        match classify(&lookup, now) {
            Decision::Hit => {
                Metrics::bump(&self.metrics.hits);
                self.from_cache(CacheStatus::Hit, &lookup, now)
            }
            Decision::Stale => {
                Metrics::bump(&self.metrics.stales);
                self.from_cache(CacheStatus::Stale, &lookup, now)
            }
            Decision::Update => match self.acquire_lock(&keys).await {
                Some(false) => {
                    // Lost the race; somebody else is already refreshing.
                    Metrics::bump(&self.metrics.stales);
                    self.from_cache(CacheStatus::Stale, &lookup, now)
                }
                holds_lock => {
                    Metrics::bump(&self.metrics.updatings);
                    self.refresh(
                        req,
                        peer,
                        canonical,
                        keys,
                        CacheStatus::Updating,
                        holds_lock == Some(true),
                    )
                    .await
                }
            },
            Decision::Miss => {
                Metrics::bump(&self.metrics.misses);
                self.refresh(req, peer, canonical, keys, CacheStatus::Miss, false)
                    .await
            }
        }
    }

    /// The parallel triple fetch. Individual errors are logged, counted
    /// and folded into absence; so is an undecodable meta record.
    async fn lookup(&self, keys: &EntryKeys) -> Lookup {
        let (data, meta, lock) = futures::join!(
            self.cluster.get(&keys.data),
            self.cluster.get(&keys.meta),
            self.cluster.get(&keys.lock),
        );
        Lookup {
            data: self.tolerate(&keys.data, data),
            meta: self
                .tolerate(&keys.meta, meta)
                .and_then(|bytes| match MetaRecord::decode(&bytes) {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        warn!("undecodable meta at {}: {e}", keys.meta);
                        None
                    }
                }),
            locked: self.tolerate(&keys.lock, lock).is_some(),
        }
    }

    fn tolerate(&self, key: &str, result: Result<Option<Vec<u8>>>) -> Option<Vec<u8>> {
        match result {
            Ok(value) => value,
            Err(e) => {
                Metrics::bump(&self.metrics.cache_errors);
                warn!("cache get {key} failed: {e}");
                None
            }
        }
    }

    /// Best-effort lock acquisition. `Some(won)` when the cache answered,
    /// `None` when it was unreachable (the refresh proceeds regardless).
    async fn acquire_lock(&self, keys: &EntryKeys) -> Option<bool> {
        match self.cluster.add(&keys.lock, LOCK_SENTINEL, self.lock_ttl).await {
            Ok(won) => Some(won),
            Err(e) => {
                Metrics::bump(&self.metrics.cache_errors);
                warn!("lock acquisition at {} failed: {e}", keys.lock);
                None
            }
        }
    }

    /// Synthesises a response from the cached entry.
    fn from_cache(
        &self,
        status: CacheStatus,
        lookup: &Lookup,
        now: u64,
    ) -> Response<ProxyBody> {
        let (Some(data), Some(meta)) = (&lookup.data, &lookup.meta) else {
            // classify() only yields hit/stale with both parts present.
            return plain_response(StatusCode::BAD_GATEWAY, "cache entry vanished\n");
        };
        match synthesize(status, data.clone(), meta, now) {
            Ok(response) => response,
            Err(e) => {
                warn!("cached entry for {} not representable: {e}", meta.url);
                plain_response(StatusCode::BAD_GATEWAY, "bad cache entry\n")
            }
        }
    }

    /// Forwards to the origin and routes the response through the admitter.
    async fn refresh<B>(
        &self,
        req: Request<B>,
        peer: IpAddr,
        canonical: Canonical,
        keys: EntryKeys,
        status: CacheStatus,
        holds_lock: bool,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let outcome = self
            .origin
            .forward(
                Method::GET,
                &canonical.target,
                req.headers(),
                peer,
                empty(),
            )
            .await;
        match outcome {
            Ok(response) => self.admitter.observe(
                keys,
                canonical.url,
                status,
                holds_lock,
                response,
            ),
            Err(e) => {
                Metrics::bump(&self.metrics.origin_errors);
                if holds_lock {
                    if let Err(e) = self.cluster.delete(&keys.lock).await {
                        Metrics::bump(&self.metrics.cache_errors);
                        warn!("lock release failed: {e}");
                    }
                }
                warn!("origin fetch for {} failed: {e}", canonical.url);
                plain_response(StatusCode::BAD_GATEWAY, "origin unavailable\n")
            }
        }
    }

    /// Non-GET requests skip the cache entirely.
    async fn passthrough<B>(&self, req: Request<B>, peer: IpAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Metrics::bump(&self.metrics.misses);
        let (parts, body) = req.into_parts();
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let outcome = self
            .origin
            .forward(
                parts.method.clone(),
                &target,
                &parts.headers,
                peer,
                body.map_err(Into::into).boxed_unsync(),
            )
            .await;
        match outcome {
            Ok(response) => {
                let mut response =
                    response.map(|b| b.map_err(Into::into).boxed_unsync());
                if let Ok(value) = HeaderValue::from_str(&CacheStatus::Miss.to_string()) {
                    response.headers_mut().insert(XRAMPART, value);
                }
                response
            }
            Err(e) => {
                Metrics::bump(&self.metrics.origin_errors);
                warn!("origin fetch for {target} failed: {e}");
                plain_response(StatusCode::BAD_GATEWAY, "origin unavailable\n")
            }
        }
    }
}

/// Builds the synthesised 200 for a cache hit or stale serve.
fn synthesize(
    status: CacheStatus,
    data: Vec<u8>,
    meta: &MetaRecord,
    now: u64,
) -> Result<Response<ProxyBody>> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(DATE, httpdate::fmt_http_date(std::time::SystemTime::now()))
        .header(CONNECTION, "keep-alive")
        .header(CONTENT_TYPE, meta.content_type.as_str())
        .header(CONTENT_LENGTH, data.len())
        .header(XRAMPART, status.to_string());
    if meta.is_fresh(now) {
        let remaining_secs = (meta.expires_at - now + 999) / 1000;
        builder = builder.header(CACHE_CONTROL, format!("max-age={remaining_secs}"));
    }
    if let Some(server) = &meta.server {
        builder = builder.header(SERVER, server.as_str());
    }
    if let Some(encoding) = &meta.content_encoding {
        builder = builder.header(CONTENT_ENCODING, encoding.as_str());
    }
    if let Some(etag) = &meta.etag {
        builder = builder.header(ETAG, etag.as_str());
    }
    Ok(builder.body(full(Bytes::from(data)))?)
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(full(Bytes::from_static(message.as_bytes())))
        .unwrap_or_else(|_| Response::new(empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(expires_at: u64) -> MetaRecord {
        MetaRecord {
            expires_at,
            content_type: "text/html".to_string(),
            server: Some("origin/2".to_string()),
            content_encoding: None,
            etag: Some("\"tag\"".to_string()),
            url: "http://example.com/x".to_string(),
        }
    }

    #[test]
    fn synthesized_hit_carries_remaining_ttl() {
        let now = 10_000;
        let response =
            synthesize(CacheStatus::Hit, b"body".to_vec(), &meta(now + 4_200), now)
                .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get(XRAMPART).unwrap(), "hit");
        assert_eq!(headers.get(CACHE_CONTROL).unwrap(), "max-age=5");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/html");
        assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "4");
        assert_eq!(headers.get(SERVER).unwrap(), "origin/2");
        assert_eq!(headers.get(ETAG).unwrap(), "\"tag\"");
        assert_eq!(headers.get(CONNECTION).unwrap(), "keep-alive");
        assert!(headers.get(DATE).is_some());
    }

    #[test]
    fn synthesized_stale_has_no_cache_control() {
        let now = 10_000;
        let response =
            synthesize(CacheStatus::Stale, b"old".to_vec(), &meta(now - 1), now)
                .unwrap();
        let headers = response.headers();
        assert_eq!(headers.get(XRAMPART).unwrap(), "stale");
        assert!(headers.get(CACHE_CONTROL).is_none());
    }
}
