//! Observes origin responses, relays them to the client and writes
//! admissible ones back to the cache.
//!
//! A response is admitted when its status is exactly 200, its
//! `Content-Type` passes the media gate, its `Cache-Control` yields a
//! positive TTL and the body stays under the size cap. The body is relayed
//! frame by frame through a channel while a spawned task accumulates it;
//! the task always drains the origin to end-of-stream, so a client that
//! disconnects mid-transfer cannot prevent the write-back other instances
//! are waiting on.

use std::sync::Arc;

use bytes::Bytes;
use futures::channel::mpsc;
use http::header::{CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE, ETAG, SERVER};
use http::{HeaderValue, Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Incoming;
use log::{debug, warn};

use crate::cluster::ClusterCache;
use crate::entry::{now_millis, EntryKeys, MetaRecord};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::semantics::{cacheable_media_type, ttl_from_cache_control};
use crate::{BoxError, CacheStatus, ProxyBody, MAX_CACHEABLE_BODY, XRAMPART};

type FrameResult = std::result::Result<http_body::Frame<Bytes>, BoxError>;

/// Applies the admission policy to forwarded origin responses and builds
/// the responses streamed back to clients.
pub struct Admitter {
    cluster: Arc<dyn ClusterCache>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Admitter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Admitter").finish_non_exhaustive()
    }
}

impl Admitter {
    /// Builds an admitter over the shared cache and counters.
    pub fn new(cluster: Arc<dyn ClusterCache>, metrics: Arc<Metrics>) -> Self {
        Self { cluster, metrics }
    }

    /// Tags and relays an origin response, spawning the accumulate-and-admit
    /// task when the header-level predicate holds.
    pub fn observe(
        &self,
        keys: EntryKeys,
        canonical_url: String,
        status: CacheStatus,
        holds_lock: bool,
        response: Response<Incoming>,
    ) -> Response<ProxyBody> {
        let (mut parts, body) = response.into_parts();
        if let Ok(value) = HeaderValue::from_str(&status.to_string()) {
            parts.headers.insert(XRAMPART, value);
        }

        let content_type = header_string(parts.headers.get(CONTENT_TYPE));
        let ttl = parts
            .headers
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .map(ttl_from_cache_control);

        let eligible = if parts.status != StatusCode::OK {
            Metrics::bump(&self.metrics.rejected_status);
            false
        } else if !content_type.as_deref().is_some_and(cacheable_media_type) {
            Metrics::bump(&self.metrics.rejected_media_type);
            false
        } else if ttl.unwrap_or(0) == 0 {
            Metrics::bump(&self.metrics.rejected_ttl);
            false
        } else {
            true
        };

        if !eligible {
            return Response::from_parts(
                parts,
                body.map_err(Into::into).boxed_unsync(),
            );
        }

        let meta = MetaRecord {
            // Fixed at write-back time, filled in once the body is complete.
            expires_at: 0,
            content_type: content_type.unwrap_or_default(),
            server: header_string(parts.headers.get(SERVER)),
            content_encoding: header_string(parts.headers.get(CONTENT_ENCODING)),
            etag: header_string(parts.headers.get(ETAG)),
            url: canonical_url,
        };
        let (tx, rx) = mpsc::unbounded::<FrameResult>();
        self.spawn_relay(body, tx, keys, meta, ttl.unwrap_or(0), holds_lock);
        Response::from_parts(parts, StreamBody::new(rx).boxed_unsync())
    }

    fn spawn_relay(
        &self,
        mut body: Incoming,
        tx: mpsc::UnboundedSender<FrameResult>,
        keys: EntryKeys,
        mut meta: MetaRecord,
        ttl_secs: u32,
        holds_lock: bool,
    ) {
        let cluster = self.cluster.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            let mut total: usize = 0;
            let mut oversize = false;
            let mut client_gone = false;

            while let Some(next) = body.frame().await {
                let frame = match next {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("origin stream for {} failed: {e}", meta.url);
                        Metrics::bump(&metrics.origin_errors);
                        if !client_gone {
                            let _ = tx.unbounded_send(Err(Box::new(e)));
                        }
                        if holds_lock {
                            if let Err(e) = cluster.delete(&keys.lock).await {
                                Metrics::bump(&metrics.cache_errors);
                                warn!("lock release failed: {e}");
                            }
                        }
                        return;
                    }
                };
                if let Some(data) = frame.data_ref() {
                    total = total.saturating_add(data.len());
                    if !oversize && total >= MAX_CACHEABLE_BODY {
                        oversize = true;
                        Metrics::bump(&metrics.rejected_oversize);
                        buffer = Vec::new();
                    } else if !oversize {
                        buffer.extend_from_slice(data);
                    }
                }
                if !client_gone && tx.unbounded_send(Ok(frame)).is_err() {
                    debug!("client left before origin finished; still admitting");
                    client_gone = true;
                }
            }
            drop(tx);

            if oversize {
                return;
            }
            meta.expires_at = now_millis() + u64::from(ttl_secs) * 1000;
            if let Err(e) = write_back(&*cluster, &keys, &buffer, &meta).await {
                Metrics::bump(&metrics.cache_errors);
                warn!("write-back for {} failed: {e}", meta.url);
                return;
            }
            Metrics::bump(&metrics.admissions);
        });
    }
}

/// The write-back sequence. Order is fixed: data, then meta, then the lock
/// delete; the first failure aborts the rest so a fresher meta can never
/// point at an unwritten body.
async fn write_back(
    cluster: &dyn ClusterCache,
    keys: &EntryKeys,
    body: &[u8],
    meta: &MetaRecord,
) -> Result<()> {
    cluster.set(&keys.data, body, 0).await?;
    cluster.set(&keys.meta, &meta.encode()?, 0).await?;
    cluster.delete(&keys.lock).await?;
    Ok(())
}

fn header_string(value: Option<&HeaderValue>) -> Option<String> {
    value.and_then(|v| v.to_str().ok()).map(str::to_string)
}
