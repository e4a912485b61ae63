//! Process-wide counters and the optional JSON metrics listener.
//!
//! The counters are the only process-wide mutable state besides the
//! canonicaliser memo; they are plain relaxed atomics, monotonically
//! non-decreasing, reset only by a restart.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http::header::CONTENT_TYPE;
use http::{Request, Response};
use hyper::service::service_fn;
use hyper::{body::Incoming, server::conn::http1};
use hyper_util::rt::TokioIo;
use log::{debug, info};
use serde_json::json;
use tokio::net::TcpListener;

use crate::error::Result;
use crate::{full, ProxyBody};

/// Request-pipeline counters.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Requests received, all methods.
    pub requests: AtomicU64,
    /// Responses served fresh from cache.
    pub hits: AtomicU64,
    /// Expired responses served because another requester held the lock.
    pub stales: AtomicU64,
    /// Requests that took the lock and refreshed from the origin.
    pub updatings: AtomicU64,
    /// Requests forwarded without a usable entry.
    pub misses: AtomicU64,
    /// Origin responses written back to the cache.
    pub admissions: AtomicU64,
    /// Responses rejected for a non-200 status.
    pub rejected_status: AtomicU64,
    /// Responses rejected for a non-cacheable media type.
    pub rejected_media_type: AtomicU64,
    /// Responses rejected because `Cache-Control` yielded no TTL.
    pub rejected_ttl: AtomicU64,
    /// Responses rejected because the body reached the size cap.
    pub rejected_oversize: AtomicU64,
    /// Cache operations that failed and were folded into absence.
    pub cache_errors: AtomicU64,
    /// Origin fetches that failed or timed out.
    pub origin_errors: AtomicU64,
}

impl Metrics {
    /// Creates a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments one counter.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of all counters as the JSON document served by the
    /// metrics listener.
    pub fn snapshot(&self) -> serde_json::Value {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        json!({
            "requests": read(&self.requests),
            "hits": read(&self.hits),
            "stales": read(&self.stales),
            "updatings": read(&self.updatings),
            "misses": read(&self.misses),
            "admissions": read(&self.admissions),
            "rejections": {
                "status": read(&self.rejected_status),
                "media_type": read(&self.rejected_media_type),
                "ttl": read(&self.rejected_ttl),
                "oversize": read(&self.rejected_oversize),
            },
            "cache_errors": read(&self.cache_errors),
            "origin_errors": read(&self.origin_errors),
        })
    }
}

/// Serves the counter document on every request, whatever the path.
pub async fn serve(metrics: Arc<Metrics>, listener: TcpListener) -> Result<()> {
    info!("metrics listening on {}", listener.local_addr()?);
    loop {
        let (stream, _) = listener.accept().await?;
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<Incoming>| {
                let metrics = metrics.clone();
                async move {
                    let body = metrics.snapshot().to_string();
                    Ok::<Response<ProxyBody>, Infallible>(
                        Response::builder()
                            .header(CONTENT_TYPE, "application/json")
                            .body(full(body.into()))
                            .unwrap_or_else(|_| Response::new(full("{}".into()))),
                    )
                }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection error: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_every_counter() {
        let metrics = Metrics::new();
        Metrics::bump(&metrics.requests);
        Metrics::bump(&metrics.requests);
        Metrics::bump(&metrics.hits);
        Metrics::bump(&metrics.rejected_oversize);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["requests"], 2);
        assert_eq!(snapshot["hits"], 1);
        assert_eq!(snapshot["misses"], 0);
        assert_eq!(snapshot["rejections"]["oversize"], 1);
        assert_eq!(snapshot["rejections"]["ttl"], 0);
        assert_eq!(snapshot["cache_errors"], 0);
    }
}
