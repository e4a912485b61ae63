//! Forwarding requests to the origin service.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST,
    TRANSFER_ENCODING, UPGRADE,
};
use http::{Method, Request, Response, Uri};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use log::warn;
use tokio::time::timeout;
use url::Url;

use crate::error::{Error, Result};
use crate::ProxyBody;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Hop-by-hop and recomputed headers never copied towards the origin.
const SKIPPED_REQUEST_HEADERS: &[HeaderName] =
    &[HOST, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE];

/// A pooled HTTP client pinned to one origin authority.
pub struct OriginClient {
    client: Client<HttpConnector, ProxyBody>,
    authority: String,
    timeout: Duration,
}

impl fmt::Debug for OriginClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OriginClient")
            .field("authority", &self.authority)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OriginClient {
    /// Builds a client for the origin named by the canonical upstream base.
    pub fn new(base: &Url, timeout: Duration) -> Result<Self> {
        let host = base
            .host_str()
            .ok_or_else(|| Error::InvalidUrl("upstream has no host".to_string()))?;
        let authority = match base.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            authority,
            timeout,
        })
    }

    /// The `host[:port]` the client talks to.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Forwards one request, preserving the rewritten target.
    ///
    /// The outgoing request carries the inbound headers minus hop-by-hop
    /// ones, `Host` pinned to the origin and the client address appended to
    /// `X-Forwarded-For`. The response body streams back as it arrives.
    pub async fn forward(
        &self,
        method: Method,
        target: &str,
        inbound: &HeaderMap,
        peer: IpAddr,
        body: ProxyBody,
    ) -> Result<Response<Incoming>> {
        let uri: Uri = format!("http://{}{}", self.authority, target).parse()?;
        let mut request = Request::builder().method(method).uri(uri).body(body)?;

        let headers = request.headers_mut();
        for (name, value) in inbound {
            if SKIPPED_REQUEST_HEADERS.contains(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if let Ok(host) = HeaderValue::from_str(&self.authority) {
            headers.insert(HOST, host);
        }
        let forwarded = match inbound.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {peer}"),
            None => peer.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, value);
        }

        match timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                warn!("origin {} failed: {e}", self.authority);
                Err(Error::OriginUnreachable(e.to_string()))
            }
            Err(_) => {
                warn!("origin {} timed out after {:?}", self.authority, self.timeout);
                Err(Error::OriginTimeout(self.timeout))
            }
        }
    }
}
