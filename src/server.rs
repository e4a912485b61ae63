//! The proxy's accept loop.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, info};
use tokio::net::TcpListener;

use crate::error::Result;
use crate::handler::Proxy;

/// Serves the proxy on an already-bound listener until ctrl-c.
///
/// Each connection runs on its own task, so no request's IO wait can stall
/// another; hyper keeps connections alive between requests.
pub async fn run(proxy: Arc<Proxy>, listener: TcpListener) -> Result<()> {
    info!("proxy listening on {}", listener.local_addr()?);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let proxy = proxy.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let proxy = proxy.clone();
                        async move {
                            Ok::<_, Infallible>(proxy.handle(req, peer.ip()).await)
                        }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!("connection from {peer} ended: {e}");
                    }
                });
            }
        }
    }
}
