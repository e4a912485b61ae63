use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio::net::TcpListener;

use rampart::config::{Args, Config};
use rampart::{metrics, server, ClusterCache, MemcacheCluster, Metrics, Proxy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let config = Config::try_from(Args::parse())?;
    let metrics = Arc::new(Metrics::new());
    let cluster: Arc<dyn ClusterCache> =
        Arc::new(MemcacheCluster::new(config.nodes.clone())?);
    let proxy = Arc::new(Proxy::new(&config, cluster.clone(), metrics.clone())?);

    if let Some(mut failures) = cluster.failures() {
        tokio::spawn(async move {
            while let Ok(failure) = failures.recv().await {
                warn!("cache node {} down: {}", failure.addr, failure.reason);
            }
        });
    }

    if let Some(port) = config.metrics_port {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding metrics port {port}"))?;
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(metrics, listener).await {
                warn!("metrics listener stopped: {e}");
            }
        });
    }

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding proxy port {}", config.port))?;
    info!("forwarding to {}", config.upstream);
    server::run(proxy, listener).await?;
    Ok(())
}
