//! Process configuration.

use std::time::Duration;

use clap::Parser;

/// Command-line options.
#[derive(Debug, Parser)]
#[command(name = "rampart", version, about = "A distributed caching reverse proxy")]
pub struct Args {
    /// Origin base URL as host:port/path; http:// is assumed when no
    /// scheme is given.
    #[arg(long, value_name = "HOST:PORT/PATH")]
    pub upstream: String,

    /// Comma-separated memcached node list.
    #[arg(long, value_name = "H1:P1,H2:P2", default_value = "localhost:11211")]
    pub memcached: String,

    /// Listen port for the reverse proxy.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Start the JSON metrics listener on this port.
    #[arg(long, value_name = "PORT")]
    pub metrics: Option<u16>,

    /// Origin request deadline in seconds.
    #[arg(long = "origin-timeout", value_name = "SECS", default_value_t = 30)]
    pub origin_timeout: u64,

    /// Refresh-lock TTL in seconds; 0 leaves abandoned locks to cache
    /// eviction.
    #[arg(long = "lock-ttl", value_name = "SECS", default_value_t = 30)]
    pub lock_ttl: u32,

    /// Query parameter removed during canonicalisation; repeatable.
    #[arg(long = "strip-param", value_name = "KEY")]
    pub strip_params: Vec<String>,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Origin base URL.
    pub upstream: String,
    /// Cache cluster node addresses.
    pub nodes: Vec<String>,
    /// Proxy listen port.
    pub port: u16,
    /// Metrics listen port, when enabled.
    pub metrics_port: Option<u16>,
    /// Origin request deadline.
    pub origin_timeout: Duration,
    /// Refresh-lock TTL in seconds.
    pub lock_ttl: u32,
    /// Query parameters stripped during canonicalisation.
    pub strip_params: Vec<String>,
}

impl TryFrom<Args> for Config {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> anyhow::Result<Self> {
        let nodes: Vec<String> = args
            .memcached
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        anyhow::ensure!(!nodes.is_empty(), "--memcached names no nodes");
        anyhow::ensure!(!args.upstream.trim().is_empty(), "--upstream is empty");
        Ok(Self {
            upstream: args.upstream,
            nodes,
            port: args.port,
            metrics_port: args.metrics,
            origin_timeout: Duration::from_secs(args.origin_timeout),
            lock_ttl: args.lock_ttl,
            strip_params: args.strip_params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults() {
        let config =
            Config::try_from(args(&["rampart", "--upstream", "origin:3000"])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.nodes, vec!["localhost:11211".to_string()]);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.origin_timeout, Duration::from_secs(30));
        assert_eq!(config.lock_ttl, 30);
        assert!(config.strip_params.is_empty());
    }

    #[test]
    fn node_list_splits_on_commas() {
        let config = Config::try_from(args(&[
            "rampart",
            "--upstream",
            "origin:3000",
            "--memcached",
            "c1:11211, c2:11211,c3:11212",
        ]))
        .unwrap();
        assert_eq!(config.nodes, vec!["c1:11211", "c2:11211", "c3:11212"]);
    }

    #[test]
    fn empty_node_list_is_a_config_error() {
        let parsed = args(&[
            "rampart",
            "--upstream",
            "origin:3000",
            "--memcached",
            " , ",
        ]);
        assert!(Config::try_from(parsed).is_err());
    }

    #[test]
    fn upstream_is_required() {
        assert!(Args::try_parse_from(["rampart"]).is_err());
    }

    #[test]
    fn strip_params_repeat() {
        let config = Config::try_from(args(&[
            "rampart",
            "--upstream",
            "origin:3000",
            "--strip-param",
            "utm_source",
            "--strip-param",
            "utm_campaign",
        ]))
        .unwrap();
        assert_eq!(config.strip_params, vec!["utm_source", "utm_campaign"]);
    }
}
