//! A memcached-backed [`ClusterCache`].
//!
//! Keys are spread over the configured nodes with a consistent-hash ring
//! (virtual nodes over SHA-256 points), so adding or losing a node only
//! perturbs that node's share of the keyspace. Each node gets one lazily
//! connected TCP connection speaking the memcached text protocol, guarded
//! by an async mutex; a connection error drops the socket, emits a
//! [`NodeFailure`] event and surfaces as [`Error::Cache`] so the caller can
//! fall back to treating the key as absent.

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;

use crate::cluster::{ClusterCache, NodeFailure};
use crate::entry::fingerprint;
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const VIRTUAL_NODES: usize = 64;
const FAILURE_CHANNEL_CAPACITY: usize = 64;

struct Node {
    addr: String,
    conn: Mutex<Option<BufStream<TcpStream>>>,
}

/// A consistent-hashing memcached cluster client.
pub struct MemcacheCluster {
    nodes: Vec<Node>,
    ring: Vec<(u64, usize)>,
    events: broadcast::Sender<NodeFailure>,
}

impl fmt::Debug for MemcacheCluster {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemcacheCluster")
            .field("nodes", &self.nodes.iter().map(|n| &n.addr).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Places `VIRTUAL_NODES` points per node on the hash circle.
fn build_ring(addrs: &[String]) -> Vec<(u64, usize)> {
    let mut ring = Vec::with_capacity(addrs.len() * VIRTUAL_NODES);
    for (index, addr) in addrs.iter().enumerate() {
        for replica in 0..VIRTUAL_NODES {
            ring.push((fingerprint(&format!("{addr}#{replica}")), index));
        }
    }
    ring.sort_unstable();
    ring
}

/// First ring point at or after the key's hash, wrapping at the top.
fn ring_lookup(ring: &[(u64, usize)], hash: u64) -> usize {
    match ring.binary_search_by(|(point, _)| point.cmp(&hash)) {
        Ok(at) => ring[at].1,
        Err(insert) if insert == ring.len() => ring[0].1,
        Err(insert) => ring[insert].1,
    }
}

impl MemcacheCluster {
    /// Builds a client for the given `host:port` node addresses.
    pub fn new<I, S>(addrs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let addrs: Vec<String> = addrs.into_iter().map(Into::into).collect();
        if addrs.is_empty() {
            return Err(Error::Cache("no cache nodes configured".to_string()));
        }
        let ring = build_ring(&addrs);
        let (events, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Ok(Self {
            nodes: addrs
                .into_iter()
                .map(|addr| Node { addr, conn: Mutex::new(None) })
                .collect(),
            ring,
            events,
        })
    }

    fn node_for(&self, key: &str) -> &Node {
        &self.nodes[ring_lookup(&self.ring, fingerprint(key))]
    }

    async fn connect(addr: &str) -> io::Result<BufStream<TcpStream>> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(BufStream::new(stream))
    }

    /// Drops the node's connection and broadcasts the failure. Nobody
    /// listening is fine.
    fn declare_down(&self, node: &Node, error: &io::Error) {
        debug!("cache node {} declared down: {error}", node.addr);
        let _ = self.events.send(NodeFailure {
            addr: node.addr.clone(),
            reason: error.to_string(),
        });
    }

    /// Reports the failure and converts it into the caller-facing error.
    fn fail(&self, node: &Node, error: &io::Error) -> Error {
        self.declare_down(node, error);
        Error::Cache(format!("{}: {error}", node.addr))
    }

    async fn ensure<'a>(
        &self,
        node: &Node,
        slot: &'a mut Option<BufStream<TcpStream>>,
    ) -> Result<&'a mut BufStream<TcpStream>> {
        if slot.is_none() {
            match Self::connect(&node.addr).await {
                Ok(conn) => *slot = Some(conn),
                Err(e) => return Err(self.fail(node, &e)),
            }
        }
        slot.as_mut().ok_or_else(|| {
            Error::Cache(format!("{}: connection unavailable", node.addr))
        })
    }
}

fn protocol_error(line: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("unexpected reply: {line}"))
}

async fn read_reply(conn: &mut BufStream<TcpStream>) -> io::Result<String> {
    let mut line = String::new();
    let read = conn.read_line(&mut line).await?;
    if read == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"));
    }
    Ok(line.trim_end().to_string())
}

async fn get_value(
    conn: &mut BufStream<TcpStream>,
    key: &str,
) -> io::Result<Option<Vec<u8>>> {
    conn.write_all(format!("get {key}\r\n").as_bytes()).await?;
    conn.flush().await?;
    let header = read_reply(conn).await?;
    if header == "END" {
        return Ok(None);
    }
    let mut fields = header.split_ascii_whitespace();
    let length = match (fields.next(), fields.nth(2)) {
        (Some("VALUE"), Some(len)) => {
            len.parse::<usize>().map_err(|_| protocol_error(&header))?
        }
        _ => return Err(protocol_error(&header)),
    };
    let mut value = vec![0u8; length + 2];
    conn.read_exact(&mut value).await?;
    value.truncate(length);
    let trailer = read_reply(conn).await?;
    if trailer != "END" {
        return Err(protocol_error(&trailer));
    }
    Ok(Some(value))
}

async fn store_value(
    conn: &mut BufStream<TcpStream>,
    verb: &str,
    key: &str,
    value: &[u8],
    ttl_secs: u32,
) -> io::Result<String> {
    conn.write_all(
        format!("{verb} {key} 0 {ttl_secs} {}\r\n", value.len()).as_bytes(),
    )
    .await?;
    conn.write_all(value).await?;
    conn.write_all(b"\r\n").await?;
    conn.flush().await?;
    read_reply(conn).await
}

async fn delete_value(
    conn: &mut BufStream<TcpStream>,
    key: &str,
) -> io::Result<String> {
    conn.write_all(format!("delete {key}\r\n").as_bytes()).await?;
    conn.flush().await?;
    read_reply(conn).await
}

#[async_trait]
impl ClusterCache for MemcacheCluster {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let node = self.node_for(key);
        let mut guard = node.conn.lock().await;
        let conn = self.ensure(node, &mut *guard).await?;
        match get_value(conn, key).await {
            Ok(value) => Ok(value),
            Err(e) => {
                *guard = None;
                Err(self.fail(node, &e))
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl_secs: u32) -> Result<()> {
        let node = self.node_for(key);
        let mut guard = node.conn.lock().await;
        let conn = self.ensure(node, &mut *guard).await?;
        let reply = match store_value(conn, "set", key, value, ttl_secs).await {
            Ok(reply) => reply,
            Err(e) => {
                *guard = None;
                return Err(self.fail(node, &e));
            }
        };
        match reply.as_str() {
            "STORED" => Ok(()),
            other => {
                *guard = None;
                Err(self.fail(node, &protocol_error(other)))
            }
        }
    }

    async fn add(&self, key: &str, value: &[u8], ttl_secs: u32) -> Result<bool> {
        let node = self.node_for(key);
        let mut guard = node.conn.lock().await;
        let conn = self.ensure(node, &mut *guard).await?;
        let reply = match store_value(conn, "add", key, value, ttl_secs).await {
            Ok(reply) => reply,
            Err(e) => {
                *guard = None;
                return Err(self.fail(node, &e));
            }
        };
        match reply.as_str() {
            "STORED" => Ok(true),
            "NOT_STORED" => Ok(false),
            other => {
                *guard = None;
                Err(self.fail(node, &protocol_error(other)))
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let node = self.node_for(key);
        let mut guard = node.conn.lock().await;
        let conn = self.ensure(node, &mut *guard).await?;
        let reply = match delete_value(conn, key).await {
            Ok(reply) => reply,
            Err(e) => {
                *guard = None;
                return Err(self.fail(node, &e));
            }
        };
        match reply.as_str() {
            "DELETED" | "NOT_FOUND" => Ok(()),
            other => {
                *guard = None;
                Err(self.fail(node, &protocol_error(other)))
            }
        }
    }

    fn failures(&self) -> Option<broadcast::Receiver<NodeFailure>> {
        Some(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("10.0.0.{i}:11211")).collect()
    }

    #[test]
    fn ring_covers_every_node() {
        let nodes = addrs(4);
        let ring = build_ring(&nodes);
        assert_eq!(ring.len(), 4 * VIRTUAL_NODES);
        let mut seen = [false; 4];
        for key in 0..1000u32 {
            seen[ring_lookup(&ring, fingerprint(&format!("key-{key}")))] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn ring_lookup_is_stable() {
        let ring = build_ring(&addrs(3));
        let hash = fingerprint("rampart-42-data");
        assert_eq!(ring_lookup(&ring, hash), ring_lookup(&ring, hash));
    }

    #[test]
    fn removing_a_node_only_moves_its_share() {
        let full = build_ring(&addrs(4));
        let reduced = build_ring(&addrs(3));
        for key in 0..1000u32 {
            let hash = fingerprint(&format!("key-{key}"));
            let before = ring_lookup(&full, hash);
            if before != 3 {
                assert_eq!(ring_lookup(&reduced, hash), before);
            }
        }
    }

    #[test]
    fn empty_node_list_is_rejected() {
        assert!(MemcacheCluster::new(Vec::<String>::new()).is_err());
    }

    // Exercising the wire protocol needs a live memcached; run with
    // `cargo test -- --ignored` against localhost:11211.
    #[ignore]
    #[tokio::test]
    async fn live_round_trip() -> Result<()> {
        let cache = MemcacheCluster::new(["127.0.0.1:11211"])?;
        cache.set("rampart-test-key", b"value", 5).await?;
        assert_eq!(cache.get("rampart-test-key").await?, Some(b"value".to_vec()));
        assert!(!cache.add("rampart-test-key", b"other", 5).await?);
        cache.delete("rampart-test-key").await?;
        assert_eq!(cache.get("rampart-test-key").await?, None);
        Ok(())
    }
}
