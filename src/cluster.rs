//! The interface the proxy core consumes from the distributed cache.
//!
//! Keys are opaque strings, values opaque byte sequences. Every operation
//! is best-effort: callers treat a failed `get` as absence and a failed
//! write as a logged no-op, because the cache is strictly advisory.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

/// Emitted when a cluster node is declared down.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    /// Address of the failed node.
    pub addr: String,
    /// Human-readable cause.
    pub reason: String,
}

/// Shared cache operations used by the request handler and the admitter.
///
/// Implementations distribute keys across nodes (by consistent hashing, so
/// membership changes perturb a minimal fraction of keys) and surface
/// network errors instead of hiding them; the policy of tolerating those
/// errors lives with the caller.
#[async_trait]
pub trait ClusterCache: Send + Sync {
    /// Fetches a value. `Ok(None)` means the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores a value. A `ttl_secs` of 0 leaves expiry to the cache's
    /// default eviction.
    async fn set(&self, key: &str, value: &[u8], ttl_secs: u32) -> Result<()>;

    /// Stores a value only when the key does not already exist. Returns
    /// whether this caller won the write.
    async fn add(&self, key: &str, value: &[u8], ttl_secs: u32) -> Result<bool>;

    /// Removes a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Subscribes to node-failure events, when the backend reports them.
    fn failures(&self) -> Option<broadcast::Receiver<NodeFailure>> {
        None
    }
}
