//! An in-process [`ClusterCache`] backend.
//!
//! Used by the test suite and handy for single-instance development runs
//! where no memcached cluster is available. Entries honour per-key TTLs
//! but there is no eviction pressure beyond that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::cluster::ClusterCache;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| at > Instant::now())
    }
}

/// Implements [`ClusterCache`] with a mutex-guarded in-process map.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    store: Arc<Mutex<HashMap<String, Slot>>>,
}

impl MemoryCluster {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(value: &[u8], ttl_secs: u32) -> Slot {
        Slot {
            value: value.to_vec(),
            expires_at: (ttl_secs > 0)
                .then(|| Instant::now() + Duration::from_secs(u64::from(ttl_secs))),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Slot>>> {
        self.store
            .lock()
            .map_err(|_| Error::Cache("memory store poisoned".to_string()))
    }

    /// Number of live entries. Test helper.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.values().filter(|e| e.live()).count()).unwrap_or(0)
    }

    /// Whether the backend holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ClusterCache for MemoryCluster {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut store = self.lock()?;
        match store.get(key) {
            Some(slot) if slot.live() => Ok(Some(slot.value.clone())),
            Some(_) => {
                store.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl_secs: u32) -> Result<()> {
        self.lock()?.insert(key.to_string(), Self::slot(value, ttl_secs));
        Ok(())
    }

    async fn add(&self, key: &str, value: &[u8], ttl_secs: u32) -> Result<bool> {
        let mut store = self.lock()?;
        if store.get(key).is_some_and(Slot::live) {
            return Ok(false);
        }
        store.insert(key.to_string(), Self::slot(value, ttl_secs));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}
