//! Report caching with TTL and LRU eviction.
//!
//! Keys fingerprint the model content and the ordered ruleset identity, so
//! any change to either misses naturally. Values are immutable report
//! snapshots. A failing cache backend degrades to recomputation and never
//! fails a validation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use shared_types::{BuildingModel, ComplianceReport, McpFile};
use tracing::warn;

use crate::error::CacheError;

/// Pluggable cache backend. `set` receives the TTL so remote stores can
/// push expiry server-side.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Arc<ComplianceReport>>, CacheError>;
    fn set(
        &self,
        key: &str,
        report: Arc<ComplianceReport>,
        ttl: Duration,
    ) -> Result<(), CacheError>;
    fn delete(&self, key: &str) -> Result<(), CacheError>;
}

struct Entry {
    report: Arc<ComplianceReport>,
    inserted_at: Instant,
    ttl: Duration,
    last_used: u64,
}

struct InMemoryInner {
    entries: HashMap<String, Entry>,
    use_counter: u64,
}

/// Default in-process store: TTL per entry plus LRU eviction at capacity.
pub struct InMemoryStore {
    inner: Mutex<InMemoryInner>,
    capacity: usize,
}

impl InMemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(InMemoryInner {
                entries: HashMap::new(),
                use_counter: 0,
            }),
            capacity: capacity.max(1),
        }
    }
}

impl CacheStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<Arc<ComplianceReport>>, CacheError> {
        let mut inner = self.inner.lock();
        inner.use_counter += 1;
        let counter = inner.use_counter;

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() > entry.ttl,
            None => return Ok(None),
        };
        if expired {
            inner.entries.remove(key);
            return Ok(None);
        }

        let entry = inner
            .entries
            .get_mut(key)
            .ok_or_else(|| CacheError::Unavailable("entry vanished".into()))?;
        entry.last_used = counter;
        Ok(Some(entry.report.clone()))
    }

    fn set(
        &self,
        key: &str,
        report: Arc<ComplianceReport>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        inner.use_counter += 1;
        let counter = inner.use_counter;
        inner.entries.insert(
            key.to_string(),
            Entry {
                report,
                inserted_at: Instant::now(),
                ttl,
                last_used: counter,
            },
        );

        while inner.entries.len() > self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    inner.entries.remove(&k);
                }
                None => break,
            }
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.lock().entries.remove(key);
        Ok(())
    }
}

/// Cache front used by the engine: key derivation, building-level
/// invalidation, and degrade-on-error semantics over a `CacheStore`.
pub struct ReportCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    keys_by_building: Mutex<HashMap<String, HashSet<String>>>,
}

impl ReportCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            keys_by_building: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory(capacity: usize, ttl: Duration) -> Self {
        Self::new(Arc::new(InMemoryStore::new(capacity)), ttl)
    }

    /// SHA-256 over the canonical model JSON and the ordered ruleset
    /// identity. serde_json maps serialize with sorted keys, so the model
    /// fingerprint is stable across runs.
    pub fn key(model: &BuildingModel, rulesets: &[&McpFile]) -> String {
        let mut hasher = Sha256::new();
        match serde_json::to_value(model) {
            Ok(value) => hasher.update(value.to_string().as_bytes()),
            // Serialization of an in-memory model cannot realistically
            // fail; fall back to the id so the key is still usable.
            Err(_) => hasher.update(model.building_id.as_bytes()),
        }
        for file in rulesets {
            hasher.update(b"|");
            hasher.update(file.mcp_id.as_bytes());
            hasher.update(b"@");
            hasher.update(file.version.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<Arc<ComplianceReport>> {
        match self.store.get(key) {
            Ok(hit) => hit,
            Err(e) => {
                warn!(error = %e, "cache get failed, recomputing");
                None
            }
        }
    }

    pub fn put(&self, building_id: &str, key: &str, report: Arc<ComplianceReport>) {
        if let Err(e) = self.store.set(key, report, self.ttl) {
            warn!(error = %e, "cache set failed, continuing uncached");
            return;
        }
        self.keys_by_building
            .lock()
            .entry(building_id.to_string())
            .or_default()
            .insert(key.to_string());
    }

    /// Drop every cached report for one building.
    pub fn invalidate(&self, building_id: &str) {
        let keys = self.keys_by_building.lock().remove(building_id);
        for key in keys.into_iter().flatten() {
            if let Err(e) = self.store.delete(&key) {
                warn!(error = %e, "cache delete failed");
            }
        }
    }
}
