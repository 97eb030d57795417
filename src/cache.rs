//! Two-tier cache of derived user type URIs per resource
//!
//! Type information computed inside a transaction must be cheaply
//! re-readable within that transaction without becoming visible to any
//! other transaction before commit. Each non-read-only transaction gets a
//! lazily created session segment; a shared global tier serves everyone.
//! Session segments are merged into the global tier on commit and discarded
//! on rollback.

use crate::config::CacheConfig;
use crate::error::Result;
use crate::resource_id::ResourceId;
use crate::transaction_id::TransactionId;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

/// Supplies the user type URIs for a resource without exposing how the
/// underlying RDF is produced or parsed
pub trait TypeSource {
    fn user_type_uris(&self) -> Vec<String>;
}

/// Global cache entry, stamped for access-based expiry
struct GlobalEntry {
    types: Arc<Vec<String>>,
    last_access: Instant,
}

type SessionSegment = Mutex<LruCache<ResourceId, Arc<Vec<String>>>>;

/// Session + global cache of user types per resource
///
/// Eviction from either tier is transparent: a later `get_user_types`
/// simply re-invokes the loader. Concurrent misses on the same resource may
/// each invoke their loader; the duplicate work is accepted and no
/// single-flight mechanism is used.
pub struct UserTypesCache {
    config: CacheConfig,

    /// Shared tier, bounded and access-expiring
    global: Mutex<LruCache<ResourceId, GlobalEntry>>,

    /// One bounded segment per open non-read-only transaction, created
    /// lazily with an atomic insert-if-absent
    sessions: DashMap<TransactionId, SessionSegment>,
}

impl UserTypesCache {
    pub fn new(config: CacheConfig) -> Self {
        let global_cap = nonzero(config.global_max_entries);
        Self {
            config,
            global: Mutex::new(LruCache::new(global_cap)),
            sessions: DashMap::new(),
        }
    }

    /// Get the user types for a resource as seen by a transaction
    ///
    /// Non-read-only transactions probe their session segment first, fall
    /// back to the global tier, and remember the result in the session
    /// segment either way. The read-only sentinel goes straight to the
    /// global tier. The loader runs at most once per serviced miss.
    pub fn get_user_types<F>(
        &self,
        resource_id: &ResourceId,
        tx_id: &TransactionId,
        loader: F,
    ) -> Result<Arc<Vec<String>>>
    where
        F: FnOnce() -> Result<Vec<String>>,
    {
        if tx_id.is_read_only() {
            return self.get_global(resource_id, loader);
        }

        {
            let segment = self.session_segment(tx_id);
            let mut segment = segment.lock();
            if let Some(types) = segment.get(resource_id) {
                return Ok(types.clone());
            }
        }

        // The segment guard is not held across the loader, which may do I/O
        let types = self.get_global(resource_id, loader)?;
        self.session_segment(tx_id)
            .lock()
            .put(resource_id.clone(), types.clone());
        Ok(types)
    }

    /// Seed the session cache with types computed inside a transaction
    ///
    /// Never touches the global tier, so the value cannot leak to other
    /// transactions before commit. A no-op for the read-only sentinel.
    pub fn cache_user_types(
        &self,
        resource_id: &ResourceId,
        types: Vec<String>,
        tx_id: &TransactionId,
    ) {
        if tx_id.is_read_only() {
            return;
        }

        self.session_segment(tx_id)
            .lock()
            .put(resource_id.clone(), Arc::new(types));
    }

    /// Seed the session cache from an RDF-backed source
    pub fn cache_user_types_from_source(
        &self,
        resource_id: &ResourceId,
        source: &dyn TypeSource,
        tx_id: &TransactionId,
    ) {
        self.cache_user_types(resource_id, source.user_type_uris(), tx_id);
    }

    /// Publish a transaction's session entries to the global tier and
    /// discard the segment. A no-op for the read-only sentinel.
    pub fn merge_session_cache(&self, tx_id: &TransactionId) {
        if tx_id.is_read_only() {
            return;
        }

        if let Some((_, segment)) = self.sessions.remove(tx_id) {
            let mut segment = segment.into_inner();
            let mut global = self.global.lock();
            let now = Instant::now();
            let mut merged = 0usize;
            while let Some((resource_id, types)) = segment.pop_lru() {
                global.put(
                    resource_id,
                    GlobalEntry {
                        types,
                        last_access: now,
                    },
                );
                merged += 1;
            }
            tracing::debug!(
                "Merged {} session cache entries for transaction {}",
                merged,
                tx_id
            );
        }
    }

    /// Discard a transaction's session segment without touching the global
    /// tier. A no-op for the read-only sentinel.
    pub fn drop_session_cache(&self, tx_id: &TransactionId) {
        if tx_id.is_read_only() {
            return;
        }

        if self.sessions.remove(tx_id).is_some() {
            tracing::debug!("Dropped session cache for transaction {}", tx_id);
        }
    }

    fn get_global<F>(&self, resource_id: &ResourceId, loader: F) -> Result<Arc<Vec<String>>>
    where
        F: FnOnce() -> Result<Vec<String>>,
    {
        {
            let mut global = self.global.lock();
            let mut expired = false;
            if let Some(entry) = global.get_mut(resource_id) {
                if entry.last_access.elapsed() <= self.config.global_expiry {
                    entry.last_access = Instant::now();
                    return Ok(entry.types.clone());
                }
                expired = true;
            }
            if expired {
                // Access-expired; treat as a miss
                global.pop(resource_id);
            }
        }

        // The global lock is not held across the loader, which may do I/O.
        // Racing misses can each load; last writer wins in the global tier.
        let types = Arc::new(loader()?);
        self.global.lock().put(
            resource_id.clone(),
            GlobalEntry {
                types: types.clone(),
                last_access: Instant::now(),
            },
        );
        Ok(types)
    }

    fn session_segment(
        &self,
        tx_id: &TransactionId,
    ) -> dashmap::mapref::one::RefMut<'_, TransactionId, SessionSegment> {
        let cap = nonzero(self.config.session_max_entries);
        self.sessions
            .entry(tx_id.clone())
            .or_insert_with(|| Mutex::new(LruCache::new(cap)))
    }
}

/// Capacities are clamped to at least one entry; see `CacheConfig`
fn nonzero(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}
