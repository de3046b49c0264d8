//! Write-invalidating resource cache
//!
//! Sits in front of a [`BackingStore`] and shares resource snapshots
//! (`Arc<Resource>`) between threads. Consistency rests on three rules:
//!
//! - A miss is fetched while holding the key lock of its uri, so concurrent
//!   misses on one uri produce a single backing-store fetch.
//! - Every mutation runs inside a [`CacheTxn`] holding the key locks of
//!   everything it may change, including the cached descendants it will evict.
//!   The descendant set is re-scanned after acquisition; if it grew the keys
//!   are released and the plan is retried.
//! - Every eviction bumps a generation counter. A fetch only lands in the
//!   cache if no eviction happened while it was in flight.
//!
//! Hits on an entry with an expired lock count as misses and are refetched.

mod stats;
mod txn;

pub use stats::CacheStats;
pub use txn::CacheTxn;

use crate::core::config::{CacheConfig, EvictionPolicy, KeyLockConfig};
use crate::core::error::{RepositoryError, Result};
use crate::core::keylock::KeyLockTable;
use crate::core::resource::Resource;
use crate::core::store::{inheriting_descendants, BackingStore, StoreError};
use crate::core::uri;
use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use stats::Counters;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Key set of a transaction, resolved against the cache when it begins
#[derive(Debug, Clone, Default)]
pub struct KeyPlan {
    keys: BTreeSet<String>,
    subtrees: Vec<String>,
    inheriting: Vec<String>,
}

impl KeyPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `uri`
    pub fn key(mut self, uri: impl Into<String>) -> Self {
        self.keys.insert(uri.into());
        self
    }

    /// Hold `uri` and every cached descendant of it
    pub fn subtree(mut self, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        self.keys.insert(uri.clone());
        self.subtrees.push(uri);
        self
    }

    /// Hold `uri`, its cached descendants, and every stored descendant
    /// whose ACL is inherited from it
    pub fn inheriting(mut self, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        self.keys.insert(uri.clone());
        self.subtrees.push(uri.clone());
        self.inheriting.push(uri);
        self
    }

    fn first_key(&self) -> String {
        self.keys.iter().next().cloned().unwrap_or_default()
    }
}

struct Entries {
    items: LruCache<String, Arc<Resource>>,
    generation: u64,
}

/// Bounded, key-locked cache of resource snapshots
pub struct ResourceCache<S: BackingStore> {
    store: Arc<S>,
    locks: KeyLockTable,
    entries: Mutex<Entries>,
    config: CacheConfig,
    max_rescans: u32,
    counters: Counters,
}

impl<S: BackingStore> ResourceCache<S> {
    pub fn new(store: Arc<S>, config: &CacheConfig, key_locks: &KeyLockConfig) -> Self {
        ResourceCache {
            store,
            locks: KeyLockTable::new(key_locks),
            entries: Mutex::new(Entries {
                items: LruCache::unbounded(),
                generation: 0,
            }),
            config: config.clone(),
            max_rescans: key_locks.max_rounds.max(1),
            counters: Counters::new(config.statistics),
        }
    }

    /// The backing store behind the cache
    pub fn backing(&self) -> &Arc<S> {
        &self.store
    }

    pub fn key_locks(&self) -> &KeyLockTable {
        &self.locks
    }

    fn lookup(&self, uri: &str) -> Option<Arc<Resource>> {
        let mut entries = self.entries.lock();
        let hit = match self.config.policy {
            EvictionPolicy::Fifo => entries.items.peek(uri),
            EvictionPolicy::Lru => entries.items.get(uri),
        };
        hit.filter(|resource| !resource.has_expired_lock(Utc::now()))
            .cloned()
    }

    /// Load a resource, fetching it under its key lock on a miss
    pub fn load(&self, uri: &str) -> Result<Arc<Resource>> {
        if let Some(hit) = self.lookup(uri) {
            self.counters.hit();
            return Ok(hit);
        }

        let _guard = self.locks.acquire([uri])?;
        self.load_held(uri)
    }

    /// Load the members of a collection
    ///
    /// Members that disappear between listing and loading are skipped.
    pub fn load_children(&self, uri: &str) -> Result<Vec<Arc<Resource>>> {
        let parent = self.load(uri)?;
        let mut children = Vec::with_capacity(parent.children.len());
        for child in &parent.children {
            match self.load(child) {
                Ok(resource) => children.push(resource),
                Err(RepositoryError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(children)
    }

    /// Load with the key of `uri` already held by the caller
    fn load_held(&self, uri: &str) -> Result<Arc<Resource>> {
        if let Some(hit) = self.lookup(uri) {
            self.counters.hit();
            return Ok(hit);
        }

        let generation = self.entries.lock().generation;
        let resource = self.fetch(uri)?;

        let mut entries = self.entries.lock();
        if entries.generation == generation {
            self.insert(&mut entries, uri.to_string(), Arc::clone(&resource));
        } else {
            debug!("Discarding fetch of {} raced by an invalidation", uri);
        }
        Ok(resource)
    }

    /// Load without populating the cache (key not held)
    fn load_through(&self, uri: &str) -> Result<Arc<Resource>> {
        if let Some(hit) = self.lookup(uri) {
            self.counters.hit();
            return Ok(hit);
        }
        self.fetch(uri)
    }

    fn fetch(&self, uri: &str) -> Result<Arc<Resource>> {
        self.counters.miss();
        let mut resource = self
            .store
            .load(uri)?
            .ok_or_else(|| RepositoryError::NotFound(uri.to_string()))?;
        if resource.has_expired_lock(Utc::now()) {
            resource = resource.with_lock(None);
        }
        Ok(Arc::new(resource))
    }

    fn insert(&self, entries: &mut Entries, uri: String, resource: Arc<Resource>) {
        if !entries.items.contains(&uri) && entries.items.len() >= self.config.max_items {
            let remove = self.config.remove_items();
            let mut evicted = 0;
            while evicted < remove && entries.items.pop_lru().is_some() {
                evicted += 1;
            }
            debug!("Cache full, evicted {} entries", evicted);
        }
        entries.items.put(uri, resource);
    }

    /// Replace a cached entry after its key holder stored it
    fn replace(&self, uri: &str, resource: Arc<Resource>) {
        let mut entries = self.entries.lock();
        self.insert(&mut entries, uri.to_string(), resource);
    }

    fn evict(&self, uri: &str) {
        let mut entries = self.entries.lock();
        entries.generation = entries.generation.wrapping_add(1);
        entries.items.pop(uri);
    }

    /// Evict `root` and every cached descendant
    fn evict_subtree(&self, root: &str) -> usize {
        let mut entries = self.entries.lock();
        entries.generation = entries.generation.wrapping_add(1);
        let doomed: Vec<String> = entries
            .items
            .iter()
            .filter(|(key, _)| uri::is_same_or_descendant(key, root))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.items.pop(key);
        }
        doomed.len()
    }

    /// Cached uris strictly below `root`
    pub fn cached_descendants(&self, root: &str) -> Vec<String> {
        self.entries
            .lock()
            .items
            .iter()
            .filter(|(key, _)| uri::is_descendant(key, root))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn resolve(&self, plan: &KeyPlan) -> Result<BTreeSet<String>> {
        let mut keys = plan.keys.clone();
        for root in &plan.subtrees {
            keys.extend(self.cached_descendants(root));
        }
        for root in &plan.inheriting {
            match inheriting_descendants(self.store.as_ref(), root) {
                Ok(found) => keys.extend(found.into_iter().map(|r| r.uri)),
                Err(StoreError::Missing(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(keys)
    }

    /// Begin a transaction holding the keys of `plan`
    ///
    /// If the resolved key set grows while it is being acquired, the keys are
    /// released and acquisition starts over, at most `max_rounds` times.
    pub fn begin(&self, plan: KeyPlan) -> Result<CacheTxn<'_, S>> {
        let mut rounds = 0u32;
        loop {
            let wanted = self.resolve(&plan)?;
            let guard = self.locks.acquire(wanted)?;

            let needed = self.resolve(&plan)?;
            if needed.iter().all(|key| guard.holds(key)) {
                return Ok(CacheTxn::new(self, guard));
            }

            drop(guard);
            rounds += 1;
            if rounds >= self.max_rescans {
                warn!("Key set of {} kept growing after {} rounds", plan.first_key(), rounds);
                return Err(RepositoryError::KeyLockTimeout {
                    key: plan.first_key(),
                    rounds,
                });
            }
            debug!("Key set grew during acquisition, retrying (round {})", rounds);
        }
    }

    /// Begin a transaction on a single key
    pub fn lock(&self, uri: &str) -> Result<CacheTxn<'_, S>> {
        self.begin(KeyPlan::new().key(uri))
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.entries.lock().items.contains(uri)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and reset the statistics
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.generation = entries.generation.wrapping_add(1);
        entries.items.clear();
        self.counters.reset();
    }

    pub fn stats(&self) -> CacheStats {
        let (hits, misses) = self.counters.snapshot();
        CacheStats {
            hits,
            misses,
            len: self.len(),
            capacity: self.config.max_items,
        }
    }
}
