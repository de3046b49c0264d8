//! Per-key mutual exclusion with deadlock-free multi-key acquisition
//!
//! The table hands out at most one claim per string key. A set of keys is
//! always claimed in lexicographic order, so two callers asking for
//! overlapping sets can never wait on each other in a cycle.
//!
//! Keys live in the table only while claimed or waited on; releasing the last
//! claim removes the slot, so memory does not grow with historical keys.
//!
//! Release wakes one waiter of that key (parking_lot wakes the longest
//! waiting thread). A caller arriving at that moment may still claim first,
//! so fairness is bounded instead of guaranteed: a waiter gives up after
//! `max_rounds` waits of `round_wait` each and the caller receives
//! [`RepositoryError::KeyLockTimeout`].

use crate::core::config::KeyLockConfig;
use crate::core::error::{RepositoryError, Result};
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Claim state of one key
#[derive(Debug)]
struct Slot {
    held: bool,
    waiters: usize,
    released: Arc<Condvar>,
}

impl Slot {
    fn new() -> Self {
        Slot {
            held: false,
            waiters: 0,
            released: Arc::new(Condvar::new()),
        }
    }
}

type Shard = CachePadded<Mutex<HashMap<String, Slot>>>;

/// Sharded key → claim table
pub struct KeyLockTable {
    shards: Vec<Shard>,
    hasher: ahash::RandomState,
    max_rounds: u32,
    round_wait: Duration,
}

impl KeyLockTable {
    /// Create a table from its configuration
    pub fn new(config: &KeyLockConfig) -> Self {
        let shards = (0..config.shards.max(1))
            .map(|_| CachePadded::new(Mutex::new(HashMap::new())))
            .collect();
        KeyLockTable {
            shards,
            hasher: ahash::RandomState::new(),
            max_rounds: config.max_rounds,
            round_wait: Duration::from_millis(config.round_wait_ms),
        }
    }

    /// Create a table with default settings (10 rounds of 6s)
    pub fn new_default() -> Self {
        Self::new(&KeyLockConfig::default())
    }

    fn shard(&self, key: &str) -> &Shard {
        let idx = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Claim every key of `keys`, blocking until all are held
    ///
    /// Keys are de-duplicated and claimed in sorted order. If any claim
    /// exceeds the contention bound, the keys already claimed are released
    /// before the error is returned.
    pub fn acquire<I, K>(&self, keys: I) -> Result<KeyGuard<'_>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let sorted: BTreeSet<String> = keys.into_iter().map(Into::into).collect();
        let mut guard = KeyGuard {
            table: self,
            keys: Vec::with_capacity(sorted.len()),
        };

        for key in sorted {
            self.claim(&key)?;
            guard.keys.push(key);
        }

        Ok(guard)
    }

    fn claim(&self, key: &str) -> Result<()> {
        let mut slots = self.shard(key).lock();
        let mut rounds = 0u32;

        loop {
            let slot = slots.entry(key.to_string()).or_insert_with(Slot::new);
            if !slot.held {
                slot.held = true;
                return Ok(());
            }

            if rounds >= self.max_rounds {
                warn!("Key lock on '{}' still contended after {} rounds", key, rounds);
                return Err(RepositoryError::KeyLockTimeout {
                    key: key.to_string(),
                    rounds,
                });
            }

            slot.waiters += 1;
            let released = Arc::clone(&slot.released);
            let timed_out = released.wait_for(&mut slots, self.round_wait).timed_out();
            rounds += 1;

            // The slot survives while waiters > 0
            if let Some(slot) = slots.get_mut(key) {
                slot.waiters -= 1;
            }
            if timed_out {
                debug!("Waiting on key '{}' (round {})", key, rounds);
            }
        }
    }

    fn release(&self, key: &str) {
        let mut slots = self.shard(key).lock();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };

        slot.held = false;
        if slot.waiters == 0 {
            slots.remove(key);
        } else {
            slot.released.notify_one();
        }
    }

    /// True if `key` is currently claimed by anyone
    pub fn is_held(&self, key: &str) -> bool {
        self.shard(key)
            .lock()
            .get(key)
            .map_or(false, |slot| slot.held)
    }

    /// Number of live slots (claimed or waited on)
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII claim over a sorted key set; dropping it releases in the same order
pub struct KeyGuard<'a> {
    table: &'a KeyLockTable,
    keys: Vec<String>,
}

impl KeyGuard<'_> {
    /// Held keys, sorted
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn holds(&self, key: &str) -> bool {
        self.keys
            .binary_search_by(|held| held.as_str().cmp(key))
            .is_ok()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        for key in &self.keys {
            self.table.release(key);
        }
    }
}
