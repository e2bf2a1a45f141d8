//! A sharded, capacity-bounded LRU cache with pinned handles.
//!
//! Entries are reference counted: the cache itself holds one reference and
//! every outstanding [`CacheHandle`] holds another. Eviction removes an entry
//! from the cache's book-keeping, but its value survives until the last
//! handle drops, so readers never observe a value disappearing under them.
//!
//! The cache is split into 16 shards selected by the top bits of the key
//! hash; each shard takes its own mutex, spreading both lock contention and
//! eviction pressure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::hash::hash32;

const NUM_SHARD_BITS: u32 = 4;
const NUM_SHARDS: usize = 1 << NUM_SHARD_BITS;

const SENTINEL: usize = 0;

// Entries live in a slab indexed by slot number; the LRU list is threaded
// through them with slot indices. Slot 0 is the list sentinel:
// sentinel.prev is the newest entry, sentinel.next the oldest.
struct Entry<V> {
    key: Vec<u8>,
    hash: u32,
    value: Option<Arc<V>>,
    charge: usize,
    refs: u32,
    next: usize,
    prev: usize,
}

impl<V> Entry<V> {
    fn vacant() -> Self {
        Entry {
            key: Vec::new(),
            hash: 0,
            value: None,
            charge: 0,
            refs: 0,
            next: SENTINEL,
            prev: SENTINEL,
        }
    }
}

struct LruShard<V> {
    capacity: usize,
    usage: usize,
    entries: Vec<Entry<V>>,
    free: Vec<usize>,
    table: HashMap<Vec<u8>, usize>,
}

impl<V> LruShard<V> {
    fn new(capacity: usize) -> Self {
        LruShard {
            capacity,
            usage: 0,
            entries: vec![Entry::vacant()],
            free: Vec::new(),
            table: HashMap::new(),
        }
    }

    fn lru_remove(&mut self, slot: usize) {
        let (prev, next) = (self.entries[slot].prev, self.entries[slot].next);
        self.entries[prev].next = next;
        self.entries[next].prev = prev;
    }

    // Makes `slot` the newest entry by threading it just before the
    // sentinel.
    fn lru_append(&mut self, slot: usize) {
        let prev = self.entries[SENTINEL].prev;
        self.entries[slot].prev = prev;
        self.entries[slot].next = SENTINEL;
        self.entries[prev].next = slot;
        self.entries[SENTINEL].prev = slot;
    }

    fn unref(&mut self, slot: usize) {
        let entry = &mut self.entries[slot];
        assert!(entry.refs > 0);
        entry.refs -= 1;
        if entry.refs == 0 {
            self.usage -= entry.charge;
            entry.value = None;
            entry.key = Vec::new();
            entry.charge = 0;
            self.free.push(slot);
        }
    }

    fn alloc_slot(&mut self) -> usize {
        match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.entries.push(Entry::vacant());
                self.entries.len() - 1
            }
        }
    }

    fn lookup(&mut self, key: &[u8], hash: u32) -> Option<(usize, Arc<V>)> {
        let slot = *self.table.get(key)?;
        debug_assert_eq!(self.entries[slot].hash, hash);
        self.entries[slot].refs += 1;
        // Refresh recency.
        self.lru_remove(slot);
        self.lru_append(slot);
        let value = self.entries[slot].value.clone().expect("cached entry has a value");
        Some((slot, value))
    }

    fn insert(&mut self, key: &[u8], hash: u32, value: V, charge: usize) -> (usize, Arc<V>) {
        let value = Arc::new(value);
        let slot = self.alloc_slot();
        {
            let entry = &mut self.entries[slot];
            entry.key = key.to_vec();
            entry.hash = hash;
            entry.value = Some(Arc::clone(&value));
            entry.charge = charge;
            // One reference for the cache, one for the returned handle.
            entry.refs = 2;
        }
        self.lru_append(slot);
        self.usage += charge;

        if let Some(old) = self.table.insert(key.to_vec(), slot) {
            self.lru_remove(old);
            self.unref(old);
        }

        while self.usage > self.capacity && self.entries[SENTINEL].next != SENTINEL {
            let oldest = self.entries[SENTINEL].next;
            self.lru_remove(oldest);
            self.table.remove(&self.entries[oldest].key);
            self.unref(oldest);
        }

        (slot, value)
    }

    fn erase(&mut self, key: &[u8]) {
        if let Some(slot) = self.table.remove(key) {
            self.lru_remove(slot);
            self.unref(slot);
        }
    }

    fn prune(&mut self) {
        // Collect first: unref mutates the list being walked.
        let mut doomed = Vec::new();
        let mut slot = self.entries[SENTINEL].next;
        while slot != SENTINEL {
            if self.entries[slot].refs == 1 {
                doomed.push(slot);
            }
            slot = self.entries[slot].next;
        }
        for slot in doomed {
            self.table.remove(&self.entries[slot].key);
            self.lru_remove(slot);
            self.unref(slot);
        }
    }

    #[cfg(test)]
    fn live_refs(&self) -> u32 {
        self.entries.iter().map(|e| e.refs).sum()
    }
}

/// A pinned reference to a cache entry. The entry cannot be destroyed while
/// the handle is alive; dropping the handle releases the pin.
pub struct CacheHandle<V> {
    shard: Arc<Mutex<LruShard<V>>>,
    slot: usize,
    value: Arc<V>,
}

impl<V> CacheHandle<V> {
    pub fn value(&self) -> &V {
        &self.value
    }

    /// A shared reference to the value that outlives the handle (and any
    /// eviction).
    pub fn value_arc(&self) -> Arc<V> {
        Arc::clone(&self.value)
    }
}

impl<V> Drop for CacheHandle<V> {
    fn drop(&mut self) {
        self.shard.lock().unwrap().unref(self.slot);
    }
}

fn shard_insert<V>(
    shard: &Arc<Mutex<LruShard<V>>>,
    key: &[u8],
    hash: u32,
    value: V,
    charge: usize,
) -> CacheHandle<V> {
    let (slot, value) = shard.lock().unwrap().insert(key, hash, value, charge);
    CacheHandle {
        shard: Arc::clone(shard),
        slot,
        value,
    }
}

fn shard_lookup<V>(
    shard: &Arc<Mutex<LruShard<V>>>,
    key: &[u8],
    hash: u32,
) -> Option<CacheHandle<V>> {
    let (slot, value) = shard.lock().unwrap().lookup(key, hash)?;
    Some(CacheHandle {
        shard: Arc::clone(shard),
        slot,
        value,
    })
}

/// The sharded cache.
pub struct ShardedCache<V> {
    shards: Vec<Arc<Mutex<LruShard<V>>>>,
    last_id: Mutex<u64>,
}

impl<V> ShardedCache<V> {
    /// Creates a cache bounded by `capacity` in caller-defined charge units,
    /// split evenly (rounding up) across the shards.
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        ShardedCache {
            shards: (0..NUM_SHARDS)
                .map(|_| Arc::new(Mutex::new(LruShard::new(per_shard))))
                .collect(),
            last_id: Mutex::new(0),
        }
    }

    fn shard(&self, hash: u32) -> &Arc<Mutex<LruShard<V>>> {
        &self.shards[(hash >> (32 - NUM_SHARD_BITS)) as usize]
    }

    /// Inserts a mapping, evicting old entries as needed to respect the
    /// capacity. Returns a handle pinning the new entry.
    pub fn insert(&self, key: &[u8], value: V, charge: usize) -> CacheHandle<V> {
        let hash = hash32(key, 0);
        shard_insert(self.shard(hash), key, hash, value, charge)
    }

    /// Returns a pinned handle to the entry for `key`, promoting it to
    /// most-recently-used.
    pub fn lookup(&self, key: &[u8]) -> Option<CacheHandle<V>> {
        let hash = hash32(key, 0);
        shard_lookup(self.shard(hash), key, hash)
    }

    /// Drops the entry for `key`. Outstanding handles keep the value alive.
    pub fn erase(&self, key: &[u8]) {
        let hash = hash32(key, 0);
        self.shard(hash).lock().unwrap().erase(key);
    }

    /// Evicts everything not pinned by a handle.
    pub fn prune(&self) {
        for shard in &self.shards {
            shard.lock().unwrap().prune();
        }
    }

    /// Total charge of live entries. Sums the shards one lock at a time.
    pub fn total_charge(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap().usage)
            .sum()
    }

    /// Returns a fresh id. Clients sharing the cache prefix their keys with
    /// an id to partition the key space.
    pub fn new_id(&self) -> u64 {
        let mut last_id = self.last_id.lock().unwrap();
        *last_id += 1;
        *last_id
    }
}
