use std::fmt;
use std::mem::size_of;

use ahash::RandomState;
use parking_lot::Mutex;

use crate::DelayKey;
use crate::DelayStore;
use crate::Merge;
use crate::StoreError;

/// Default arena size: 4 MiB.
pub const DEFAULT_ARENA_SIZE: usize = 4 * 1024 * 1024;

const MIN_BUCKETS: usize = 16;

type NodeId = u32;

const NIL: NodeId = NodeId::MAX;

#[derive(Clone, Copy)]
struct Node {
    key: DelayKey,
    next_allowed: u64,
    next: NodeId,
}

/// Bytes charged against the arena for every live entry.
pub const NODE_SIZE: usize = size_of::<Node>();

const BUCKET_SIZE: usize = size_of::<NodeId>();

/// Fixed byte budget carved into node slots and a single bucket table.
struct Arena {
    capacity: usize,
    used: usize,
    nodes: Vec<Node>,
    free: Vec<NodeId>,
}

impl Arena {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            nodes: Vec::with_capacity(capacity / NODE_SIZE),
            free: Vec::new(),
        }
    }

    fn reserve(&mut self, bytes: usize) -> Result<(), StoreError> {
        if self.used + bytes > self.capacity {
            return Err(StoreError::ArenaExhausted {
                capacity: self.capacity,
            });
        }
        self.used += bytes;
        Ok(())
    }

    fn alloc_node(&mut self, node: Node) -> Result<NodeId, StoreError> {
        self.reserve(NODE_SIZE)?;
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id as usize] = node;
                id
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as NodeId
            }
        };
        Ok(id)
    }

    fn free_node(&mut self, id: NodeId) {
        self.free.push(id);
        self.used -= NODE_SIZE;
    }

    fn alloc_table(&mut self, buckets: usize) -> Result<Box<[NodeId]>, StoreError> {
        self.reserve(buckets * BUCKET_SIZE)?;
        Ok(vec![NIL; buckets].into_boxed_slice())
    }

    fn free_table(&mut self, table: Box<[NodeId]>) {
        self.used -= table.len() * BUCKET_SIZE;
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id as usize]
    }
}

/// Intrusive chained hash table whose nodes and buckets live in an [`Arena`].
///
/// The bucket table only exists while the map holds entries. It is allocated
/// on the empty to non-empty transition and released when the last entry is
/// evicted.
struct ArenaMap {
    arena: Arena,
    table: Option<Box<[NodeId]>>,
    buckets: usize,
    entries: usize,
    cursor: usize,
}

impl ArenaMap {
    fn with_buckets(capacity: usize, buckets: usize) -> Self {
        debug_assert!(buckets.is_power_of_two());
        Self {
            arena: Arena::new(capacity),
            table: None,
            buckets,
            entries: 0,
            cursor: 0,
        }
    }

    fn bucket(&self, hash: u64) -> usize {
        hash as usize & (self.buckets - 1)
    }

    fn find(&self, key: &DelayKey, hash: u64) -> Option<NodeId> {
        let table = self.table.as_ref()?;
        let mut id = table[self.bucket(hash)];
        while id != NIL {
            let node = self.arena.node(id);
            if node.key == *key {
                return Some(id);
            }
            id = node.next;
        }
        None
    }

    fn get(&self, key: &DelayKey, hash: u64) -> Option<u64> {
        self.find(key, hash)
            .map(|id| self.arena.node(id).next_allowed)
    }

    fn upsert_max(&mut self, key: &DelayKey, hash: u64, ts: u64) -> Result<Merge, StoreError> {
        if let Some(id) = self.find(key, hash) {
            let node = self.arena.node_mut(id);
            let previous = node.next_allowed;
            if ts > previous {
                node.next_allowed = ts;
                return Ok(Merge::Raised { previous });
            }
            return Ok(Merge::Unchanged { current: previous });
        }

        // Phase one: reserve everything the insert needs without touching
        // the published table.
        let fresh = self.table.is_none();
        let mut table = match self.table.take() {
            Some(table) => table,
            None => self.arena.alloc_table(self.buckets)?,
        };
        let node = Node {
            key: *key,
            next_allowed: ts,
            next: NIL,
        };
        let id = match self.arena.alloc_node(node) {
            Ok(id) => id,
            Err(err) => {
                if fresh {
                    // Roll back to the clean "no entries" state.
                    self.arena.free_table(table);
                } else {
                    self.table = Some(table);
                }
                return Err(err);
            }
        };

        // Phase two: link and publish.
        let bucket = self.bucket(hash);
        self.arena.node_mut(id).next = table[bucket];
        table[bucket] = id;
        self.table = Some(table);
        self.entries += 1;
        Ok(Merge::Inserted)
    }

    fn evict_expired(&mut self, now: u64, max_batch: usize) -> usize {
        if max_batch == 0 {
            return 0;
        }
        let Some(table) = self.table.as_mut() else {
            return 0;
        };

        let mask = self.buckets - 1;
        let mut removed = 0;
        let mut resume = None;

        'scan: for step in 0..self.buckets {
            let bucket = (self.cursor + step) & mask;
            let mut prev = NIL;
            let mut id = table[bucket];
            while id != NIL {
                if removed == max_batch {
                    resume = Some(bucket);
                    break 'scan;
                }
                let node = *self.arena.node(id);
                if node.next_allowed < now {
                    if prev == NIL {
                        table[bucket] = node.next;
                    } else {
                        self.arena.node_mut(prev).next = node.next;
                    }
                    self.arena.free_node(id);
                    removed += 1;
                } else {
                    prev = id;
                }
                id = node.next;
            }
        }

        if let Some(bucket) = resume {
            self.cursor = bucket;
        }
        self.entries -= removed;
        if self.entries == 0
            && let Some(table) = self.table.take()
        {
            self.arena.free_table(table);
            self.cursor = 0;
        }
        removed
    }
}

/// [`DelayStore`] backed by a fixed-size arena guarded by a single mutex.
///
/// Capacity is fixed at construction. When the arena is full new keys are
/// refused with [`StoreError::ArenaExhausted`] while existing keys can still
/// be raised and evicted.
pub struct ArenaDelayStore {
    map: Mutex<ArenaMap>,
    hasher: RandomState,
    capacity: usize,
}

impl ArenaDelayStore {
    /// Creates a store with the default 4 MiB arena.
    pub fn new() -> Self {
        // The default arena always holds the table plus many entries.
        Self::build(DEFAULT_ARENA_SIZE, Self::buckets_for(DEFAULT_ARENA_SIZE))
    }

    /// Creates a store whose nodes and bucket table share `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ArenaTooSmall`] if the arena cannot hold the
    /// bucket table and at least one entry.
    pub fn with_arena_size(capacity: usize) -> Result<Self, StoreError> {
        let buckets = Self::buckets_for(capacity);
        let required = buckets * BUCKET_SIZE + NODE_SIZE;
        if capacity < required {
            return Err(StoreError::ArenaTooSmall { capacity, required });
        }
        Ok(Self::build(capacity, buckets))
    }

    fn buckets_for(capacity: usize) -> usize {
        let expected = (capacity / NODE_SIZE).max(1);
        (expected.next_power_of_two() / 2).max(MIN_BUCKETS)
    }

    fn build(capacity: usize, buckets: usize) -> Self {
        Self {
            map: Mutex::new(ArenaMap::with_buckets(capacity, buckets)),
            hasher: RandomState::new(),
            capacity,
        }
    }

    /// Arena size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently charged against the arena.
    pub fn used_bytes(&self) -> usize {
        self.map.lock().arena.used
    }
}

impl Default for ArenaDelayStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ArenaDelayStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaDelayStore")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl DelayStore for ArenaDelayStore {
    fn get(&self, key: &DelayKey) -> Option<u64> {
        let hash = self.hasher.hash_one(key);
        self.map.lock().get(key, hash)
    }

    fn upsert_max(&self, key: &DelayKey, ts: u64) -> Result<Merge, StoreError> {
        let hash = self.hasher.hash_one(key);
        self.map.lock().upsert_max(key, hash, ts)
    }

    fn evict_expired(&self, now: u64, max_batch: usize) -> usize {
        self.map.lock().evict_expired(now, max_batch)
    }

    fn len(&self) -> usize {
        self.map.lock().entries
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use more_asserts::assert_le;

    use super::*;

    fn key(identifier: &str) -> DelayKey {
        DelayKey::new("api", identifier).unwrap()
    }

    #[test]
    fn it_merges_with_max() {
        let store = ArenaDelayStore::new();
        let k = key("1.2.3.4");

        assert_eq!(store.get(&k), None);
        assert_eq!(store.upsert_max(&k, 200), Ok(Merge::Inserted));
        assert_eq!(
            store.upsert_max(&k, 100),
            Ok(Merge::Unchanged { current: 200 })
        );
        assert_eq!(
            store.upsert_max(&k, 300),
            Ok(Merge::Raised { previous: 200 })
        );
        assert_eq!(store.get(&k), Some(300));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_colliding_keys_share_a_bucket() {
        // Force every key into the same chain.
        let mut map = ArenaMap::with_buckets(DEFAULT_ARENA_SIZE, MIN_BUCKETS);
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            map.upsert_max(&key(id), 7, 100 + i as u64).unwrap();
        }
        assert_eq!(map.get(&key("a"), 7), Some(100));
        assert_eq!(map.get(&key("d"), 7), Some(103));

        // Unlink from the middle of the chain.
        assert_eq!(map.evict_expired(102, 10), 2);
        assert_eq!(map.get(&key("a"), 7), None);
        assert_eq!(map.get(&key("b"), 7), None);
        assert_eq!(map.get(&key("c"), 7), Some(102));
        assert_eq!(map.get(&key("d"), 7), Some(103));
        assert_eq!(map.entries, 2);
    }

    #[test]
    fn test_eviction_respects_batch_and_expiry() {
        let store = ArenaDelayStore::new();
        for i in 0..250u64 {
            store.upsert_max(&key(&format!("expired-{i}")), i).unwrap();
        }
        for i in 0..10u64 {
            store
                .upsert_max(&key(&format!("live-{i}")), 1_000 + i)
                .unwrap();
        }

        assert_eq!(store.evict_expired(1_000, 100), 100);
        assert_eq!(store.evict_expired(1_000, 100), 100);
        assert_eq!(store.evict_expired(1_000, 100), 50);
        assert_eq!(store.evict_expired(1_000, 100), 0);

        // `next_allowed == now` is not expired.
        assert_eq!(store.len(), 10);
        assert_eq!(store.get(&key("live-0")), Some(1_000));
    }

    #[test]
    fn test_table_is_released_when_empty() {
        let store = ArenaDelayStore::with_arena_size(64 * 1024).unwrap();
        assert_eq!(store.used_bytes(), 0);

        store.upsert_max(&key("x"), 10).unwrap();
        assert!(store.used_bytes() > NODE_SIZE);

        assert_eq!(store.evict_expired(11, 100), 1);
        assert_eq!(store.used_bytes(), 0);
        assert!(store.is_empty());

        // And the next insert rebuilds it.
        assert_eq!(store.upsert_max(&key("x"), 20), Ok(Merge::Inserted));
        assert_eq!(store.get(&key("x")), Some(20));
    }

    #[test]
    fn test_exhaustion_keeps_existing_entries() {
        let capacity = MIN_BUCKETS * BUCKET_SIZE + 3 * NODE_SIZE;
        assert_eq!(ArenaDelayStore::buckets_for(capacity), MIN_BUCKETS);
        let store = ArenaDelayStore::with_arena_size(capacity).unwrap();

        for id in ["a", "b", "c"] {
            store.upsert_max(&key(id), 50).unwrap();
        }
        assert_eq!(
            store.upsert_max(&key("d"), 50),
            Err(StoreError::ArenaExhausted { capacity })
        );

        // Existing keys can still be raised in place.
        assert_eq!(
            store.upsert_max(&key("a"), 60),
            Ok(Merge::Raised { previous: 50 })
        );
        assert_eq!(store.len(), 3);
        assert_eq!(store.get(&key("d")), None);

        // Eviction frees a slot for the refused key.
        store.evict_expired(55, 1);
        assert_eq!(store.upsert_max(&key("d"), 70), Ok(Merge::Inserted));
    }

    #[test]
    fn test_failed_first_insert_rolls_back_table() {
        // Room for the table but not for a node.
        let table_bytes = MIN_BUCKETS * BUCKET_SIZE;
        let mut map = ArenaMap::with_buckets(table_bytes + NODE_SIZE - 1, MIN_BUCKETS);

        let err = map.upsert_max(&key("x"), 1, 10).unwrap_err();
        assert!(matches!(err, StoreError::ArenaExhausted { .. }));
        assert!(map.table.is_none());
        assert_eq!(map.arena.used, 0);
        assert_eq!(map.entries, 0);
        assert_eq!(map.get(&key("x"), 1), None);
        assert_eq!(map.evict_expired(u64::MAX, 100), 0);
    }

    #[test]
    fn test_too_small_arena_is_refused() {
        assert!(matches!(
            ArenaDelayStore::with_arena_size(NODE_SIZE),
            Err(StoreError::ArenaTooSmall { .. })
        ));
    }

    #[test]
    fn test_concurrent_updates_keep_maximum() {
        let store = Arc::new(ArenaDelayStore::new());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..1_000u64 {
                        store.upsert_max(&key("shared"), t * 1_000 + i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.get(&key("shared")), Some(7_999));
        assert_eq!(store.len(), 1);
        assert_le!(store.used_bytes(), store.capacity());
    }
}
