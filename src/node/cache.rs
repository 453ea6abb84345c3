//! Node cache (C5): an LRU keyed by virtual chunk offset, with
//! byte-weighted eviction and concurrent access via striped locking.
//!
//! Each shard owns a fixed-capacity slab plus an intrusive-style doubly
//! linked list expressed over slab indices — the owned-queue re-expression
//! of the original's `static_lru_cache`, not an intrusive list (see DESIGN
//! NOTES). A cached node is kept alive for the lifetime of any `Arc<Node>`
//! handle a caller holds, independent of eviction.

use std::collections::HashMap;
use std::hash::{Hash as StdHash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk::offset::VirtualChunkOffset;
use crate::node::codec::Node;

const SHARD_COUNT: usize = 16;

struct Entry {
    key: VirtualChunkOffset,
    value: Arc<Node>,
    weight: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// One stripe of the cache: its own slab, free list, LRU order, and lookup
/// index. Guarded by its own lock so unrelated keys never contend.
struct Shard {
    slab: Vec<Option<Entry>>,
    free: Vec<usize>,
    index: HashMap<VirtualChunkOffset, usize>,
    head: Option<usize>, // most recently used
    tail: Option<usize>, // least recently used
    used_bytes: usize,
    max_bytes: usize,
}

impl Shard {
    fn new(max_bytes: usize) -> Self {
        Shard {
            slab: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            used_bytes: 0,
            max_bytes,
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.slab[idx].as_ref().unwrap();
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.slab[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slab[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let e = self.slab[idx].as_mut().unwrap();
            e.prev = None;
            e.next = old_head;
        }
        if let Some(h) = old_head {
            self.slab[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }

    fn evict_until_under_limit(&mut self) {
        while self.used_bytes > self.max_bytes {
            let tail = match self.tail {
                Some(t) => t,
                None => break,
            };
            self.detach(tail);
            let entry = self.slab[tail].take().unwrap();
            self.index.remove(&entry.key);
            self.used_bytes -= entry.weight;
            self.free.push(tail);
        }
    }

    fn insert(&mut self, key: VirtualChunkOffset, value: Arc<Node>) {
        let weight = value.mem_size();
        if let Some(&idx) = self.index.get(&key) {
            let old_weight = self.slab[idx].as_ref().unwrap().weight;
            self.used_bytes = self.used_bytes - old_weight + weight;
            let e = self.slab[idx].as_mut().unwrap();
            e.value = value;
            e.weight = weight;
            self.touch(idx);
            self.evict_until_under_limit();
            return;
        }
        let idx = match self.free.pop() {
            Some(i) => {
                self.slab[i] = Some(Entry {
                    key,
                    value,
                    weight,
                    prev: None,
                    next: None,
                });
                i
            }
            None => {
                self.slab.push(Some(Entry {
                    key,
                    value,
                    weight,
                    prev: None,
                    next: None,
                }));
                self.slab.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
        self.used_bytes += weight;
        self.evict_until_under_limit();
    }

    fn find(&mut self, key: &VirtualChunkOffset) -> Option<Arc<Node>> {
        let idx = *self.index.get(key)?;
        self.touch(idx);
        Some(self.slab[idx].as_ref().unwrap().value.clone())
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn clear(&mut self) {
        self.slab.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        self.used_bytes = 0;
    }
}

/// Memory-bounded node cache keyed by virtual chunk offset.
pub struct NodeCache {
    shards: Vec<Mutex<Shard>>,
    max_bytes: usize,
}

impl NodeCache {
    /// `max_bytes` is the total weight cap across all shards (split evenly).
    pub fn new(max_bytes: usize) -> Self {
        let per_shard = (max_bytes / SHARD_COUNT).max(1);
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(Shard::new(per_shard)))
            .collect();
        NodeCache { shards, max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    fn shard_for(&self, key: &VirtualChunkOffset) -> &Mutex<Shard> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    pub fn insert(&self, key: VirtualChunkOffset, value: Arc<Node>) {
        self.shard_for(&key).lock().insert(key, value);
    }

    pub fn find(&self, key: &VirtualChunkOffset) -> Option<Arc<Node>> {
        self.shard_for(key).lock().find(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for s in &self.shards {
            s.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::offset::ChunkOffset;

    fn key(id: u32) -> VirtualChunkOffset {
        VirtualChunkOffset::new(ChunkOffset::new(id, 4096, 1).unwrap(), 1)
    }

    fn tiny_node() -> Arc<Node> {
        Arc::new(Node::leaf(vec![1, 2], b"v".to_vec()))
    }

    #[test]
    fn insert_and_find_round_trips() {
        let cache = NodeCache::new(1 << 20);
        let k = key(1);
        cache.insert(k, tiny_node());
        assert!(cache.find(&k).is_some());
    }

    #[test]
    fn eviction_respects_byte_cap() {
        // Force every key into the same shard by using a cap small enough
        // that only a couple of nodes fit per shard.
        let cache = NodeCache::new(SHARD_COUNT * 300);
        for i in 0..1000u32 {
            cache.insert(key(i), tiny_node());
        }
        assert!(cache.len() < 1000, "cache should have evicted some entries");
    }

    #[test]
    fn lookup_keeps_entry_alive_against_eviction_pressure() {
        let cache = NodeCache::new(SHARD_COUNT * 400);
        let k = key(0);
        cache.insert(k, tiny_node());
        let handle = cache.find(&k).unwrap();
        for i in 1..2000u32 {
            cache.insert(key(i), tiny_node());
        }
        // The Arc handle keeps the node data alive even though the cache
        // entry itself may have been evicted.
        assert_eq!(handle.value, Some(b"v".to_vec()));
    }
}
