//! `BlockCache` — a fixed-capacity LRU over fixed-size blocks backed by one contiguous arena.
//! Grounded directly on `examples/original_source/distributor/lru.go`; the cache-view-lifetime
//! question is resolved by copying out of the arena under the lock rather than returning a
//! borrow, which would tie a caller's reference to a slot that a racing eviction can overwrite.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{trace, warn};

struct Inner {
    /// key -> slot index.
    slots: HashMap<Vec<u8>, usize>,
    /// Most-recent-first list of keys currently resident.
    priority: VecDeque<Vec<u8>>,
    arena: Vec<u8>,
}

/// A fixed-capacity LRU cache of `capacity` blocks, each `block_size` bytes, backed by one
/// contiguous arena of `capacity * block_size` bytes.
pub struct BlockCache {
    capacity: usize,
    block_size: usize,
    inner: Mutex<Inner>,
}

impl BlockCache {
    pub fn new(capacity: usize, block_size: usize) -> Self {
        Self {
            capacity,
            block_size,
            inner: Mutex::new(Inner {
                slots: HashMap::with_capacity(capacity),
                priority: VecDeque::with_capacity(capacity),
                arena: vec![0u8; capacity * block_size],
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns a copy of the cached block, if present, and promotes it to most-recent. The
    /// source returns a borrow into the arena with no lifetime binding; that is unsound under a
    /// racing eviction, so this reimplementation copies out while holding the lock instead.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let slot = *inner.slots.get(key)?;
        trace!(?key, slot, "cache hit");
        let off = slot * self.block_size;
        let block = inner.arena[off..off + self.block_size].to_vec();
        Self::touch(&mut inner.priority, key);
        Some(block)
    }

    /// Inserts or overwrites `key` with `bytes`. `bytes.len() == block_size` is required by the
    /// contract; shorter input is zero-padded (the tail is left as whatever the slot already
    /// held, matching the source's "tail is left undefined"), longer input is truncated.
    pub fn put(&self, key: &[u8], bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let n = bytes.len().min(self.block_size);

        if let Some(&slot) = inner.slots.get(key) {
            warn!(?key, "caching the same block twice");
            let off = slot * self.block_size;
            inner.arena[off..off + n].copy_from_slice(&bytes[..n]);
            Self::touch(&mut inner.priority, key);
            return;
        }

        let slot = if inner.priority.len() >= self.capacity {
            self.evict_oldest(&mut inner)
        } else {
            inner.priority.len()
        };

        let off = slot * self.block_size;
        inner.arena[off..off + n].copy_from_slice(&bytes[..n]);
        inner.slots.insert(key.to_vec(), slot);
        inner.priority.push_front(key.to_vec());
        trace!(?key, slot, resident = inner.slots.len(), "cache put");
    }

    fn evict_oldest(&self, inner: &mut Inner) -> usize {
        let oldest = inner.priority.pop_back().expect("cache at capacity has an oldest entry");
        let slot = inner
            .slots
            .remove(&oldest)
            .expect("evicted key must have had a slot");
        slot
    }

    fn touch(priority: &mut VecDeque<Vec<u8>>, key: &[u8]) {
        if let Some(pos) = priority.iter().position(|k| k.as_slice() == key) {
            let k = priority.remove(pos).unwrap();
            priority.push_front(k);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_until_evicted() {
        let cache = BlockCache::new(2, 4);
        cache.put(b"a", b"aaaa");
        assert_eq!(cache.get(b"a"), Some(b"aaaa".to_vec()));
    }

    #[test]
    fn lru_eviction_order() {
        // After N+1 distinct puts into a capacity-N cache, the first-inserted key is absent.
        let cache = BlockCache::new(2, 4);
        cache.put(b"a", b"aaaa");
        cache.put(b"b", b"bbbb");
        cache.put(b"c", b"cccc");
        assert_eq!(cache.get(b"a"), None);
        assert_eq!(cache.get(b"b"), Some(b"bbbb".to_vec()));
        assert_eq!(cache.get(b"c"), Some(b"cccc".to_vec()));
    }

    #[test]
    fn get_refreshes_recency() {
        let cache = BlockCache::new(2, 4);
        cache.put(b"a", b"aaaa");
        cache.put(b"b", b"bbbb");
        // Touch "a" so "b" becomes the least-recent.
        cache.get(b"a");
        cache.put(b"c", b"cccc");
        assert_eq!(cache.get(b"b"), None);
        assert_eq!(cache.get(b"a"), Some(b"aaaa".to_vec()));
    }

    #[test]
    fn duplicate_insert_reuses_slot() {
        let cache = BlockCache::new(1, 4);
        cache.put(b"a", b"aaaa");
        cache.put(b"a", b"zzzz");
        assert_eq!(cache.get(b"a"), Some(b"zzzz".to_vec()));
    }

    #[test]
    fn short_input_is_accepted() {
        let cache = BlockCache::new(1, 4);
        cache.put(b"a", b"ab");
        let v = cache.get(b"a").unwrap();
        assert_eq!(&v[..2], b"ab");
    }

    #[test]
    fn long_input_is_truncated() {
        let cache = BlockCache::new(1, 4);
        cache.put(b"a", b"abcdef");
        assert_eq!(cache.get(b"a"), Some(b"abcd".to_vec()));
    }
}
