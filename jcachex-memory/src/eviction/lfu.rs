//  Copyright 2025 JCacheX Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use hashbrown::HashMap;

use jcachex_common::code::Key;

use crate::eviction::{AccessMeta, EvictionPolicy};

struct HeapEntry<K> {
    count: u64,
    touched: u64,
    freq: u64,
    hash: u64,
    stamp: u64,
    key: K,
}

impl<K> HeapEntry<K> {
    fn rank(&self) -> (u64, u64, u64, u64) {
        (self.count, self.touched, self.freq, self.hash)
    }
}

impl<K> PartialEq for HeapEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl<K> Eq for HeapEntry<K> {}

impl<K> PartialOrd for HeapEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for HeapEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Clone, Copy)]
struct KeyMeta {
    count: u64,
    touched: u64,
    freq: u64,
    hash: u64,
    stamp: u64,
}

/// Least-frequently-used ordering over a lazy min-heap.
///
/// Each access pushes a fresh heap entry carrying a stamp; stale copies are
/// discarded when they surface. Ties on access count break on last-access
/// time, then sketch frequency, then key hash, keeping victim selection
/// deterministic. Amortized O(log n) per update.
pub struct LfuPolicy<K>
where
    K: Key,
{
    heap: BinaryHeap<Reverse<HeapEntry<K>>>,
    index: HashMap<K, KeyMeta>,
}

impl<K> Default for LfuPolicy<K>
where
    K: Key,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> LfuPolicy<K>
where
    K: Key,
{
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            index: HashMap::new(),
        }
    }

    fn push_current(&mut self, key: &K, meta: KeyMeta) {
        self.heap.push(Reverse(HeapEntry {
            count: meta.count,
            touched: meta.touched,
            freq: meta.freq,
            hash: meta.hash,
            stamp: meta.stamp,
            key: key.clone(),
        }));
        self.maybe_compact();
    }

    /// Drop accumulated stale copies once they dominate the heap.
    fn maybe_compact(&mut self) {
        if self.heap.len() > 4 * self.index.len() + 16 {
            let mut heap = BinaryHeap::with_capacity(self.index.len());
            for (key, meta) in self.index.iter() {
                heap.push(Reverse(HeapEntry {
                    count: meta.count,
                    touched: meta.touched,
                    freq: meta.freq,
                    hash: meta.hash,
                    stamp: meta.stamp,
                    key: key.clone(),
                }));
            }
            self.heap = heap;
        }
    }
}

impl<K> EvictionPolicy<K> for LfuPolicy<K>
where
    K: Key,
{
    fn on_access(&mut self, key: &K, meta: &AccessMeta<'_, K>) {
        let Some(entry) = self.index.get_mut(key) else {
            return;
        };
        entry.count += 1;
        entry.touched = meta.now;
        entry.freq = meta.frequency_of_hash(entry.hash);
        entry.stamp += 1;
        let snapshot = *entry;
        self.push_current(key, snapshot);
    }

    fn on_write(&mut self, key: &K, _weight: u32, meta: &AccessMeta<'_, K>) -> Option<K> {
        let hash = meta.key_hash(key);
        let snapshot = match self.index.entry(key.clone()) {
            hashbrown::hash_map::Entry::Occupied(mut o) => {
                let entry = o.get_mut();
                entry.touched = meta.now;
                entry.stamp += 1;
                *entry
            }
            hashbrown::hash_map::Entry::Vacant(v) => {
                let entry = KeyMeta {
                    count: 0,
                    touched: meta.now,
                    freq: meta.frequency_of_hash(hash),
                    hash,
                    stamp: 0,
                };
                v.insert(entry);
                entry
            }
        };
        self.push_current(key, snapshot);
        None
    }

    fn on_remove(&mut self, key: &K) {
        self.index.remove(key);
    }

    fn select_victim(&mut self, _meta: &AccessMeta<'_, K>) -> Option<K> {
        loop {
            let top = self.heap.peek()?;
            let candidate = &top.0;
            match self.index.get(&candidate.key) {
                Some(meta) if meta.stamp == candidate.stamp => {
                    return Some(candidate.key.clone());
                }
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::test_utils::{ahash_of, plain_meta};

    #[test]
    fn test_least_frequent_is_victim() {
        let hasher = |k: &u64| ahash_of(k);
        let mut lfu = LfuPolicy::new();

        let meta = plain_meta(&hasher, 1);
        for key in 1..=3u64 {
            lfu.on_write(&key, 1, &meta);
        }
        for _ in 0..3 {
            lfu.on_access(&1, &meta);
        }
        lfu.on_access(&2, &meta);

        assert_eq!(lfu.select_victim(&meta), Some(3));
        lfu.on_remove(&3);
        assert_eq!(lfu.select_victim(&meta), Some(2));
        lfu.on_remove(&2);
        assert_eq!(lfu.select_victim(&meta), Some(1));
    }

    #[test]
    fn test_tie_breaks_on_recency() {
        let hasher = |k: &u64| ahash_of(k);
        let mut lfu = LfuPolicy::new();

        lfu.on_write(&1, 1, &plain_meta(&hasher, 10));
        lfu.on_write(&2, 1, &plain_meta(&hasher, 20));
        lfu.on_access(&1, &plain_meta(&hasher, 30));
        lfu.on_access(&2, &plain_meta(&hasher, 40));

        // Same count; key 1 was touched longer ago.
        assert_eq!(lfu.select_victim(&plain_meta(&hasher, 50)), Some(1));
    }

    #[test]
    fn test_stale_heap_copies_are_skipped() {
        let hasher = |k: &u64| ahash_of(k);
        let meta = plain_meta(&hasher, 1);
        let mut lfu = LfuPolicy::new();

        lfu.on_write(&1, 1, &meta);
        lfu.on_write(&2, 1, &meta);
        // Many accesses leave stale copies of key 1 in the heap.
        for _ in 0..10 {
            lfu.on_access(&1, &meta);
        }
        assert_eq!(lfu.select_victim(&meta), Some(2));
    }

    #[test]
    fn test_compaction_preserves_order() {
        let hasher = |k: &u64| ahash_of(k);
        let meta = plain_meta(&hasher, 1);
        let mut lfu = LfuPolicy::new();

        for key in 1..=4u64 {
            lfu.on_write(&key, 1, &meta);
        }
        // Drive enough churn to trigger compaction.
        for round in 0..50 {
            for key in 1..=3u64 {
                lfu.on_access(&key, &plain_meta(&hasher, round));
            }
        }
        assert_eq!(lfu.select_victim(&meta), Some(4));
    }
}
