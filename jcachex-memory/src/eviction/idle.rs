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
use std::time::Duration;

use hashbrown::HashMap;

use jcachex_common::code::Key;

use crate::eviction::{AccessMeta, EvictionPolicy};

struct HeapEntry<K> {
    last: u64,
    freq: u64,
    hash: u64,
    stamp: u64,
    key: K,
}

impl<K> HeapEntry<K> {
    fn rank(&self) -> (u64, u64, u64) {
        (self.last, self.freq, self.hash)
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
    last: u64,
    freq: u64,
    hash: u64,
    stamp: u64,
}

/// Evicts the entry that has sat untouched the longest, but only once its
/// idle time exceeds the configured threshold; otherwise there is no
/// victim. Uses the same lazy min-heap shape as the LFU policy.
pub struct IdlePolicy<K>
where
    K: Key,
{
    heap: BinaryHeap<Reverse<HeapEntry<K>>>,
    index: HashMap<K, KeyMeta>,
    threshold: u64,
}

impl<K> IdlePolicy<K>
where
    K: Key,
{
    pub fn new(threshold: Duration) -> Self {
        Self {
            heap: BinaryHeap::new(),
            index: HashMap::new(),
            threshold: threshold.as_nanos() as u64,
        }
    }

    fn push_current(&mut self, key: &K, meta: KeyMeta) {
        self.heap.push(Reverse(HeapEntry {
            last: meta.last,
            freq: meta.freq,
            hash: meta.hash,
            stamp: meta.stamp,
            key: key.clone(),
        }));
        self.maybe_compact();
    }

    fn maybe_compact(&mut self) {
        if self.heap.len() > 4 * self.index.len() + 16 {
            let mut heap = BinaryHeap::with_capacity(self.index.len());
            for (key, meta) in self.index.iter() {
                heap.push(Reverse(HeapEntry {
                    last: meta.last,
                    freq: meta.freq,
                    hash: meta.hash,
                    stamp: meta.stamp,
                    key: key.clone(),
                }));
            }
            self.heap = heap;
        }
    }

    fn touch(&mut self, key: &K, meta: &AccessMeta<'_, K>, create: bool) {
        let snapshot = if create {
            match self.index.entry(key.clone()) {
                hashbrown::hash_map::Entry::Occupied(mut o) => {
                    let entry = o.get_mut();
                    entry.last = meta.now;
                    entry.stamp += 1;
                    *entry
                }
                hashbrown::hash_map::Entry::Vacant(v) => {
                    let hash = meta.key_hash(key);
                    let entry = KeyMeta {
                        last: meta.now,
                        freq: meta.frequency_of_hash(hash),
                        hash,
                        stamp: 0,
                    };
                    v.insert(entry);
                    entry
                }
            }
        } else {
            match self.index.get_mut(key) {
                Some(entry) => {
                    entry.last = meta.now;
                    entry.stamp += 1;
                    *entry
                }
                None => return,
            }
        };
        self.push_current(key, snapshot);
    }
}

impl<K> EvictionPolicy<K> for IdlePolicy<K>
where
    K: Key,
{
    fn on_access(&mut self, key: &K, meta: &AccessMeta<'_, K>) {
        self.touch(key, meta, false);
    }

    fn on_write(&mut self, key: &K, _weight: u32, meta: &AccessMeta<'_, K>) -> Option<K> {
        self.touch(key, meta, true);
        None
    }

    fn on_remove(&mut self, key: &K) {
        self.index.remove(key);
    }

    fn select_victim(&mut self, meta: &AccessMeta<'_, K>) -> Option<K> {
        loop {
            let top = self.heap.peek()?;
            let candidate = &top.0;
            match self.index.get(&candidate.key) {
                Some(entry) if entry.stamp == candidate.stamp => {
                    if meta.now.saturating_sub(candidate.last) > self.threshold {
                        return Some(candidate.key.clone());
                    }
                    // The coldest entry is not idle enough; nothing is.
                    return None;
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
    fn test_idle_victim_past_threshold() {
        let hasher = |k: &u64| ahash_of(k);
        let mut policy = IdlePolicy::new(Duration::from_nanos(50));

        policy.on_write(&1, 1, &plain_meta(&hasher, 10));
        policy.on_write(&2, 1, &plain_meta(&hasher, 40));

        // At t=30, key 1 has been idle 20ns; under the threshold.
        assert_eq!(policy.select_victim(&plain_meta(&hasher, 30)), None);
        // At t=100, key 1 has been idle 90ns.
        assert_eq!(policy.select_victim(&plain_meta(&hasher, 100)), Some(1));
    }

    #[test]
    fn test_access_resets_idle_clock() {
        let hasher = |k: &u64| ahash_of(k);
        let mut policy = IdlePolicy::new(Duration::from_nanos(50));

        policy.on_write(&1, 1, &plain_meta(&hasher, 10));
        policy.on_write(&2, 1, &plain_meta(&hasher, 20));
        policy.on_access(&1, &plain_meta(&hasher, 90));

        // Key 2 is now the coldest, idle 80ns at t=100.
        assert_eq!(policy.select_victim(&plain_meta(&hasher, 100)), Some(2));
    }

    #[test]
    fn test_unknown_access_ignored() {
        let hasher = |k: &u64| ahash_of(k);
        let mut policy = IdlePolicy::new(Duration::from_nanos(0));
        policy.on_access(&9, &plain_meta(&hasher, 10));
        assert!(policy.is_empty());
        assert_eq!(policy.select_victim(&plain_meta(&hasher, 100)), None);
    }
}
