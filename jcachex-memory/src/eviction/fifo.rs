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

use hashbrown::hash_map::{Entry as HashMapEntry, HashMap};

use jcachex_common::code::Key;
use jcachex_common::queue::{RemovableQueue, Token};

use crate::eviction::{AccessMeta, EvictionPolicy};

/// Insertion-order policy. Accesses are no-ops; rewrites keep the original
/// position. The victim is the oldest insertion (FIFO) or the newest (FILO).
pub struct FifoPolicy<K>
where
    K: Key,
{
    queue: RemovableQueue<K>,
    index: HashMap<K, Token>,
    newest_first: bool,
}

impl<K> FifoPolicy<K>
where
    K: Key,
{
    pub fn fifo() -> Self {
        Self {
            queue: RemovableQueue::new(),
            index: HashMap::new(),
            newest_first: false,
        }
    }

    pub fn filo() -> Self {
        Self {
            queue: RemovableQueue::new(),
            index: HashMap::new(),
            newest_first: true,
        }
    }
}

impl<K> EvictionPolicy<K> for FifoPolicy<K>
where
    K: Key,
{
    fn on_access(&mut self, _key: &K, _meta: &AccessMeta<'_, K>) {}

    fn on_write(&mut self, key: &K, _weight: u32, _meta: &AccessMeta<'_, K>) -> Option<K> {
        if let HashMapEntry::Vacant(v) = self.index.entry(key.clone()) {
            let token = self.queue.push(key.clone());
            v.insert(token);
        }
        None
    }

    fn on_remove(&mut self, key: &K) {
        if let Some(token) = self.index.remove(key) {
            self.queue.remove(token);
        }
    }

    fn select_victim(&mut self, _meta: &AccessMeta<'_, K>) -> Option<K> {
        if self.newest_first {
            self.queue.peek_back().cloned()
        } else {
            self.queue.peek().cloned()
        }
    }

    fn clear(&mut self) {
        self.queue.clear();
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
    fn test_fifo_victim_is_oldest() {
        let hasher = |k: &u64| ahash_of(k);
        let meta = plain_meta(&hasher, 1);
        let mut fifo = FifoPolicy::fifo();

        for key in 1..=4u64 {
            fifo.on_write(&key, 1, &meta);
        }
        // Access never reorders.
        fifo.on_access(&1, &meta);
        assert_eq!(fifo.select_victim(&meta), Some(1));

        fifo.on_remove(&1);
        assert_eq!(fifo.select_victim(&meta), Some(2));
    }

    #[test]
    fn test_filo_victim_is_newest() {
        let hasher = |k: &u64| ahash_of(k);
        let meta = plain_meta(&hasher, 1);
        let mut filo = FifoPolicy::filo();

        for key in 1..=4u64 {
            filo.on_write(&key, 1, &meta);
        }
        assert_eq!(filo.select_victim(&meta), Some(4));

        filo.on_remove(&4);
        assert_eq!(filo.select_victim(&meta), Some(3));
    }

    #[test]
    fn test_rewrite_keeps_position() {
        let hasher = |k: &u64| ahash_of(k);
        let meta = plain_meta(&hasher, 1);
        let mut fifo = FifoPolicy::fifo();

        fifo.on_write(&1, 1, &meta);
        fifo.on_write(&2, 1, &meta);
        fifo.on_write(&1, 1, &meta);

        assert_eq!(fifo.len(), 2);
        assert_eq!(fifo.select_victim(&meta), Some(1));
    }

    #[test]
    fn test_clear_drops_everything() {
        let hasher = |k: &u64| ahash_of(k);
        let meta = plain_meta(&hasher, 1);
        let mut fifo = FifoPolicy::fifo();

        fifo.on_write(&1, 1, &meta);
        fifo.on_write(&2, 1, &meta);
        fifo.clear();

        assert!(fifo.is_empty());
        assert_eq!(fifo.select_victim(&meta), None);
    }
}
