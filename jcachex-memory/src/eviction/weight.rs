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

use jcachex_common::code::Key;

use crate::eviction::{lru::LruPolicy, AccessMeta, EvictionPolicy};

/// Weight-oriented policy: recency ordering over an inner LRU, selected for
/// caches bounded by total weight. The weight loop lives with the caller,
/// which keeps asking for victims from the cold end until the bound holds,
/// so heavy cold entries drain first.
pub struct WeightPolicy<K>
where
    K: Key,
{
    inner: LruPolicy<K>,
}

impl<K> Default for WeightPolicy<K>
where
    K: Key,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WeightPolicy<K>
where
    K: Key,
{
    pub fn new() -> Self {
        Self {
            inner: LruPolicy::new(),
        }
    }
}

impl<K> EvictionPolicy<K> for WeightPolicy<K>
where
    K: Key,
{
    fn on_access(&mut self, key: &K, meta: &AccessMeta<'_, K>) {
        self.inner.on_access(key, meta)
    }

    fn on_write(&mut self, key: &K, weight: u32, meta: &AccessMeta<'_, K>) -> Option<K> {
        self.inner.on_write(key, weight, meta)
    }

    fn on_remove(&mut self, key: &K) {
        self.inner.on_remove(key)
    }

    fn select_victim(&mut self, meta: &AccessMeta<'_, K>) -> Option<K> {
        self.inner.select_victim(meta)
    }

    fn clear(&mut self) {
        self.inner.clear()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::test_utils::{ahash_of, plain_meta};

    #[test]
    fn test_victims_come_cold_first() {
        let hasher = |k: &u64| ahash_of(k);
        let meta = plain_meta(&hasher, 1);
        let mut policy = WeightPolicy::new();

        policy.on_write(&1, 5, &meta);
        policy.on_write(&2, 3, &meta);
        policy.on_write(&3, 2, &meta);
        policy.on_access(&1, &meta);

        assert_eq!(policy.select_victim(&meta), Some(2));
        policy.on_remove(&2);
        assert_eq!(policy.select_victim(&meta), Some(3));
        policy.on_remove(&3);
        assert_eq!(policy.select_victim(&meta), Some(1));
    }
}
