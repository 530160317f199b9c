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

use crate::eviction::{AccessMeta, EvictionPolicy, Policy};

/// Chains several policies. Every callback reaches every child; victim
/// selection asks the children in registration order and takes the first
/// answer, so earlier children dominate.
pub struct CompositePolicy<K>
where
    K: Key,
{
    children: Vec<Policy<K>>,
}

impl<K> CompositePolicy<K>
where
    K: Key,
{
    pub(crate) fn new(children: Vec<Policy<K>>) -> Self {
        Self { children }
    }
}

impl<K> EvictionPolicy<K> for CompositePolicy<K>
where
    K: Key,
{
    fn on_access(&mut self, key: &K, meta: &AccessMeta<'_, K>) {
        for child in &mut self.children {
            child.on_access(key, meta);
        }
    }

    fn on_write(&mut self, key: &K, weight: u32, meta: &AccessMeta<'_, K>) -> Option<K> {
        let mut rejected = None;
        for child in &mut self.children {
            let r = child.on_write(key, weight, meta);
            if rejected.is_none() {
                rejected = r;
            }
        }
        rejected
    }

    fn on_remove(&mut self, key: &K) {
        for child in &mut self.children {
            child.on_remove(key);
        }
    }

    fn select_victim(&mut self, meta: &AccessMeta<'_, K>) -> Option<K> {
        self.children
            .iter_mut()
            .find_map(|child| child.select_victim(meta))
    }

    fn clear(&mut self) {
        for child in &mut self.children {
            child.clear();
        }
    }

    fn len(&self) -> usize {
        self.children.first().map(|child| child.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::EvictionPolicyKind;
    use crate::eviction::test_utils::{ahash_of, plain_meta};

    fn composite(kinds: Vec<EvictionPolicyKind>) -> CompositePolicy<u64> {
        CompositePolicy::new(
            kinds
                .iter()
                .map(|kind| Policy::from_kind(kind, 100))
                .collect(),
        )
    }

    #[test]
    fn test_first_child_with_victim_wins() {
        let hasher = |k: &u64| ahash_of(k);
        let mut policy = composite(vec![
            EvictionPolicyKind::IdleTime {
                idle: Duration::from_nanos(1_000),
            },
            EvictionPolicyKind::Fifo,
        ]);

        let meta = plain_meta(&hasher, 10);
        policy.on_write(&1, 1, &meta);
        policy.on_write(&2, 1, &meta);

        // Nothing is idle long enough, so the FIFO child answers.
        assert_eq!(policy.select_victim(&plain_meta(&hasher, 20)), Some(1));

        // Once the idle child has a victim it dominates; the most idle key
        // is still key 1 either way.
        policy.on_access(&2, &plain_meta(&hasher, 30));
        assert_eq!(policy.select_victim(&plain_meta(&hasher, 5_000)), Some(1));
    }

    #[test]
    fn test_remove_reaches_all_children() {
        let hasher = |k: &u64| ahash_of(k);
        let mut policy = composite(vec![EvictionPolicyKind::Fifo, EvictionPolicyKind::Lru]);
        let meta = plain_meta(&hasher, 1);

        policy.on_write(&1, 1, &meta);
        policy.on_write(&2, 1, &meta);
        policy.on_remove(&1);

        assert_eq!(policy.len(), 1);
        assert_eq!(policy.select_victim(&meta), Some(2));
    }
}
