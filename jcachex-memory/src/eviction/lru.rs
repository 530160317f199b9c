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
use jcachex_common::list::{NodeId, SlotList};

use crate::eviction::{AccessMeta, EvictionPolicy};

/// Least-recently-used ordering. The list runs cold to hot: an access moves
/// the key to the tail, the victim is the head.
pub struct LruPolicy<K>
where
    K: Key,
{
    list: SlotList<K>,
    index: HashMap<K, NodeId>,
}

impl<K> Default for LruPolicy<K>
where
    K: Key,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> LruPolicy<K>
where
    K: Key,
{
    pub fn new() -> Self {
        Self {
            list: SlotList::new(),
            index: HashMap::new(),
        }
    }
}

impl<K> EvictionPolicy<K> for LruPolicy<K>
where
    K: Key,
{
    fn on_access(&mut self, key: &K, _meta: &AccessMeta<'_, K>) {
        if let Some(&id) = self.index.get(key) {
            self.list.move_to_back(id);
        }
    }

    fn on_write(&mut self, key: &K, _weight: u32, _meta: &AccessMeta<'_, K>) -> Option<K> {
        match self.index.entry(key.clone()) {
            HashMapEntry::Occupied(o) => self.list.move_to_back(*o.get()),
            HashMapEntry::Vacant(v) => {
                let id = self.list.push_back(key.clone());
                v.insert(id);
            }
        }
        None
    }

    fn on_remove(&mut self, key: &K) {
        if let Some(id) = self.index.remove(key) {
            self.list.remove(id);
        }
    }

    fn select_victim(&mut self, _meta: &AccessMeta<'_, K>) -> Option<K> {
        self.list.front().cloned()
    }

    fn clear(&mut self) {
        self.list.clear();
        self.index.clear();
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}
