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

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::hash_map::{Entry as HashMapEntry, HashMap};
use itertools::Itertools;
use parking_lot::RwLock;
use tokio::sync::oneshot;

use jcachex_common::code::{HashBuilder, Key, Value};

use crate::entry::EntryRecord;

/// Outcome of joining a single-flight load.
pub(crate) enum BeginLoad<V> {
    /// The entry was present and live; hit bookkeeping already ran.
    Hit(V),
    /// Another caller is loading this key; wait for its result.
    Waiter(oneshot::Receiver<Option<V>>),
    /// This caller owns the load.
    Leader,
}

/// Outcome of a conditional in-place replacement.
pub(crate) enum ReplaceOutcome<V> {
    Replaced { old_value: V, old_weight: u32 },
    Rejected,
    Absent,
}

struct Shard<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    map: HashMap<K, EntryRecord<V>, S>,
    /// Pending single-flight loads keyed by the missing key. The waiting
    /// senders are fulfilled by the load leader.
    waiters: HashMap<K, Vec<oneshot::Sender<Option<V>>>, S>,
}

/// Striped key-to-entry mapping.
///
/// The key hash selects one of N stripes; reads take the stripe's shared
/// lock and never block each other, writes serialize on the stripe's
/// exclusive lock without blocking other stripes. Entry count and total
/// weight are relaxed atomic aggregates, exact at quiescence and at most
/// the number of in-flight writes behind under concurrent traffic.
pub(crate) struct EntryStore<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    shards: Vec<RwLock<Shard<K, V, S>>>,
    size: AtomicU64,
    weight: AtomicU64,
    hash_builder: S,
}

impl<K, V, S> EntryStore<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    pub fn new(shards: usize, hash_builder: S) -> Self {
        let shards = (0..shards)
            .map(|_| {
                RwLock::new(Shard {
                    map: HashMap::with_hasher(hash_builder.clone()),
                    waiters: HashMap::with_hasher(hash_builder.clone()),
                })
            })
            .collect_vec();
        Self {
            shards,
            size: AtomicU64::new(0),
            weight: AtomicU64::new(0),
            hash_builder,
        }
    }

    pub fn hash(&self, key: &K) -> u64 {
        self.hash_builder.hash_one(key)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, hash: u64) -> usize {
        hash as usize % self.shards.len()
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn weight(&self) -> u64 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Run `f` against the record under the stripe's shared lock.
    pub fn with_record<R>(
        &self,
        hash: u64,
        key: &K,
        f: impl FnOnce(&EntryRecord<V>) -> R,
    ) -> Option<R> {
        let shard = self.shards[self.shard_index(hash)].read();
        shard.map.get(key).map(f)
    }

    /// Insert or replace. Returns the prior record if one existed.
    pub fn insert(&self, hash: u64, key: K, record: EntryRecord<V>) -> Option<EntryRecord<V>> {
        let added_weight = record.weight as u64;
        let mut shard = self.shards[self.shard_index(hash)].write();
        let prior = shard.map.insert(key, record);
        match &prior {
            Some(old) => {
                old.mark_tombstone();
                self.weight.fetch_add(added_weight, Ordering::Relaxed);
                self.weight.fetch_sub(old.weight as u64, Ordering::Relaxed);
            }
            None => {
                self.size.fetch_add(1, Ordering::Relaxed);
                self.weight.fetch_add(added_weight, Ordering::Relaxed);
            }
        }
        prior
    }

    /// Remove unconditionally. Returns the prior record if one existed.
    pub fn remove(&self, hash: u64, key: &K) -> Option<EntryRecord<V>> {
        self.remove_if(hash, key, |_| true)
    }

    /// Remove only when `pred` holds under the stripe's exclusive lock.
    pub fn remove_if(
        &self,
        hash: u64,
        key: &K,
        pred: impl FnOnce(&EntryRecord<V>) -> bool,
    ) -> Option<EntryRecord<V>> {
        let mut shard = self.shards[self.shard_index(hash)].write();
        match shard.map.get(key) {
            Some(record) if pred(record) => {}
            _ => return None,
        }
        let record = shard.map.remove(key)?;
        record.mark_tombstone();
        self.size.fetch_sub(1, Ordering::Relaxed);
        self.weight
            .fetch_sub(record.weight as u64, Ordering::Relaxed);
        Some(record)
    }

    /// Replace the value in place when `pred` holds, renewing the entry's
    /// write-time metadata.
    #[allow(clippy::too_many_arguments)]
    pub fn replace_if(
        &self,
        hash: u64,
        key: &K,
        pred: impl FnOnce(&EntryRecord<V>) -> bool,
        value: V,
        weight: u32,
        now: u64,
        expire_at: u64,
        refresh_at: u64,
    ) -> ReplaceOutcome<V> {
        let mut shard = self.shards[self.shard_index(hash)].write();
        match shard.map.get_mut(key) {
            None => ReplaceOutcome::Absent,
            Some(record) if !pred(record) => ReplaceOutcome::Rejected,
            Some(record) => {
                let (old_value, old_weight) = record.renew(value, weight, now, expire_at, refresh_at);
                self.weight.fetch_add(weight as u64, Ordering::Relaxed);
                self.weight.fetch_sub(old_weight as u64, Ordering::Relaxed);
                ReplaceOutcome::Replaced {
                    old_value,
                    old_weight,
                }
            }
        }
    }

    pub fn peek_weight(&self, hash: u64, key: &K) -> Option<u32> {
        self.with_record(hash, key, |record| record.weight)
    }

    /// Visit every record in one stripe under its shared lock.
    pub fn scan_shard(&self, index: usize, mut f: impl FnMut(&K, &EntryRecord<V>)) {
        let shard = self.shards[index].read();
        for (key, record) in shard.map.iter() {
            f(key, record);
        }
    }

    /// Clone out all entries passing `filter`.
    pub fn snapshot(&self, filter: impl Fn(&K, &EntryRecord<V>) -> bool) -> Vec<(K, V)> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.read();
            for (key, record) in shard.map.iter() {
                if filter(key, record) {
                    out.push((key.clone(), record.value.clone()));
                }
            }
        }
        out
    }

    /// Drop every entry. Returns the number of entries removed.
    pub fn clear(&self) -> u64 {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            for (_, record) in shard.map.drain() {
                record.mark_tombstone();
                removed += 1;
                self.size.fetch_sub(1, Ordering::Relaxed);
                self.weight
                    .fetch_sub(record.weight as u64, Ordering::Relaxed);
            }
        }
        removed
    }

    /// Join or start a single-flight load for `key`. `on_hit` runs against
    /// a present record under the stripe lock and returns the value if the
    /// record counts as a live hit.
    pub fn begin_load(
        &self,
        hash: u64,
        key: &K,
        on_hit: impl FnOnce(&EntryRecord<V>) -> Option<V>,
    ) -> BeginLoad<V> {
        let mut shard = self.shards[self.shard_index(hash)].write();
        if let Some(record) = shard.map.get(key) {
            if let Some(value) = on_hit(record) {
                return BeginLoad::Hit(value);
            }
        }
        match shard.waiters.entry(key.clone()) {
            HashMapEntry::Occupied(mut o) => {
                let (tx, rx) = oneshot::channel();
                o.get_mut().push(tx);
                BeginLoad::Waiter(rx)
            }
            HashMapEntry::Vacant(v) => {
                v.insert(vec![]);
                BeginLoad::Leader
            }
        }
    }

    /// Conclude a single-flight load, returning the senders to fulfill.
    pub fn finish_load(&self, hash: u64, key: &K) -> Vec<oneshot::Sender<Option<V>>> {
        let mut shard = self.shards[self.shard_index(hash)].write();
        shard.waiters.remove(key).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use ahash::RandomState;

    use super::*;

    fn store() -> EntryStore<u64, String, RandomState> {
        EntryStore::new(4, RandomState::default())
    }

    fn record(value: &str, weight: u32) -> EntryRecord<String> {
        EntryRecord::new(value.to_string(), weight, 1, 0, 0)
    }

    #[test]
    fn test_insert_remove_aggregates() {
        let store = store();
        let hash = store.hash(&1);

        assert!(store.insert(hash, 1, record("a", 2)).is_none());
        assert_eq!(store.size(), 1);
        assert_eq!(store.weight(), 2);

        let prior = store.insert(hash, 1, record("b", 5)).unwrap();
        assert_eq!(prior.value, "a");
        assert_eq!(store.size(), 1);
        assert_eq!(store.weight(), 5);

        let removed = store.remove(hash, &1).unwrap();
        assert_eq!(removed.value, "b");
        assert_eq!(store.size(), 0);
        assert_eq!(store.weight(), 0);
        assert!(store.remove(hash, &1).is_none());
    }

    #[test]
    fn test_remove_if_pred() {
        let store = store();
        let hash = store.hash(&7);
        store.insert(hash, 7, record("v", 1));

        assert!(store.remove_if(hash, &7, |r| r.value == "other").is_none());
        assert_eq!(store.size(), 1);
        assert!(store.remove_if(hash, &7, |r| r.value == "v").is_some());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_replace_if() {
        let store = store();
        let hash = store.hash(&7);
        store.insert(hash, 7, record("old", 2));

        match store.replace_if(hash, &7, |r| r.value == "old", "new".to_string(), 4, 9, 0, 0) {
            ReplaceOutcome::Replaced {
                old_value,
                old_weight,
            } => {
                assert_eq!(old_value, "old");
                assert_eq!(old_weight, 2);
            }
            _ => panic!("expected replacement"),
        }
        assert_eq!(store.weight(), 4);
        assert!(matches!(
            store.replace_if(hash, &7, |r| r.value == "old", "x".to_string(), 1, 9, 0, 0),
            ReplaceOutcome::Rejected
        ));
        assert!(matches!(
            store.replace_if(hash, &8, |_| true, "x".to_string(), 1, 9, 0, 0),
            ReplaceOutcome::Absent
        ));
    }

    #[test]
    fn test_snapshot_filters() {
        let store = store();
        for key in 0..8u64 {
            let hash = store.hash(&key);
            store.insert(hash, key, record(&key.to_string(), 1));
        }
        let even = store.snapshot(|key, _| key % 2 == 0);
        assert_eq!(even.len(), 4);
    }

    #[test]
    fn test_clear() {
        let store = store();
        for key in 0..16u64 {
            let hash = store.hash(&key);
            store.insert(hash, key, record("v", 2));
        }
        assert_eq!(store.clear(), 16);
        assert_eq!(store.size(), 0);
        assert_eq!(store.weight(), 0);
    }

    #[test]
    fn test_single_flight_roles() {
        let store = store();
        let hash = store.hash(&1);

        let leader = store.begin_load(hash, &1, |_| None);
        assert!(matches!(leader, BeginLoad::Leader));

        let waiter = store.begin_load(hash, &1, |_| None);
        let rx = match waiter {
            BeginLoad::Waiter(rx) => rx,
            _ => panic!("expected waiter"),
        };

        let senders = store.finish_load(hash, &1);
        assert_eq!(senders.len(), 1);
        for tx in senders {
            let _ = tx.send(Some("value".to_string()));
        }
        assert_eq!(rx.blocking_recv().unwrap(), Some("value".to_string()));

        // The slot is free again.
        assert!(matches!(store.begin_load(hash, &1, |_| None), BeginLoad::Leader));
    }

    #[test]
    fn test_begin_load_hit_short_circuits() {
        let store = store();
        let hash = store.hash(&1);
        store.insert(hash, 1, record("v", 1));

        match store.begin_load(hash, &1, |r| Some(r.value.clone())) {
            BeginLoad::Hit(v) => assert_eq!(v, "v"),
            _ => panic!("expected hit"),
        }
    }

    #[test]
    fn test_concurrent_inserts_distinct_keys() {
        use std::sync::Arc;

        let store = Arc::new(EntryStore::<u64, String, RandomState>::new(
            8,
            RandomState::default(),
        ));
        let handles = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..256u64 {
                        let key = t * 1000 + i;
                        let hash = store.hash(&key);
                        store.insert(hash, key, EntryRecord::new("v".to_string(), 1, 1, 0, 0));
                    }
                })
            })
            .collect_vec();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.size(), 1024);
        assert_eq!(store.weight(), 1024);
    }
}
