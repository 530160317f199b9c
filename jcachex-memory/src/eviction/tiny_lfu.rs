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

use hashbrown::HashMap;

use jcachex_common::code::Key;
use jcachex_common::list::{NodeId, SlotList};

use crate::eviction::{AccessMeta, EvictionPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Window,
    Probation,
    Protected,
}

/// Windowed TinyLFU.
///
/// New keys land in a small admission window (~1% of capacity, LRU). A key
/// pushed out of the window becomes a candidate for the main space and must
/// beat the main victim's sketch frequency to get in; one-shot keys fail
/// that contest and are dropped, which is what protects a hot working set
/// from scan traffic. Inside the main space, a hit promotes from the
/// probationary list to the protected list (~79% of capacity); protected
/// overflow demotes its coldest key back to probation.
pub struct WTinyLfuPolicy<K>
where
    K: Key,
{
    window: SlotList<K>,
    probation: SlotList<K>,
    protected: SlotList<K>,
    index: HashMap<K, (Segment, NodeId)>,
    window_cap: usize,
    protected_cap: usize,
}

impl<K> WTinyLfuPolicy<K>
where
    K: Key,
{
    pub fn new(capacity: usize) -> Self {
        let window_cap = (capacity / 100).max(1);
        let protected_cap = (capacity * 79 / 100).max(1);
        Self {
            window: SlotList::new(),
            probation: SlotList::new(),
            protected: SlotList::new(),
            index: HashMap::new(),
            window_cap,
            protected_cap,
        }
    }

    fn promote(&mut self, key: &K) {
        let Some(&(segment, id)) = self.index.get(key) else {
            return;
        };
        match segment {
            Segment::Window => self.window.move_to_back(id),
            Segment::Protected => self.protected.move_to_back(id),
            Segment::Probation => {
                let key = self.probation.remove(id);
                let new_id = self.protected.push_back(key.clone());
                self.index.insert(key, (Segment::Protected, new_id));

                if self.protected.len() > self.protected_cap {
                    let demoted = self.protected.pop_front().expect("protected not empty");
                    let demoted_id = self.probation.push_back(demoted.clone());
                    self.index.insert(demoted, (Segment::Probation, demoted_id));
                }
            }
        }
    }

    /// Frequency contest at the window boundary. Admits into probation or
    /// returns the rejected candidate.
    fn admit(&mut self, candidate: K, meta: &AccessMeta<'_, K>) -> Option<K> {
        let victim = self.probation.front().or_else(|| self.protected.front());
        let admitted = match victim {
            Some(victim) => meta.frequency(&candidate) > meta.frequency(victim),
            // With no incumbent the candidate only needs any recorded
            // history; without a sketch there is nothing to contest.
            None => meta.sketch.is_none() || meta.frequency(&candidate) > 0,
        };
        if admitted {
            let id = self.probation.push_back(candidate.clone());
            self.index.insert(candidate, (Segment::Probation, id));
            None
        } else {
            Some(candidate)
        }
    }
}

impl<K> EvictionPolicy<K> for WTinyLfuPolicy<K>
where
    K: Key,
{
    fn on_access(&mut self, key: &K, _meta: &AccessMeta<'_, K>) {
        self.promote(key);
    }

    fn on_write(&mut self, key: &K, _weight: u32, meta: &AccessMeta<'_, K>) -> Option<K> {
        if self.index.contains_key(key) {
            self.promote(key);
            return None;
        }

        let id = self.window.push_back(key.clone());
        self.index.insert(key.clone(), (Segment::Window, id));

        if self.window.len() > self.window_cap {
            let candidate = self.window.pop_front().expect("window not empty");
            self.index.remove(&candidate);
            return self.admit(candidate, meta);
        }
        None
    }

    fn on_remove(&mut self, key: &K) {
        if let Some((segment, id)) = self.index.remove(key) {
            match segment {
                Segment::Window => {
                    self.window.remove(id);
                }
                Segment::Probation => {
                    self.probation.remove(id);
                }
                Segment::Protected => {
                    self.protected.remove(id);
                }
            }
        }
    }

    fn select_victim(&mut self, _meta: &AccessMeta<'_, K>) -> Option<K> {
        self.probation
            .front()
            .or_else(|| self.window.front())
            .or_else(|| self.protected.front())
            .cloned()
    }

    fn clear(&mut self) {
        self.window.clear();
        self.probation.clear();
        self.protected.clear();
        self.index.clear();
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::test_utils::ahash_of;
    use crate::eviction::AccessMeta;
    use crate::sketch::FrequencySketch;

    fn sketch_meta<'a>(
        sketch: &'a FrequencySketch,
        hasher: &'a dyn Fn(&u64) -> u64,
        now: u64,
    ) -> AccessMeta<'a, u64> {
        AccessMeta {
            hash: 0,
            now,
            sketch: Some(sketch),
            hasher,
        }
    }

    #[test]
    fn test_window_overflow_contests_admission() {
        let hasher = |k: &u64| ahash_of(k);
        let sketch = FrequencySketch::new(128, false);
        let mut policy = WTinyLfuPolicy::new(100);

        // A hot key accrues frequency, then gets pushed out of the window
        // by a newcomer; with no incumbent it is admitted into probation.
        for _ in 0..10 {
            sketch.increment(ahash_of(&1u64));
        }
        let meta = sketch_meta(&sketch, &hasher, 1);
        assert_eq!(policy.on_write(&1, 1, &meta), None);
        sketch.increment(ahash_of(&2u64));
        assert_eq!(policy.on_write(&2, 1, &meta), None);

        // The next newcomer evicts key 2 from the window; its single
        // occurrence loses the contest against key 1 and it is rejected.
        sketch.increment(ahash_of(&3u64));
        assert_eq!(policy.on_write(&3, 1, &meta), Some(2));
        assert_eq!(policy.len(), 2);
    }

    #[test]
    fn test_cold_candidate_rejected_hot_retained() {
        let hasher = |k: &u64| ahash_of(k);
        let sketch = FrequencySketch::new(256, false);
        let mut policy = WTinyLfuPolicy::new(100);
        let meta = sketch_meta(&sketch, &hasher, 1);

        let hot = 7u64;
        sketch.increment(ahash_of(&hot));
        policy.on_write(&hot, 1, &meta);
        for _ in 0..50 {
            sketch.increment(ahash_of(&hot));
            policy.on_access(&hot, &meta);
        }

        let mut rejected = 0;
        for cold in 1000..1100u64 {
            sketch.increment(ahash_of(&cold));
            if policy.on_write(&cold, 1, &meta).is_some() {
                rejected += 1;
            }
        }

        // The hot key is in the main space and every cold candidate lost
        // its contest; only the window occupant remains besides it.
        assert!(rejected >= 98);
        assert_eq!(policy.len(), 2);
        assert!(policy.index.contains_key(&hot));
    }

    fn seed_frequency(sketch: &FrequencySketch, key: u64, count: u64) {
        for _ in 0..count {
            sketch.increment(ahash_of(&key));
        }
    }

    #[test]
    fn test_probation_promotes_to_protected() {
        let hasher = |k: &u64| ahash_of(k);
        let sketch = FrequencySketch::new(128, false);
        let mut policy = WTinyLfuPolicy::new(100);
        let meta = sketch_meta(&sketch, &hasher, 1);

        // Rising frequencies so each window candidate wins its contest.
        for key in 1..=4u64 {
            seed_frequency(&sketch, key, key);
            policy.on_write(&key, 1, &meta);
        }
        let (segment, _) = policy.index[&1];
        assert_eq!(segment, Segment::Probation);

        policy.on_access(&1, &meta);
        let (segment, _) = policy.index[&1];
        assert_eq!(segment, Segment::Protected);
    }

    #[test]
    fn test_protected_overflow_demotes() {
        let hasher = |k: &u64| ahash_of(k);
        let sketch = FrequencySketch::new(128, false);
        let mut policy = WTinyLfuPolicy::new(100);
        policy.protected_cap = 2;
        let meta = sketch_meta(&sketch, &hasher, 1);

        for key in 1..=4u64 {
            seed_frequency(&sketch, key, key);
            policy.on_write(&key, 1, &meta);
        }
        // Keys 1..=3 sit in probation; promote them all. The third
        // promotion overflows protected and demotes the coldest, key 1.
        for key in 1..=3u64 {
            policy.on_access(&key, &meta);
        }

        let (segment, _) = policy.index[&1];
        assert_eq!(segment, Segment::Probation);
        let (segment, _) = policy.index[&2];
        assert_eq!(segment, Segment::Protected);
        let (segment, _) = policy.index[&3];
        assert_eq!(segment, Segment::Protected);
    }

    #[test]
    fn test_victim_prefers_probation() {
        let hasher = |k: &u64| ahash_of(k);
        let sketch = FrequencySketch::new(128, false);
        let mut policy = WTinyLfuPolicy::new(100);
        let meta = sketch_meta(&sketch, &hasher, 1);

        for key in 1..=3u64 {
            seed_frequency(&sketch, key, key);
            policy.on_write(&key, 1, &meta);
        }
        // Probation holds 1 then 2 in admission order; 3 is the window
        // occupant and is only eligible once probation drains.
        assert_eq!(policy.select_victim(&meta), Some(1));
        policy.on_remove(&1);
        assert_eq!(policy.select_victim(&meta), Some(2));
        policy.on_remove(&2);
        assert_eq!(policy.select_victim(&meta), Some(3));
    }
}
