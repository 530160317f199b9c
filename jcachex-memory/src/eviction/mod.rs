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

pub mod composite;
pub mod fifo;
pub mod idle;
pub mod lfu;
pub mod lru;
pub mod tiny_lfu;
pub mod weight;

use jcachex_common::code::Key;

use crate::config::EvictionPolicyKind;
use crate::sketch::FrequencySketch;

use composite::CompositePolicy;
use fifo::FifoPolicy;
use idle::IdlePolicy;
use lfu::LfuPolicy;
use lru::LruPolicy;
use tiny_lfu::WTinyLfuPolicy;
use weight::WeightPolicy;

/// Context handed to policy callbacks.
pub struct AccessMeta<'a, K> {
    /// Hash of the key the callback is about.
    pub hash: u64,
    /// Current clock nanos.
    pub now: u64,
    pub(crate) sketch: Option<&'a FrequencySketch>,
    pub(crate) hasher: &'a dyn Fn(&K) -> u64,
}

impl<'a, K> AccessMeta<'a, K> {
    /// Sketch frequency estimate for an arbitrary key; zero without a sketch.
    pub fn frequency(&self, key: &K) -> u64 {
        match self.sketch {
            Some(sketch) => sketch.frequency((self.hasher)(key)),
            None => 0,
        }
    }

    pub fn frequency_of_hash(&self, hash: u64) -> u64 {
        match self.sketch {
            Some(sketch) => sketch.frequency(hash),
            None => 0,
        }
    }

    pub fn key_hash(&self, key: &K) -> u64 {
        (self.hasher)(key)
    }
}

/// Uniform contract implemented by every eviction strategy.
///
/// Policies order keys; the entries themselves stay owned by the store.
/// Callbacks are hints: a policy must tolerate writes it never saw and
/// removes for keys it does not track. `select_victim` returns a candidate
/// without unlinking it; the caller follows up with `on_remove` once the
/// store removal succeeds.
pub trait EvictionPolicy<K>: Send + 'static {
    fn on_access(&mut self, key: &K, meta: &AccessMeta<'_, K>);

    /// Register a write. May return a key the policy refuses to keep (an
    /// admission rejection); the caller evicts that key from the store.
    fn on_write(&mut self, key: &K, weight: u32, meta: &AccessMeta<'_, K>) -> Option<K>;

    fn on_remove(&mut self, key: &K);

    fn select_victim(&mut self, meta: &AccessMeta<'_, K>) -> Option<K>;

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tagged dispatch over the fixed policy set, with a `Custom` escape hatch
/// for user-supplied strategies.
pub(crate) enum Policy<K>
where
    K: Key,
{
    Lru(LruPolicy<K>),
    Lfu(LfuPolicy<K>),
    Fifo(FifoPolicy<K>),
    Filo(FifoPolicy<K>),
    Weight(WeightPolicy<K>),
    IdleTime(IdlePolicy<K>),
    WTinyLfu(WTinyLfuPolicy<K>),
    Composite(CompositePolicy<K>),
    Custom(Box<dyn EvictionPolicy<K>>),
}

impl<K> Policy<K>
where
    K: Key,
{
    pub fn from_kind(kind: &EvictionPolicyKind, capacity: usize) -> Self {
        match kind {
            EvictionPolicyKind::Lru => Self::Lru(LruPolicy::new()),
            EvictionPolicyKind::Lfu => Self::Lfu(LfuPolicy::new()),
            EvictionPolicyKind::Fifo => Self::Fifo(FifoPolicy::fifo()),
            EvictionPolicyKind::Filo => Self::Filo(FifoPolicy::filo()),
            EvictionPolicyKind::Weight => Self::Weight(WeightPolicy::new()),
            EvictionPolicyKind::IdleTime { idle } => Self::IdleTime(IdlePolicy::new(*idle)),
            EvictionPolicyKind::WTinyLfu => Self::WTinyLfu(WTinyLfuPolicy::new(capacity)),
            EvictionPolicyKind::Composite(kinds) => Self::Composite(CompositePolicy::new(
                kinds
                    .iter()
                    .map(|kind| Policy::from_kind(kind, capacity))
                    .collect(),
            )),
        }
    }

    fn as_dyn(&mut self) -> &mut dyn EvictionPolicy<K> {
        match self {
            Self::Lru(p) => p,
            Self::Lfu(p) => p,
            Self::Fifo(p) => p,
            Self::Filo(p) => p,
            Self::Weight(p) => p,
            Self::IdleTime(p) => p,
            Self::WTinyLfu(p) => p,
            Self::Composite(p) => p,
            Self::Custom(p) => p.as_mut(),
        }
    }
}

impl<K> EvictionPolicy<K> for Policy<K>
where
    K: Key,
{
    fn on_access(&mut self, key: &K, meta: &AccessMeta<'_, K>) {
        self.as_dyn().on_access(key, meta)
    }

    fn on_write(&mut self, key: &K, weight: u32, meta: &AccessMeta<'_, K>) -> Option<K> {
        self.as_dyn().on_write(key, weight, meta)
    }

    fn on_remove(&mut self, key: &K) {
        self.as_dyn().on_remove(key)
    }

    fn select_victim(&mut self, meta: &AccessMeta<'_, K>) -> Option<K> {
        self.as_dyn().select_victim(meta)
    }

    fn clear(&mut self) {
        self.as_dyn().clear()
    }

    fn len(&self) -> usize {
        match self {
            Self::Lru(p) => p.len(),
            Self::Lfu(p) => p.len(),
            Self::Fifo(p) => p.len(),
            Self::Filo(p) => p.len(),
            Self::Weight(p) => p.len(),
            Self::IdleTime(p) => p.len(),
            Self::WTinyLfu(p) => p.len(),
            Self::Composite(p) => p.len(),
            Self::Custom(p) => p.len(),
        }
    }
}

/// Sketch plus ordering state, guarded together by one mutex so that drain
/// and eviction observe a consistent view.
pub(crate) struct PolicyEngine<K>
where
    K: Key,
{
    pub policy: Policy<K>,
    pub sketch: Option<FrequencySketch>,
}
