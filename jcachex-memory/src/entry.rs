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

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Entry lifecycle state.
    ///
    /// `LIVE` entries are observable. `LOADING` marks an in-flight refresh on
    /// a still-live entry. `EXPIRED` and `TOMBSTONE` are transient marks set
    /// just before the record is physically removed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryState: u8 {
        const LIVE = 0b0001;
        const LOADING = 0b0010;
        const EXPIRED = 0b0100;
        const TOMBSTONE = 0b1000;
    }
}

/// A stored entry. The value and write-time metadata are owned by the shard
/// and mutated only under its write lock; the access fields are atomics so
/// the read path never upgrades to an exclusive lock.
pub(crate) struct EntryRecord<V> {
    pub value: V,
    pub weight: u32,
    pub created: u64,
    /// Absolute write-expiry deadline in clock nanos, `0` = none.
    pub expire_at: u64,
    /// Absolute refresh deadline in clock nanos, `0` = none.
    pub refresh_at: u64,
    pub last_access: AtomicU64,
    pub access_count: AtomicU64,
    state: AtomicU8,
}

impl<V> EntryRecord<V> {
    pub fn new(value: V, weight: u32, now: u64, expire_at: u64, refresh_at: u64) -> Self {
        Self {
            value,
            weight,
            created: now,
            expire_at,
            refresh_at,
            last_access: AtomicU64::new(now),
            access_count: AtomicU64::new(0),
            state: AtomicU8::new(EntryState::LIVE.bits()),
        }
    }

    pub fn state(&self) -> EntryState {
        EntryState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub fn is_live(&self) -> bool {
        self.state().contains(EntryState::LIVE)
    }

    /// Record a read. Returns the new access count.
    pub fn touch(&self, now: u64) -> u64 {
        self.last_access.store(now, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Mark the entry expired. Idempotent; returns `true` for the caller
    /// that performed the transition.
    pub fn mark_expired(&self) -> bool {
        let prev = self
            .state
            .fetch_or(EntryState::EXPIRED.bits(), Ordering::AcqRel);
        EntryState::from_bits_truncate(prev) & EntryState::EXPIRED == EntryState::empty()
    }

    pub fn is_expired_marked(&self) -> bool {
        self.state().contains(EntryState::EXPIRED)
    }

    /// Replace the value and renew write-time metadata in place, keeping
    /// the access history. Returns the displaced value and weight.
    pub fn renew(
        &mut self,
        value: V,
        weight: u32,
        now: u64,
        expire_at: u64,
        refresh_at: u64,
    ) -> (V, u32) {
        let old_value = std::mem::replace(&mut self.value, value);
        let old_weight = std::mem::replace(&mut self.weight, weight);
        self.created = now;
        self.expire_at = expire_at;
        self.refresh_at = refresh_at;
        self.state
            .store(EntryState::LIVE.bits(), Ordering::Release);
        (old_value, old_weight)
    }

    /// Mark the entry as removed. Set under the shard write lock right
    /// before the record leaves the map, so a racing reader that still holds
    /// a reference observes a dead entry.
    pub fn mark_tombstone(&self) {
        self.state
            .fetch_or(EntryState::TOMBSTONE.bits(), Ordering::AcqRel);
    }

    /// Claim the refresh slot. Only one reader wins per refresh cycle.
    pub fn try_begin_refresh(&self) -> bool {
        let prev = self
            .state
            .fetch_or(EntryState::LOADING.bits(), Ordering::AcqRel);
        EntryState::from_bits_truncate(prev) & EntryState::LOADING == EntryState::empty()
    }

    pub fn end_refresh(&self) {
        self.state
            .fetch_and(!EntryState::LOADING.bits(), Ordering::AcqRel);
    }
}
