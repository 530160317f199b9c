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

use std::collections::HashMap as StdHashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use jcachex_common::clock::Clock;
use jcachex_common::code::{HashBuilder, Key, Value};

use crate::buffer::{AccessBuffer, AccessKind, STRIPE_CAPACITY};
use crate::changes::{ChangeHub, EntryChange};
use crate::config::{EvictionPolicyKind, SketchKind};
use crate::entry::EntryRecord;
use crate::error::{Error, LoadPanic, Result};
use crate::eviction::{AccessMeta, EvictionPolicy, Policy, PolicyEngine};
use crate::expiry::{ExpiryPolicy, SweepCursor};
use crate::listener::{CacheEvent, CacheEventListener, EvictReason, ListenerId, ListenerRegistry};
use crate::metrics::{CacheStats, StatsRecorder};
use crate::pool::{self, WorkerPool};
use crate::scheduler::{self, MaintenanceTarget, MaintenanceTask, SchedulerHandle, DEFAULT_TICK};
use crate::sketch::FrequencySketch;
use crate::store::{BeginLoad, EntryStore, ReplaceOutcome};

/// Computes the weight charged for an entry. Defaults to a constant 1.
pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> u32 + Send + Sync + 'static>;

/// Synchronous value loader invoked on miss. `None` means "no value"; the
/// miss is returned to the caller and nothing is cached.
pub type Loader<K, V> = Arc<dyn Fn(&K) -> Option<V> + Send + Sync + 'static>;

/// Asynchronous value loader; exclusive with [`Loader`].
pub type AsyncLoader<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, Option<V>> + Send + Sync + 'static>;

/// Rejects keys before any operation touches the store.
pub type KeyValidator<K> = Arc<dyn Fn(&K) -> bool + Send + Sync + 'static>;

/// Sketch width fallback for unbounded caches.
const DEFAULT_CAPACITY_HINT: u64 = 16_384;

/// Worker queue slots per worker thread.
const WORKER_QUEUE_FACTOR: usize = 64;

enum WriteOrigin {
    Local,
    /// Change replicated from a peer: no frequency accounting, no
    /// republication on the change stream.
    External,
}

enum PendingEvent<K, V> {
    Evicted {
        key: K,
        value: V,
        reason: EvictReason,
    },
    Expired {
        key: K,
        value: V,
    },
}

struct CacheInner<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    store: EntryStore<K, V, S>,
    policy: Mutex<PolicyEngine<K>>,
    buffer: AccessBuffer<K>,
    stats: StatsRecorder,
    listeners: ListenerRegistry<K, V>,
    changes: ChangeHub<K, V>,
    expiry: ExpiryPolicy,
    sweep: SweepCursor,
    clock: Clock,

    maximum_size: Option<u64>,
    maximum_weight: Option<u64>,
    weigher: Option<Weigher<K, V>>,
    key_validator: Option<KeyValidator<K>>,
    loader: Option<Loader<K, V>>,
    async_loader: Option<AsyncLoader<K, V>>,

    maintenance_tx: flume::Sender<MaintenanceTask>,
    pool_tx: flume::Sender<pool::Job>,

    shutdown: AtomicBool,
    poisoned: AtomicBool,
}

struct CacheShared<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    inner: Arc<CacheInner<K, V, S>>,
    scheduler: Option<SchedulerHandle>,
    pool: Option<WorkerPool>,
}

impl<K, V, S> Drop for CacheShared<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        // SchedulerHandle and WorkerPool stop and join on drop.
        self.scheduler.take();
        self.pool.take();
    }
}

/// Thread-safe in-process cache.
///
/// Cloning is cheap and clones observe the same cache. The last clone to
/// drop stops the maintenance thread and the worker pool.
pub struct Cache<K, V, S = RandomState>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    shared: Arc<CacheShared<K, V, S>>,
}

impl<K, V, S> Clone for Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V> Cache<K, V, RandomState>
where
    K: Key,
    V: Value,
{
    pub fn builder() -> CacheBuilder<K, V, RandomState> {
        CacheBuilder::new()
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    fn inner(&self) -> &Arc<CacheInner<K, V, S>> {
        &self.shared.inner
    }

    /// Look the key up, consulting the configured loader on a miss.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let inner = self.inner();
        inner.check_open()?;
        inner.validate_key(key)?;
        let hash = inner.store.hash(key);
        if let Some(value) = inner.lookup(key, hash) {
            return Ok(Some(value));
        }
        match inner.loader.clone() {
            Some(loader) => inner.load_sync(key, hash, move |k| loader(k)),
            None => Ok(None),
        }
    }

    /// Look the key up, invoking `loader` under single-flight on a miss.
    pub fn get_or_load(&self, key: &K, loader: impl Fn(&K) -> Option<V>) -> Result<Option<V>> {
        let inner = self.inner();
        inner.check_open()?;
        inner.validate_key(key)?;
        let hash = inner.store.hash(key);
        if let Some(value) = inner.lookup(key, hash) {
            return Ok(Some(value));
        }
        inner.load_sync(key, hash, loader)
    }

    /// Asynchronous lookup. Hits complete immediately on the caller;
    /// misses run the configured loader on the shared worker pool.
    pub fn fetch(&self, key: K) -> Fetch<V> {
        self.fetch_inner(key, None)
    }

    /// Like [`fetch`](Self::fetch), but the load completes with
    /// [`Error::Timeout`] if it cannot start before the deadline. A loader
    /// that already started is not cancelled and may still populate the
    /// cache.
    pub fn fetch_with_timeout(&self, key: K, timeout: Duration) -> Fetch<V> {
        self.fetch_inner(key, Some(Instant::now() + timeout))
    }

    fn fetch_inner(&self, key: K, deadline: Option<Instant>) -> Fetch<V> {
        let inner = self.inner();
        if let Err(err) = inner.check_open().and_then(|_| inner.validate_key(&key)) {
            return Fetch::Error(Some(err));
        }
        let hash = inner.store.hash(&key);
        if let Some(value) = inner.lookup(&key, hash) {
            return Fetch::Hit(Some(value));
        }
        if inner.loader.is_none() && inner.async_loader.is_none() {
            return Fetch::Hit(None);
        }
        inner.load_async(key, hash, deadline)
    }

    pub fn put(&self, key: K, value: V) -> Result<()> {
        let inner = self.inner();
        inner.check_open()?;
        inner.validate_key(&key)?;
        inner.put_value(key, value, WriteOrigin::Local)?;
        Ok(())
    }

    /// Insert only when absent. Returns whether the value was inserted.
    pub fn put_if_absent(&self, key: K, value: V) -> Result<bool> {
        let inner = self.inner();
        inner.check_open()?;
        inner.validate_key(&key)?;
        inner.put_if_absent_value(key, value)
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let inner = self.inner();
        inner.check_open()?;
        inner.validate_key(key)?;
        Ok(inner.remove_value(key))
    }

    pub fn contains(&self, key: &K) -> bool {
        let inner = self.inner();
        if inner.validate_key(key).is_err() {
            return false;
        }
        let hash = inner.store.hash(key);
        let now = inner.clock.now();
        inner
            .store
            .with_record(hash, key, |record| {
                record.is_live()
                    && !record.is_expired_marked()
                    && !inner.expiry.is_expired(record, now)
            })
            .unwrap_or(false)
    }

    /// Number of live entries. May transiently lag in-flight writes.
    pub fn size(&self) -> u64 {
        self.inner().store.size()
    }

    /// Total weight of live entries.
    pub fn weight(&self) -> u64 {
        self.inner().store.weight()
    }

    pub fn clear(&self) -> Result<()> {
        let inner = self.inner();
        inner.check_open()?;
        inner.clear_all();
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        self.inner().stats.snapshot()
    }

    /// Snapshot of live, unexpired entries. Every returned entry's
    /// deadline (if any) was strictly in the future when the snapshot
    /// started.
    pub fn entries(&self) -> Vec<(K, V)> {
        let inner = self.inner();
        let now = inner.clock.now();
        inner.store.snapshot(|_, record| {
            record.is_live()
                && !record.is_expired_marked()
                && inner.expiry.deadline(record).map_or(true, |d| d > now)
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheEventListener<K, V>>) -> ListenerId {
        self.inner().listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner().listeners.remove(id)
    }

    pub fn bulk_get(&self, keys: &[K]) -> Result<StdHashMap<K, V>> {
        let mut out = StdHashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key)? {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }

    pub fn bulk_put(&self, entries: Vec<(K, V)>) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value)?;
        }
        Ok(())
    }

    /// Remove each key; returns how many were present.
    pub fn bulk_remove(&self, keys: &[K]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            if self.remove(key)?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Subscribe to locally-originated mutations, for replication.
    pub fn subscribe_changes(&self) -> flume::Receiver<EntryChange<K, V>> {
        self.inner().changes.subscribe()
    }

    /// Apply a change that originated on a peer. Bypasses frequency
    /// accounting and is not republished on the change stream.
    pub fn apply_external_change(&self, change: EntryChange<K, V>) -> Result<()> {
        let inner = self.inner();
        inner.check_open()?;
        match change {
            EntryChange::Put { key, value } => {
                inner.validate_key(&key)?;
                inner.put_value(key, value, WriteOrigin::External)?;
            }
            EntryChange::Remove { key } => {
                inner.validate_key(&key)?;
                inner.remove_external(&key);
            }
            EntryChange::Clear => inner.clear_all(),
        }
        Ok(())
    }

    /// Begin shutdown: subsequent operations fail fast with
    /// [`Error::ShuttingDown`]; in-flight maintenance finishes.
    pub fn close(&self) {
        let inner = self.inner();
        if !inner.shutdown.swap(true, Ordering::AcqRel) {
            let _ = inner.maintenance_tx.send(MaintenanceTask::Stop);
        }
    }

    /// Force one maintenance cycle on the calling thread. Test and
    /// shutdown aid; production traffic relies on the scheduler.
    pub fn run_maintenance(&self) {
        let inner = self.inner();
        inner.drain();
        inner.sweep();
        inner.evict();
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Key,
    V: Value + PartialEq,
    S: HashBuilder + Clone,
{
    /// Compare-and-swap the value for `key`. Returns whether the swap
    /// happened.
    pub fn replace(&self, key: &K, expected: &V, new: V) -> Result<bool> {
        let inner = self.inner();
        inner.check_open()?;
        inner.validate_key(key)?;
        Ok(inner.replace_value(key, expected, new))
    }

    /// Remove only if the current value equals `expected`.
    pub fn remove_if(&self, key: &K, expected: &V) -> Result<bool> {
        let inner = self.inner();
        inner.check_open()?;
        inner.validate_key(key)?;

        let hash = inner.store.hash(key);
        let now = inner.clock.now();
        let removed = inner.store.remove_if(hash, key, |record| {
            record.value == *expected && !inner.expiry.is_expired(record, now)
        });
        match removed {
            None => Ok(false),
            Some(record) => {
                let _ = inner.with_engine(|engine| engine.policy.on_remove(key));
                inner.listeners.dispatch(&CacheEvent::Remove {
                    key: key.clone(),
                    value: record.value,
                });
                inner.changes.publish(EntryChange::Remove { key: key.clone() });
                Ok(true)
            }
        }
    }
}

impl<K, V, S> CacheInner<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    fn check_open(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::Poisoned("cache previously poisoned"));
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn validate_key(&self, key: &K) -> Result<()> {
        match &self.key_validator {
            Some(validator) if !validator(key) => Err(Error::InvalidKey),
            _ => Ok(()),
        }
    }

    fn weigh(&self, key: &K, value: &V) -> u32 {
        match &self.weigher {
            Some(weigher) => weigher(key, value),
            None => 1,
        }
    }

    fn refreshable(&self) -> bool {
        self.expiry.refresh_enabled() && (self.loader.is_some() || self.async_loader.is_some())
    }

    /// Run `f` under the policy lock with panic isolation. A panic inside
    /// policy code leaves the ordering state unknown, so it poisons the
    /// cache.
    fn with_engine<R>(&self, f: impl FnOnce(&mut PolicyEngine<K>) -> R) -> Result<R> {
        let mut guard = self.policy.lock();
        catch_unwind(AssertUnwindSafe(|| f(&mut guard))).map_err(|_| {
            self.poisoned.store(true, Ordering::Release);
            tracing::error!("eviction policy panicked; cache poisoned");
            Error::Poisoned("eviction policy panicked")
        })
    }

    /// Read path. Returns the value on a live hit and performs all hit
    /// bookkeeping; records a miss otherwise.
    fn lookup(self: &Arc<Self>, key: &K, hash: u64) -> Option<V> {
        let now = self.clock.now();
        let mut expired = false;
        let mut refresh = false;
        let value = self
            .store
            .with_record(hash, key, |record| {
                self.observe_hit(record, now, &mut expired, &mut refresh)
            })
            .flatten();

        match value {
            Some(value) => {
                self.stats.record_hit();
                if !self.buffer.record(key.clone(), hash, AccessKind::Read) {
                    self.nudge(MaintenanceTask::Drain);
                }
                if refresh {
                    self.spawn_refresh(key.clone(), hash);
                }
                self.maybe_nudge();
                Some(value)
            }
            None => {
                if expired {
                    // Eager expiry: the read observes a miss immediately;
                    // the drain physically reaps the entry.
                    self.buffer.record(key.clone(), hash, AccessKind::Evict);
                    self.nudge(MaintenanceTask::Drain);
                }
                self.stats.record_miss();
                None
            }
        }
    }

    /// Hit bookkeeping shared by the read path and the single-flight
    /// re-check. Returns the value for a live, unexpired record.
    fn observe_hit(
        &self,
        record: &EntryRecord<V>,
        now: u64,
        expired: &mut bool,
        refresh: &mut bool,
    ) -> Option<V> {
        if !record.is_live() || record.is_expired_marked() {
            return None;
        }
        if self.expiry.is_expired(record, now) {
            record.mark_expired();
            *expired = true;
            return None;
        }
        record.touch(now);
        if record.refresh_at != 0
            && now >= record.refresh_at
            && self.refreshable()
            && record.try_begin_refresh()
        {
            *refresh = true;
        }
        Some(record.value.clone())
    }

    /// Register one write with the sketch and the policy, evicting an
    /// admission reject if the policy returns one. Engine lock held.
    #[allow(clippy::too_many_arguments)]
    fn apply_write_locked(
        &self,
        policy: &mut Policy<K>,
        sketch: Option<&FrequencySketch>,
        key: &K,
        hash: u64,
        weight: u32,
        count_frequency: bool,
        now: u64,
        pending: &mut Vec<PendingEvent<K, V>>,
    ) {
        if count_frequency {
            if let Some(sketch) = sketch {
                sketch.increment(hash);
            }
        }
        let hasher = |k: &K| self.store.hash(k);
        let meta = AccessMeta {
            hash,
            now,
            sketch,
            hasher: &hasher,
        };
        if let Some(rejected) = policy.on_write(key, weight, &meta) {
            policy.on_remove(&rejected);
            let rhash = self.store.hash(&rejected);
            if let Some(prior) = self.store.remove(rhash, &rejected) {
                self.stats.record_eviction(prior.weight);
                pending.push(PendingEvent::Evicted {
                    key: rejected,
                    value: prior.value,
                    reason: EvictReason::Size,
                });
            }
        }
    }

    /// Apply buffered access records to the sketch and the policy. Must be
    /// called with the engine lock held; eviction decisions made here are
    /// returned as pending events.
    fn drain_locked(&self, engine: &mut PolicyEngine<K>, pending: &mut Vec<PendingEvent<K, V>>) {
        let now = self.clock.now();
        let PolicyEngine { policy, sketch } = engine;
        let sketch = sketch.as_ref();
        let hasher = |k: &K| self.store.hash(k);

        self.buffer.drain(usize::MAX, |record| {
            match record.kind {
                AccessKind::Read => {
                    if let Some(sketch) = sketch {
                        sketch.increment(record.hash);
                    }
                    let meta = AccessMeta {
                        hash: record.hash,
                        now,
                        sketch,
                        hasher: &hasher,
                    };
                    policy.on_access(&record.key, &meta);
                }
                AccessKind::Write(weight) => {
                    self.apply_write_locked(
                        policy, sketch, &record.key, record.hash, weight, true, now, pending,
                    );
                }
                AccessKind::ExternalWrite(weight) => {
                    self.apply_write_locked(
                        policy, sketch, &record.key, record.hash, weight, false, now, pending,
                    );
                }
                AccessKind::Evict => {
                    let removed = self.store.remove_if(record.hash, &record.key, |r| {
                        r.is_expired_marked() || self.expiry.is_expired(r, now)
                    });
                    if let Some(prior) = removed {
                        policy.on_remove(&record.key);
                        self.stats.record_expiration();
                        pending.push(PendingEvent::Expired {
                            key: record.key,
                            value: prior.value,
                        });
                    }
                }
            }
        });
    }

    /// Evict until the configured bounds hold. `incoming` describes a write
    /// that is about to land: (key, projected extra weight).
    fn enforce_bounds(
        &self,
        engine: &mut PolicyEngine<K>,
        incoming: Option<(&K, u64)>,
        pending: &mut Vec<PendingEvent<K, V>>,
    ) -> Result<()> {
        if self.maximum_size.is_none() && self.maximum_weight.is_none() {
            return Ok(());
        }
        let now = self.clock.now();
        let (incoming_key, extra_size, extra_weight) = match incoming {
            Some((key, add_weight)) => {
                let hash = self.store.hash(key);
                match self.store.peek_weight(hash, key) {
                    Some(prior) => (Some(key), 0u64, add_weight.saturating_sub(prior as u64)),
                    None => (Some(key), 1u64, add_weight),
                }
            }
            None => (None, 0, 0),
        };

        loop {
            let projected_size = self.store.size() + extra_size;
            let projected_weight = self.store.weight() + extra_weight;
            let over_size = self.maximum_size.is_some_and(|m| projected_size > m);
            let over_weight = self.maximum_weight.is_some_and(|m| projected_weight > m);
            if !over_size && !over_weight {
                return Ok(());
            }
            let reason = if over_size {
                EvictReason::Size
            } else {
                EvictReason::Weight
            };

            let PolicyEngine { policy, sketch } = engine;
            let hasher = |k: &K| self.store.hash(k);
            let meta = AccessMeta {
                hash: 0,
                now,
                sketch: sketch.as_ref(),
                hasher: &hasher,
            };
            let Some(victim) = policy.select_victim(&meta) else {
                return Err(Error::CapacityExceeded);
            };
            policy.on_remove(&victim);
            if incoming_key == Some(&victim) {
                // Never evict the key being written; its slot is reused.
                continue;
            }
            let vhash = self.store.hash(&victim);
            if let Some(prior) = self.store.remove(vhash, &victim) {
                self.stats.record_eviction(prior.weight);
                pending.push(PendingEvent::Evicted {
                    key: victim,
                    value: prior.value,
                    reason,
                });
            }
        }
    }

    fn put_value(self: &Arc<Self>, key: K, value: V, origin: WriteOrigin) -> Result<()> {
        let hash = self.store.hash(&key);
        let weight = self.weigh(&key, &value);
        let mut pending = Vec::new();

        if self.maximum_size == Some(0) {
            return Err(Error::CapacityExceeded);
        }
        let (room, mut events) = self.with_engine(|engine| {
            let mut events = Vec::new();
            self.drain_locked(engine, &mut events);
            let room = self.enforce_bounds(engine, Some((&key, weight as u64)), &mut events);
            (room, events)
        })?;
        pending.append(&mut events);
        if let Err(err) = room {
            // Evictions performed before the policy ran dry still happened.
            self.flush_pending(pending);
            return Err(err);
        }

        let now = self.clock.now();
        let record = EntryRecord::new(
            value.clone(),
            weight,
            now,
            self.expiry.write_deadline(now),
            self.expiry.refresh_deadline(now),
        );
        let prior = self.store.insert(hash, key.clone(), record);

        let count_frequency = matches!(origin, WriteOrigin::Local);
        let kind = match origin {
            WriteOrigin::Local => AccessKind::Write(weight),
            WriteOrigin::External => AccessKind::ExternalWrite(weight),
        };
        if !self.buffer.record(key.clone(), hash, kind) {
            // The ring is full; register inline so the entry is never
            // invisible to the policy.
            let _ = self
                .with_engine(|engine| {
                    let mut events = Vec::new();
                    self.drain_locked(engine, &mut events);
                    let now = self.clock.now();
                    let PolicyEngine { policy, sketch } = engine;
                    self.apply_write_locked(
                        policy,
                        sketch.as_ref(),
                        &key,
                        hash,
                        weight,
                        count_frequency,
                        now,
                        &mut events,
                    );
                    events
                })
                .map(|mut events| pending.append(&mut events));
            self.nudge(MaintenanceTask::Drain);
        }

        if let Some(prior) = prior {
            let now = self.clock.now();
            if prior.is_expired_marked() || self.expiry.is_expired(&prior, now) {
                self.stats.record_expiration();
                pending.push(PendingEvent::Expired {
                    key: key.clone(),
                    value: prior.value,
                });
            } else {
                pending.push(PendingEvent::Evicted {
                    key: key.clone(),
                    value: prior.value,
                    reason: EvictReason::Replaced,
                });
            }
        }

        self.flush_pending(pending);
        self.listeners.dispatch(&CacheEvent::Put {
            key: key.clone(),
            value: value.clone(),
        });
        if matches!(origin, WriteOrigin::Local) {
            self.changes.publish(EntryChange::Put { key, value });
        }
        self.maybe_nudge();
        Ok(())
    }

    fn put_if_absent_value(self: &Arc<Self>, key: K, value: V) -> Result<bool> {
        let hash = self.store.hash(&key);
        let now = self.clock.now();
        let present = self
            .store
            .with_record(hash, &key, |record| {
                record.is_live()
                    && !record.is_expired_marked()
                    && !self.expiry.is_expired(record, now)
            })
            .unwrap_or(false);
        if present {
            return Ok(false);
        }
        self.put_value(key, value, WriteOrigin::Local)?;
        Ok(true)
    }

    fn remove_value(self: &Arc<Self>, key: &K) -> Option<V> {
        let hash = self.store.hash(key);
        let record = self.store.remove(hash, key)?;
        let _ = self.with_engine(|engine| engine.policy.on_remove(key));
        self.listeners.dispatch(&CacheEvent::Remove {
            key: key.clone(),
            value: record.value.clone(),
        });
        self.changes.publish(EntryChange::Remove { key: key.clone() });
        Some(record.value)
    }

    /// Peer-initiated removal: same store/policy effect as a local remove,
    /// surfaced to listeners as an eviction on external behalf.
    fn remove_external(self: &Arc<Self>, key: &K) {
        let hash = self.store.hash(key);
        if let Some(record) = self.store.remove(hash, key) {
            let _ = self.with_engine(|engine| engine.policy.on_remove(key));
            self.listeners.dispatch(&CacheEvent::Evict {
                key: key.clone(),
                value: record.value,
                reason: EvictReason::Explicit,
            });
        }
    }

    fn clear_all(self: &Arc<Self>) {
        let _ = self.with_engine(|engine| {
            // Discard stale hints so cleared keys are not resurrected in
            // the order structures.
            self.buffer.drain(usize::MAX, |_| {});
            engine.policy.clear();
            if let Some(sketch) = &engine.sketch {
                sketch.clear();
            }
        });
        self.store.clear();
        self.listeners.dispatch(&CacheEvent::Clear);
        self.changes.publish(EntryChange::Clear);
    }

    fn replace_value(self: &Arc<Self>, key: &K, expected: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let hash = self.store.hash(key);
        let now = self.clock.now();
        let weight = self.weigh(key, &new);
        let outcome = self.store.replace_if(
            hash,
            key,
            |record| record.value == *expected && !self.expiry.is_expired(record, now),
            new.clone(),
            weight,
            now,
            self.expiry.write_deadline(now),
            self.expiry.refresh_deadline(now),
        );
        match outcome {
            ReplaceOutcome::Replaced { old_value, .. } => {
                if !self
                    .buffer
                    .record(key.clone(), hash, AccessKind::Write(weight))
                {
                    self.nudge(MaintenanceTask::Drain);
                }
                self.listeners.dispatch(&CacheEvent::Evict {
                    key: key.clone(),
                    value: old_value,
                    reason: EvictReason::Replaced,
                });
                self.listeners.dispatch(&CacheEvent::Put {
                    key: key.clone(),
                    value: new.clone(),
                });
                self.changes.publish(EntryChange::Put {
                    key: key.clone(),
                    value: new,
                });
                self.maybe_nudge();
                true
            }
            _ => false,
        }
    }

    /// Single-flight synchronous load. The caller has already recorded the
    /// initial miss.
    fn load_sync(
        self: &Arc<Self>,
        key: &K,
        hash: u64,
        loader: impl Fn(&K) -> Option<V>,
    ) -> Result<Option<V>> {
        let now = self.clock.now();
        let mut refresh = false;
        let begin = self.store.begin_load(hash, key, |record| {
            let mut expired = false;
            self.observe_hit(record, now, &mut expired, &mut refresh)
        });
        match begin {
            BeginLoad::Hit(value) => {
                if refresh {
                    self.spawn_refresh(key.clone(), hash);
                }
                Ok(Some(value))
            }
            BeginLoad::Waiter(rx) => rx
                .blocking_recv()
                .map_err(|_| Error::load(LoadPanic("load leader abandoned".to_string()))),
            BeginLoad::Leader => self.run_load(key.clone(), hash, |k| loader(k)),
        }
    }

    /// Execute the loader as the single-flight leader and publish the
    /// result to every waiter.
    fn run_load(
        self: &Arc<Self>,
        key: K,
        hash: u64,
        loader: impl FnOnce(&K) -> Option<V>,
    ) -> Result<Option<V>> {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| loader(&key)));
        let elapsed = started.elapsed().as_nanos() as u64;

        match outcome {
            Ok(Some(value)) => {
                self.stats.record_load_success(elapsed);
                if let Err(err) = self.put_value(key.clone(), value.clone(), WriteOrigin::Local) {
                    tracing::warn!(error = %err, "loaded value could not be cached");
                }
                self.listeners
                    .dispatch(&CacheEvent::LoadSuccess { key: key.clone() });
                self.notify_waiters(hash, &key, Some(value.clone()));
                Ok(Some(value))
            }
            Ok(None) => {
                // A declined load is a plain miss; nothing is cached.
                self.notify_waiters(hash, &key, None);
                Ok(None)
            }
            Err(payload) => {
                self.stats.record_load_failure(elapsed);
                self.listeners
                    .dispatch(&CacheEvent::LoadFailure { key: key.clone() });
                self.notify_waiters(hash, &key, None);
                Err(Error::load(LoadPanic::from_payload(payload)))
            }
        }
    }

    fn notify_waiters(&self, hash: u64, key: &K, value: Option<V>) {
        for tx in self.store.finish_load(hash, key) {
            let _ = tx.send(value.clone());
        }
    }

    /// Single-flight asynchronous load on the worker pool.
    fn load_async(self: &Arc<Self>, key: K, hash: u64, deadline: Option<Instant>) -> Fetch<V> {
        let now = self.clock.now();
        let mut refresh = false;
        let begin = self.store.begin_load(hash, &key, |record| {
            let mut expired = false;
            self.observe_hit(record, now, &mut expired, &mut refresh)
        });
        match begin {
            BeginLoad::Hit(value) => {
                if refresh {
                    self.spawn_refresh(key, hash);
                }
                Fetch::Hit(Some(value))
            }
            BeginLoad::Waiter(rx) => Fetch::Wait(rx),
            BeginLoad::Leader => {
                let (tx, rx) = oneshot::channel();
                let inner = self.clone();
                let job = move || {
                    if deadline.is_some_and(|d| Instant::now() > d) {
                        inner.notify_waiters(hash, &key, None);
                        let _ = tx.send(Err(Error::Timeout));
                        return;
                    }
                    let result = inner.run_load(key, hash, |k| inner.invoke_any_loader(k));
                    let _ = tx.send(result);
                };
                match pool::submit(&self.pool_tx, job) {
                    Ok(()) => Fetch::Load(rx),
                    Err(err) => Fetch::Error(Some(err)),
                }
            }
        }
    }

    /// Run whichever loader is configured, driving an async loader to
    /// completion on this worker thread.
    fn invoke_any_loader(&self, key: &K) -> Option<V> {
        if let Some(loader) = &self.async_loader {
            futures::executor::block_on(loader(key.clone()))
        } else if let Some(loader) = &self.loader {
            loader(key)
        } else {
            None
        }
    }

    /// Kick off the refresh-after-write reload; the claiming reader keeps
    /// serving the stale value meanwhile.
    fn spawn_refresh(self: &Arc<Self>, key: K, hash: u64) {
        let inner = self.clone();
        let retry_key = key.clone();
        let job = move || inner.run_refresh(key, hash);
        if pool::submit(&self.pool_tx, job).is_err() {
            // Could not schedule; release the claim so a later read retries.
            let _ = self
                .store
                .with_record(hash, &retry_key, |record| record.end_refresh());
        }
    }

    fn run_refresh(self: &Arc<Self>, key: K, hash: u64) {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.invoke_any_loader(&key)));
        let elapsed = started.elapsed().as_nanos() as u64;

        match outcome {
            Ok(Some(value)) => {
                self.stats.record_load_success(elapsed);
                let now = self.clock.now();
                let weight = self.weigh(&key, &value);
                let replaced = self.store.replace_if(
                    hash,
                    &key,
                    |_| true,
                    value.clone(),
                    weight,
                    now,
                    self.expiry.write_deadline(now),
                    self.expiry.refresh_deadline(now),
                );
                match replaced {
                    ReplaceOutcome::Replaced { .. } => {
                        if !self
                            .buffer
                            .record(key.clone(), hash, AccessKind::Write(weight))
                        {
                            self.nudge(MaintenanceTask::Drain);
                        }
                        self.listeners
                            .dispatch(&CacheEvent::LoadSuccess { key: key.clone() });
                        self.changes.publish(EntryChange::Put { key, value });
                    }
                    // Removed while the reload ran; do not resurrect it.
                    _ => {}
                }
            }
            Ok(None) => {
                let _ = self.store.with_record(hash, &key, |record| record.end_refresh());
            }
            Err(_) => {
                self.stats.record_load_failure(elapsed);
                self.listeners.dispatch(&CacheEvent::LoadFailure { key: key.clone() });
                let _ = self.store.with_record(hash, &key, |record| record.end_refresh());
            }
        }
    }

    fn flush_pending(&self, pending: Vec<PendingEvent<K, V>>) {
        if pending.is_empty() {
            return;
        }
        let has_listeners = !self.listeners.is_empty();
        for event in pending {
            if !has_listeners {
                continue;
            }
            match event {
                PendingEvent::Evicted { key, value, reason } => {
                    self.listeners
                        .dispatch(&CacheEvent::Evict { key, value, reason });
                }
                PendingEvent::Expired { key, value } => {
                    self.listeners.dispatch(&CacheEvent::Expire { key, value });
                }
            }
        }
    }

    fn nudge(&self, task: MaintenanceTask) {
        let _ = self.maintenance_tx.try_send(task);
    }

    fn maybe_nudge(&self) {
        if self.buffer.occupancy() > STRIPE_CAPACITY {
            self.nudge(MaintenanceTask::Drain);
        }
        if let Some(max) = self.maximum_size {
            // Entry count more than 5% over the bound.
            if self.store.size() * 20 > max * 21 {
                self.nudge(MaintenanceTask::Evict);
            }
        }
    }
}

impl<K, V, S> MaintenanceTarget for CacheInner<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    fn drain(&self) {
        let pending = {
            let mut engine = self.policy.lock();
            let mut pending = Vec::new();
            self.drain_locked(&mut engine, &mut pending);
            pending
        };
        self.flush_pending(pending);
    }

    fn age_sketch(&self) {
        let engine = self.policy.lock();
        if let Some(sketch) = &engine.sketch {
            sketch.maybe_age();
        }
    }

    fn sweep(&self) {
        if !self.expiry.any_expiry() {
            return;
        }
        let shard = self.sweep.advance(self.store.shard_count());
        let now = self.clock.now();
        let mut expired_keys = Vec::new();
        self.store.scan_shard(shard, |key, record| {
            if record.is_expired_marked() || self.expiry.is_expired(record, now) {
                expired_keys.push((key.clone(), self.store.hash(key)));
            }
        });
        if expired_keys.is_empty() {
            return;
        }

        let mut pending = Vec::new();
        {
            let mut engine = self.policy.lock();
            for (key, hash) in expired_keys {
                let removed = self.store.remove_if(hash, &key, |record| {
                    record.is_expired_marked() || self.expiry.is_expired(record, now)
                });
                if let Some(record) = removed {
                    engine.policy.on_remove(&key);
                    self.stats.record_expiration();
                    pending.push(PendingEvent::Expired {
                        key,
                        value: record.value,
                    });
                }
            }
        }
        self.flush_pending(pending);
    }

    fn evict(&self) {
        let pending = {
            let mut engine = self.policy.lock();
            let mut pending = Vec::new();
            self.drain_locked(&mut engine, &mut pending);
            // No victim for an over-full cache is a steady state here; the
            // next write surfaces it as an error.
            let _ = self.enforce_bounds(&mut engine, None, &mut pending);
            pending
        };
        self.flush_pending(pending);
    }

    fn publish_stats(&self) {
        let stats = self.stats.snapshot();
        tracing::trace!(
            hits = stats.hit_count,
            misses = stats.miss_count,
            evictions = stats.eviction_count,
            expirations = stats.expiration_count,
            dropped_records = self.buffer.dropped(),
            size = self.store.size(),
            weight = self.store.weight(),
            "cache stats"
        );
    }

    fn on_task_disabled(&self) {
        self.stats.set_degraded();
    }
}

/// Pending result of an asynchronous lookup.
///
/// Hits resolve immediately; `Wait` joins an in-flight load by another
/// caller; `Load` owns a load running on the worker pool.
pub enum Fetch<V> {
    Invalid,
    Hit(Option<V>),
    Error(Option<Error>),
    Wait(oneshot::Receiver<Option<V>>),
    Load(oneshot::Receiver<Result<Option<V>>>),
}

impl<V> Default for Fetch<V> {
    fn default() -> Self {
        Self::Invalid
    }
}

impl<V> Unpin for Fetch<V> {}

impl<V> Future for Fetch<V> {
    type Output = Result<Option<V>>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        match &mut *self {
            Self::Invalid => unreachable!("fetch polled after completion"),
            Self::Hit(_) => std::task::Poll::Ready(Ok(match std::mem::take(&mut *self) {
                Fetch::Hit(value) => value,
                _ => unreachable!(),
            })),
            Self::Error(err) => {
                let err = err.take().expect("error already taken");
                std::task::Poll::Ready(Err(err))
            }
            Self::Wait(rx) => rx
                .poll_unpin(cx)
                .map(|result| {
                    result.map_err(|_| Error::load(LoadPanic("load leader abandoned".to_string())))
                }),
            Self::Load(rx) => rx.poll_unpin(cx).map(|result| {
                result
                    .unwrap_or_else(|_| Err(Error::load(LoadPanic("load worker died".to_string()))))
            }),
        }
    }
}

/// Declarative cache construction. Every option from the operation surface
/// lives here; `build` wires the store, policy engine, maintenance thread
/// and worker pool together.
pub struct CacheBuilder<K, V, S = RandomState>
where
    K: Key,
    V: Value,
{
    maximum_size: Option<u64>,
    maximum_weight: Option<u64>,
    weigher: Option<Weigher<K, V>>,
    expire_after_write: Option<Duration>,
    expire_after_access: Option<Duration>,
    refresh_after_write: Option<Duration>,
    policy_kind: EvictionPolicyKind,
    custom_policy: Option<Box<dyn EvictionPolicy<K>>>,
    sketch_kind: SketchKind,
    record_stats: bool,
    loader: Option<Loader<K, V>>,
    async_loader: Option<AsyncLoader<K, V>>,
    listeners: Vec<Arc<dyn CacheEventListener<K, V>>>,
    key_validator: Option<KeyValidator<K>>,
    shards: Option<usize>,
    tick: Duration,
    worker_threads: Option<usize>,
    hash_builder: S,
}

impl<K, V> Default for CacheBuilder<K, V, RandomState>
where
    K: Key,
    V: Value,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CacheBuilder<K, V, RandomState>
where
    K: Key,
    V: Value,
{
    pub fn new() -> Self {
        Self {
            maximum_size: None,
            maximum_weight: None,
            weigher: None,
            expire_after_write: None,
            expire_after_access: None,
            refresh_after_write: None,
            policy_kind: EvictionPolicyKind::default(),
            custom_policy: None,
            sketch_kind: SketchKind::default(),
            record_stats: false,
            loader: None,
            async_loader: None,
            listeners: Vec::new(),
            key_validator: None,
            shards: None,
            tick: DEFAULT_TICK,
            worker_threads: None,
            hash_builder: RandomState::default(),
        }
    }
}

impl<K, V, S> CacheBuilder<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    /// Bound the number of live entries; enables size-based eviction.
    pub fn maximum_size(mut self, max: u64) -> Self {
        self.maximum_size = Some(max);
        self
    }

    /// Bound the total entry weight; enables weight-based eviction. A
    /// weigher that returns 0 for every entry disables weight eviction in
    /// practice, since the total never grows.
    pub fn maximum_weight(mut self, max: u64) -> Self {
        self.maximum_weight = Some(max);
        self
    }

    pub fn weigher(mut self, weigher: impl Fn(&K, &V) -> u32 + Send + Sync + 'static) -> Self {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    /// Expire entries a fixed duration after they were written.
    pub fn expire_after_write(mut self, d: Duration) -> Self {
        self.expire_after_write = Some(d);
        self
    }

    /// Expire entries a fixed duration after their last read. The sliding
    /// deadline derives from an atomic last-access timestamp updated on
    /// every read, so it never lags the true access time.
    pub fn expire_after_access(mut self, d: Duration) -> Self {
        self.expire_after_access = Some(d);
        self
    }

    /// Past this deadline, the next read still returns the current value
    /// and schedules an asynchronous reload through the configured loader.
    pub fn refresh_after_write(mut self, d: Duration) -> Self {
        self.refresh_after_write = Some(d);
        self
    }

    pub fn eviction_policy(mut self, kind: EvictionPolicyKind) -> Self {
        self.policy_kind = kind;
        self
    }

    /// Use a caller-supplied eviction strategy instead of a built-in kind.
    pub fn custom_eviction_policy(mut self, policy: Box<dyn EvictionPolicy<K>>) -> Self {
        self.custom_policy = Some(policy);
        self
    }

    pub fn sketch(mut self, kind: SketchKind) -> Self {
        self.sketch_kind = kind;
        self
    }

    pub fn record_stats(mut self, enabled: bool) -> Self {
        self.record_stats = enabled;
        self
    }

    pub fn loader(mut self, loader: impl Fn(&K) -> Option<V> + Send + Sync + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    pub fn async_loader(
        mut self,
        loader: impl Fn(K) -> BoxFuture<'static, Option<V>> + Send + Sync + 'static,
    ) -> Self {
        self.async_loader = Some(Arc::new(loader));
        self
    }

    pub fn add_listener(mut self, listener: Arc<dyn CacheEventListener<K, V>>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn key_validator(
        mut self,
        validator: impl Fn(&K) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.key_validator = Some(Arc::new(validator));
        self
    }

    /// Number of store stripes; rounded up to a power of two, capped at 64.
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Maintenance wall-clock tick.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = Some(workers);
        self
    }

    pub fn hash_builder<S2>(self, hash_builder: S2) -> CacheBuilder<K, V, S2>
    where
        S2: HashBuilder + Clone,
    {
        CacheBuilder {
            maximum_size: self.maximum_size,
            maximum_weight: self.maximum_weight,
            weigher: self.weigher,
            expire_after_write: self.expire_after_write,
            expire_after_access: self.expire_after_access,
            refresh_after_write: self.refresh_after_write,
            policy_kind: self.policy_kind,
            custom_policy: self.custom_policy,
            sketch_kind: self.sketch_kind,
            record_stats: self.record_stats,
            loader: self.loader,
            async_loader: self.async_loader,
            listeners: self.listeners,
            key_validator: self.key_validator,
            shards: self.shards,
            tick: self.tick,
            worker_threads: self.worker_threads,
            hash_builder,
        }
    }

    pub fn build(self) -> Cache<K, V, S> {
        assert!(
            self.loader.is_none() || self.async_loader.is_none(),
            "loader and async_loader are mutually exclusive"
        );

        let stripes = self
            .shards
            .unwrap_or_else(default_stripes)
            .max(1)
            .next_power_of_two()
            .min(64);
        let capacity_hint = self
            .maximum_size
            .or(self.maximum_weight)
            .unwrap_or(DEFAULT_CAPACITY_HINT)
            .clamp(64, 1 << 24) as usize;

        let sketch = match self.sketch_kind {
            SketchKind::None => None,
            SketchKind::Basic => Some(FrequencySketch::new(capacity_hint, false)),
            SketchKind::WithDoorkeeper => Some(FrequencySketch::new(capacity_hint, true)),
        };
        let policy = match self.custom_policy {
            Some(custom) => Policy::Custom(custom),
            None => Policy::from_kind(&self.policy_kind, capacity_hint),
        };

        let workers = self.worker_threads.unwrap_or_else(default_stripes).max(1);
        let pool = WorkerPool::new(workers, workers * WORKER_QUEUE_FACTOR);
        let (maintenance_tx, maintenance_rx) = flume::bounded(1024);

        let listeners = ListenerRegistry::default();
        for listener in self.listeners {
            listeners.add(listener);
        }

        let inner = Arc::new(CacheInner {
            store: EntryStore::new(stripes, self.hash_builder),
            policy: Mutex::new(PolicyEngine { policy, sketch }),
            buffer: AccessBuffer::new(stripes),
            stats: StatsRecorder::new(self.record_stats),
            listeners,
            changes: ChangeHub::default(),
            expiry: ExpiryPolicy::new(
                self.expire_after_write,
                self.expire_after_access,
                self.refresh_after_write,
            ),
            sweep: SweepCursor::default(),
            clock: Clock::new(),
            maximum_size: self.maximum_size,
            maximum_weight: self.maximum_weight,
            weigher: self.weigher,
            key_validator: self.key_validator,
            loader: self.loader,
            async_loader: self.async_loader,
            maintenance_tx: maintenance_tx.clone(),
            pool_tx: pool.sender(),
            shutdown: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
        });

        let scheduler = scheduler::spawn(inner.clone(), self.tick, maintenance_tx, maintenance_rx);

        Cache {
            shared: Arc::new(CacheShared {
                inner,
                scheduler: Some(scheduler),
                pool: Some(pool),
            }),
        }
    }
}

fn default_stripes() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(8)
        .next_power_of_two()
        .min(64)
}
