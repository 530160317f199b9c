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

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use jcachex_common::code::{Key, Value};

/// Why an entry left the cache without an explicit remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Displaced to satisfy the entry-count bound (including admission
    /// rejections).
    Size,
    /// Displaced to satisfy the weight bound.
    Weight,
    /// Removed on behalf of an external coordinator.
    Explicit,
    /// Deadline passed.
    Expired,
    /// Overwritten by a newer value for the same key.
    Replaced,
}

/// Cache lifecycle events delivered to registered listeners.
#[derive(Debug, Clone)]
pub enum CacheEvent<K, V> {
    Put { key: K, value: V },
    Remove { key: K, value: V },
    Evict { key: K, value: V, reason: EvictReason },
    Expire { key: K, value: V },
    LoadSuccess { key: K },
    LoadFailure { key: K },
    Clear,
}

/// Trait for customized event listeners.
///
/// Listeners run synchronously on the thread that triggered the event, in
/// registration order. A panicking listener is logged and skipped; it never
/// aborts the triggering operation.
pub trait CacheEventListener<K, V>: Send + Sync + 'static {
    fn on_event(&self, event: &CacheEvent<K, V>);
}

impl<K, V, F> CacheEventListener<K, V> for F
where
    F: Fn(&CacheEvent<K, V>) + Send + Sync + 'static,
{
    fn on_event(&self, event: &CacheEvent<K, V>) {
        self(event)
    }
}

/// Handle for deregistering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

pub(crate) struct ListenerRegistry<K, V> {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn CacheEventListener<K, V>>)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl<K, V> Default for ListenerRegistry<K, V> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl<K, V> ListenerRegistry<K, V>
where
    K: Key,
    V: Value,
{
    pub fn add(&self, listener: Arc<dyn CacheEventListener<K, V>>) -> ListenerId {
        let id = ListenerId(
            self.next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub fn dispatch(&self, event: &CacheEvent<K, V>) {
        let listeners = self.listeners.read().clone();
        for (id, listener) in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if outcome.is_err() {
                tracing::warn!(listener = id.0, "cache event listener panicked, skipping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry = ListenerRegistry::<u64, u64>::default();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = order.clone();
            registry.add(Arc::new(move |_: &CacheEvent<u64, u64>| {
                order.lock().push(tag);
            }));
        }

        registry.dispatch(&CacheEvent::Clear);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test_log::test]
    fn test_panicking_listener_is_skipped() {
        let registry = ListenerRegistry::<u64, u64>::default();
        let delivered = Arc::new(AtomicUsize::new(0));

        registry.add(Arc::new(|_: &CacheEvent<u64, u64>| {
            panic!("listener bug");
        }));
        let counter = delivered.clone();
        registry.add(Arc::new(move |_: &CacheEvent<u64, u64>| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        registry.dispatch(&CacheEvent::Clear);
        assert_eq!(delivered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_remove_listener() {
        let registry = ListenerRegistry::<u64, u64>::default();
        let delivered = Arc::new(AtomicUsize::new(0));

        let counter = delivered.clone();
        let id = registry.add(Arc::new(move |_: &CacheEvent<u64, u64>| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        registry.dispatch(&CacheEvent::Clear);
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        registry.dispatch(&CacheEvent::Clear);

        assert_eq!(delivered.load(Ordering::Relaxed), 1);
    }
}
