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

//! jcachex - in-process key-value cache for Rust.
//!
//! A thread-safe cache with pluggable eviction (W-TinyLFU by default),
//! per-entry expiration and refresh, event notification, statistics, and a
//! change stream for replication layers.
//!
//! # Examples
//!
//! ```
//! use jcachex::{Cache, EvictionPolicyKind};
//!
//! let cache: Cache<String, u64> = Cache::builder()
//!     .maximum_size(10_000)
//!     .eviction_policy(EvictionPolicyKind::Lru)
//!     .record_stats(true)
//!     .build();
//!
//! cache.put("answer".to_string(), 42).unwrap();
//! assert_eq!(cache.get(&"answer".to_string()).unwrap(), Some(42));
//! assert_eq!(cache.stats().hit_count, 1);
//! ```
//!
//! With a loader, misses are populated under single-flight: concurrent
//! callers of the same missing key share one loader invocation.
//!
//! ```
//! use jcachex::Cache;
//!
//! let cache: Cache<u64, u64> = Cache::builder()
//!     .maximum_size(1_000)
//!     .loader(|key: &u64| Some(key * 2))
//!     .build();
//!
//! assert_eq!(cache.get(&21).unwrap(), Some(42));
//! ```

pub use jcachex_common::clock::Clock;
pub use jcachex_common::code::{HashBuilder, Key, Value};

pub use jcachex_memory::cache::{
    AsyncLoader, Cache, CacheBuilder, Fetch, KeyValidator, Loader, Weigher,
};
pub use jcachex_memory::changes::EntryChange;
pub use jcachex_memory::config::{EvictionPolicyKind, SketchKind};
pub use jcachex_memory::error::{Error, LoadPanic, Result};
pub use jcachex_memory::eviction::{AccessMeta, EvictionPolicy};
pub use jcachex_memory::listener::{
    CacheEvent, CacheEventListener, EvictReason, ListenerId,
};
pub use jcachex_memory::metrics::CacheStats;
pub use jcachex_memory::sketch::FrequencySketch;
pub use jcachex_memory::RandomState;
