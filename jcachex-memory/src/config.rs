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

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Selects the eviction strategy for a cache instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EvictionPolicyKind {
    /// Least recently used.
    Lru,
    /// Least frequently used, ties broken by recency.
    Lfu,
    /// Insertion order, oldest first.
    Fifo,
    /// Insertion order, newest first.
    Filo,
    /// Recency ordering tuned for weight-bounded caches.
    Weight,
    /// Evicts entries idle longer than the threshold, oldest first.
    IdleTime { idle: Duration },
    /// Windowed TinyLFU with frequency-based admission. The default.
    WTinyLfu,
    /// Consults children in order; the first victim wins.
    Composite(Vec<EvictionPolicyKind>),
}

impl Default for EvictionPolicyKind {
    fn default() -> Self {
        Self::WTinyLfu
    }
}

/// Selects the frequency sketch backing admission decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SketchKind {
    /// No sketch; frequency estimates are always zero.
    None,
    /// Count-Min sketch.
    #[default]
    Basic,
    /// Count-Min sketch fronted by a doorkeeper bit vector that absorbs
    /// one-shot keys. Prefer this for read-heavy workloads.
    WithDoorkeeper,
}
