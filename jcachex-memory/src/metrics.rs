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

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Monotonic operation counters.
///
/// Counters are independent atomics updated on the hot path; a snapshot is
/// stamped with a generation number for caller-side change detection.
/// Counters within one snapshot may be skewed by in-flight operations by a
/// bounded amount, which is acceptable for monitoring purposes.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    enabled: bool,
    hit: AtomicU64,
    miss: AtomicU64,
    load_success: AtomicU64,
    load_failure: AtomicU64,
    total_load_nanos: AtomicU64,
    eviction_count: AtomicU64,
    eviction_weight: AtomicU64,
    expiration_count: AtomicU64,
    generation: AtomicU64,
    degraded: AtomicBool,
}

impl StatsRecorder {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn record_hit(&self) {
        if self.enabled {
            self.hit.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_miss(&self) {
        if self.enabled {
            self.miss.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_load_success(&self, nanos: u64) {
        if self.enabled {
            self.load_success.fetch_add(1, Ordering::Relaxed);
            self.total_load_nanos.fetch_add(nanos, Ordering::Relaxed);
        }
    }

    pub fn record_load_failure(&self, nanos: u64) {
        if self.enabled {
            self.load_failure.fetch_add(1, Ordering::Relaxed);
            self.total_load_nanos.fetch_add(nanos, Ordering::Relaxed);
        }
    }

    pub fn record_eviction(&self, weight: u32) {
        if self.enabled {
            self.eviction_count.fetch_add(1, Ordering::Relaxed);
            self.eviction_weight
                .fetch_add(weight as u64, Ordering::Relaxed);
        }
    }

    pub fn record_expiration(&self) {
        if self.enabled {
            self.expiration_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_degraded(&self) {
        self.degraded.store(true, Ordering::Release);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hit.load(Ordering::Relaxed),
            miss_count: self.miss.load(Ordering::Relaxed),
            load_success_count: self.load_success.load(Ordering::Relaxed),
            load_failure_count: self.load_failure.load(Ordering::Relaxed),
            total_load_time_nanos: self.total_load_nanos.load(Ordering::Relaxed),
            eviction_count: self.eviction_count.load(Ordering::Relaxed),
            eviction_weight: self.eviction_weight.load(Ordering::Relaxed),
            expiration_count: self.expiration_count.load(Ordering::Relaxed),
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            degraded: self.is_degraded(),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub load_success_count: u64,
    pub load_failure_count: u64,
    pub total_load_time_nanos: u64,
    pub eviction_count: u64,
    pub eviction_weight: u64,
    pub expiration_count: u64,
    pub generation: u64,
    pub degraded: bool,
}

impl CacheStats {
    pub fn request_count(&self) -> u64 {
        self.hit_count + self.miss_count
    }

    pub fn hit_rate(&self) -> f64 {
        let requests = self.request_count();
        if requests == 0 {
            return 1.0;
        }
        self.hit_count as f64 / requests as f64
    }

    pub fn average_load_time_nanos(&self) -> f64 {
        let loads = self.load_success_count + self.load_failure_count;
        if loads == 0 {
            return 0.0;
        }
        self.total_load_time_nanos as f64 / loads as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let recorder = StatsRecorder::new(true);
        recorder.record_hit();
        recorder.record_hit();
        recorder.record_miss();
        recorder.record_eviction(5);
        recorder.record_expiration();
        recorder.record_load_success(100);
        recorder.record_load_failure(50);

        let stats = recorder.snapshot();
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.request_count(), 3);
        assert_eq!(stats.eviction_count, 1);
        assert_eq!(stats.eviction_weight, 5);
        assert_eq!(stats.expiration_count, 1);
        assert_eq!(stats.load_success_count, 1);
        assert_eq!(stats.load_failure_count, 1);
        assert_eq!(stats.total_load_time_nanos, 150);
        assert_eq!(stats.average_load_time_nanos(), 75.0);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_recorder_is_noop() {
        let recorder = StatsRecorder::new(false);
        recorder.record_hit();
        recorder.record_miss();
        let stats = recorder.snapshot();
        assert_eq!(stats.hit_count, 0);
        assert_eq!(stats.miss_count, 0);
        assert_eq!(stats.hit_rate(), 1.0);
    }

    #[test]
    fn test_generation_advances() {
        let recorder = StatsRecorder::new(true);
        let s1 = recorder.snapshot();
        let s2 = recorder.snapshot();
        assert!(s2.generation > s1.generation);
    }
}
