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

use std::time::{Duration, Instant};

/// Monotonic clock anchored at construction time.
///
/// Timestamps are nanoseconds since the anchor, offset by one so that `0`
/// is free to mean "unset" in packed deadline fields.
#[derive(Debug, Clone)]
pub struct Clock {
    anchor: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }

    /// Current timestamp in nanoseconds. Always non-zero.
    pub fn now(&self) -> u64 {
        self.anchor.elapsed().as_nanos() as u64 + 1
    }

    /// Timestamp `d` after the current instant.
    pub fn deadline(&self, d: Duration) -> u64 {
        self.now().saturating_add(d.as_nanos() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_monotonic() {
        let clock = Clock::new();
        let t1 = clock.now();
        let t2 = clock.now();
        assert!(t1 >= 1);
        assert!(t2 >= t1);
    }

    #[test]
    fn test_deadline_in_future() {
        let clock = Clock::new();
        let deadline = clock.deadline(Duration::from_secs(1));
        assert!(deadline > clock.now());
    }
}
