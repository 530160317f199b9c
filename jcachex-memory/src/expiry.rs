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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::entry::EntryRecord;

/// Resolved expiration configuration, durations flattened to nanoseconds
/// with `0` meaning disabled.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ExpiryPolicy {
    expire_after_write: u64,
    expire_after_access: u64,
    refresh_after_write: u64,
}

impl ExpiryPolicy {
    pub fn new(
        expire_after_write: Option<Duration>,
        expire_after_access: Option<Duration>,
        refresh_after_write: Option<Duration>,
    ) -> Self {
        let nanos = |d: Option<Duration>| d.map(|d| d.as_nanos() as u64).unwrap_or(0);
        Self {
            expire_after_write: nanos(expire_after_write),
            expire_after_access: nanos(expire_after_access),
            refresh_after_write: nanos(refresh_after_write),
        }
    }

    pub fn any_expiry(&self) -> bool {
        self.expire_after_write != 0 || self.expire_after_access != 0
    }

    pub fn refresh_enabled(&self) -> bool {
        self.refresh_after_write != 0
    }

    /// Absolute write-expiry deadline for an entry written at `now`.
    pub fn write_deadline(&self, now: u64) -> u64 {
        if self.expire_after_write == 0 {
            0
        } else {
            now.saturating_add(self.expire_after_write)
        }
    }

    /// Absolute refresh deadline for an entry written at `now`.
    pub fn refresh_deadline(&self, now: u64) -> u64 {
        if self.refresh_after_write == 0 {
            0
        } else {
            now.saturating_add(self.refresh_after_write)
        }
    }

    pub fn is_expired<V>(&self, record: &EntryRecord<V>, now: u64) -> bool {
        if record.expire_at != 0 && now >= record.expire_at {
            return true;
        }
        if self.expire_after_access != 0 {
            let last = record.last_access.load(Ordering::Relaxed);
            if last.saturating_add(self.expire_after_access) <= now {
                return true;
            }
        }
        false
    }

    /// Earliest applicable deadline, if the entry can expire at all.
    pub fn deadline<V>(&self, record: &EntryRecord<V>) -> Option<u64> {
        let write = (record.expire_at != 0).then_some(record.expire_at);
        let access = (self.expire_after_access != 0).then(|| {
            record
                .last_access
                .load(Ordering::Relaxed)
                .saturating_add(self.expire_after_access)
        });
        match (write, access) {
            (Some(w), Some(a)) => Some(w.min(a)),
            (Some(w), None) => Some(w),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }
}

/// Round-robin shard cursor for the sampled expiration sweep.
#[derive(Debug, Default)]
pub(crate) struct SweepCursor {
    next: AtomicUsize,
}

impl SweepCursor {
    pub fn advance(&self, shards: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % shards
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_expiry() {
        let policy = ExpiryPolicy::new(Some(Duration::from_nanos(100)), None, None);
        let rec = EntryRecord::new("v", 1, 10, policy.write_deadline(10), 0);
        assert!(!policy.is_expired(&rec, 50));
        assert!(policy.is_expired(&rec, 110));
        assert_eq!(policy.deadline(&rec), Some(110));
    }

    #[test]
    fn test_access_expiry_slides() {
        let policy = ExpiryPolicy::new(None, Some(Duration::from_nanos(100)), None);
        let rec = EntryRecord::new("v", 1, 10, 0, 0);
        assert!(policy.is_expired(&rec, 110));

        rec.touch(100);
        assert!(!policy.is_expired(&rec, 150));
        assert!(policy.is_expired(&rec, 200));
        assert_eq!(policy.deadline(&rec), Some(200));
    }

    #[test]
    fn test_earliest_deadline_wins() {
        let policy = ExpiryPolicy::new(
            Some(Duration::from_nanos(1000)),
            Some(Duration::from_nanos(100)),
            None,
        );
        let rec = EntryRecord::new("v", 1, 10, policy.write_deadline(10), 0);
        assert_eq!(policy.deadline(&rec), Some(110));
    }

    #[test]
    fn test_no_expiry_configured() {
        let policy = ExpiryPolicy::new(None, None, None);
        let rec = EntryRecord::new("v", 1, 10, 0, 0);
        assert!(!policy.any_expiry());
        assert!(!policy.is_expired(&rec, u64::MAX));
        assert_eq!(policy.deadline(&rec), None);
        assert_eq!(policy.write_deadline(10), 0);
    }

    #[test]
    fn test_sweep_cursor_round_robin() {
        let cursor = SweepCursor::default();
        assert_eq!(cursor.advance(4), 0);
        assert_eq!(cursor.advance(4), 1);
        assert_eq!(cursor.advance(4), 2);
        assert_eq!(cursor.advance(4), 3);
        assert_eq!(cursor.advance(4), 0);
    }
}
