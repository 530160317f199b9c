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

use jcachex_common::ring::StripedRing;

/// Default ring slots per stripe.
pub(crate) const STRIPE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessKind {
    Read,
    /// Carries the entry weight observed at write time.
    Write(u32),
    /// Write replicated from a peer; ordered like a write but excluded
    /// from frequency accounting.
    ExternalWrite(u32),
    /// Entry observed expired on the read path; the drain reaps it.
    Evict,
}

/// A buffered access hint. Records are advisory: the policy reconciles
/// against the store when it consumes them, so losing a record under
/// overflow costs accuracy, not correctness.
pub(crate) struct AccessRecord<K> {
    pub key: K,
    pub hash: u64,
    pub kind: AccessKind,
}

/// Striped ring of access records, one stripe per store stripe so that
/// producers on different stripes never contend.
pub(crate) struct AccessBuffer<K> {
    ring: StripedRing<AccessRecord<K>>,
}

impl<K> AccessBuffer<K> {
    pub fn new(stripes: usize) -> Self {
        Self {
            ring: StripedRing::new(stripes, STRIPE_CAPACITY),
        }
    }

    /// Returns `false` if the stripe was full and the record was dropped.
    pub fn record(&self, key: K, hash: u64, kind: AccessKind) -> bool {
        let stripe = hash as usize % self.ring.stripes();
        self.ring.push(stripe, AccessRecord { key, hash, kind })
    }

    pub fn drain<F>(&self, budget: usize, consumer: F) -> usize
    where
        F: FnMut(AccessRecord<K>),
    {
        self.ring.drain(budget, consumer)
    }

    pub fn occupancy(&self) -> usize {
        self.ring.occupancy()
    }

    pub fn dropped(&self) -> u64 {
        self.ring.dropped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_drain() {
        let buffer = AccessBuffer::new(1);
        assert!(buffer.record(1u64, 1, AccessKind::Read));
        assert!(buffer.record(2u64, 2, AccessKind::Write(3)));

        let mut seen = vec![];
        buffer.drain(usize::MAX, |record| seen.push((record.key, record.kind)));
        assert_eq!(
            seen,
            vec![(1, AccessKind::Read), (2, AccessKind::Write(3))]
        );
    }

    #[test]
    fn test_overflow_counts_drops() {
        let buffer = AccessBuffer::new(1);
        for i in 0..STRIPE_CAPACITY as u64 {
            assert!(buffer.record(i, i, AccessKind::Read));
        }
        assert!(!buffer.record(999, 999, AccessKind::Read));
        assert_eq!(buffer.dropped(), 1);
        assert_eq!(buffer.occupancy(), STRIPE_CAPACITY);
    }
}
