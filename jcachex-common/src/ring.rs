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

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::{queue::ArrayQueue, utils::CachePadded};

/// Striped bounded ring for event records.
///
/// Producers never block: a push to a full stripe drops the record and bumps
/// the dropped counter. Per stripe, drain order equals enqueue order; across
/// stripes no order is guaranteed.
pub struct StripedRing<T> {
    stripes: Vec<CachePadded<ArrayQueue<T>>>,
    dropped: AtomicU64,
}

impl<T> StripedRing<T> {
    /// `stripes` rings of `capacity` slots each. Both must be non-zero.
    pub fn new(stripes: usize, capacity: usize) -> Self {
        assert!(stripes > 0);
        assert!(capacity > 0);
        Self {
            stripes: (0..stripes)
                .map(|_| CachePadded::new(ArrayQueue::new(capacity)))
                .collect(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn stripes(&self) -> usize {
        self.stripes.len()
    }

    /// Record an event on `stripe`. Returns `false` if the stripe was full
    /// and the record was dropped.
    pub fn push(&self, stripe: usize, item: T) -> bool {
        match self.stripes[stripe].push(item) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Drain up to `budget` records into `consumer`, FIFO per stripe.
    /// Returns the number of records consumed.
    pub fn drain<F>(&self, budget: usize, mut consumer: F) -> usize
    where
        F: FnMut(T),
    {
        let mut consumed = 0;
        for stripe in self.stripes.iter() {
            while consumed < budget {
                match stripe.pop() {
                    Some(item) => {
                        consumer(item);
                        consumed += 1;
                    }
                    None => break,
                }
            }
            if consumed >= budget {
                break;
            }
        }
        consumed
    }

    /// Total records currently buffered across stripes. Approximate under
    /// concurrent traffic.
    pub fn occupancy(&self) -> usize {
        self.stripes.iter().map(|stripe| stripe.len()).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_drain_order() {
        let ring = StripedRing::new(1, 8);
        for i in 0..5 {
            assert!(ring.push(0, i));
        }
        assert_eq!(ring.occupancy(), 5);

        let mut out = vec![];
        let consumed = ring.drain(usize::MAX, |i| out.push(i));
        assert_eq!(consumed, 5);
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert_eq!(ring.occupancy(), 0);
    }

    #[test]
    fn test_overflow_drops() {
        let ring = StripedRing::new(1, 2);
        assert!(ring.push(0, 1));
        assert!(ring.push(0, 2));
        assert!(!ring.push(0, 3));
        assert_eq!(ring.dropped(), 1);

        let mut out = vec![];
        ring.drain(usize::MAX, |i| out.push(i));
        assert_eq!(out, vec![1, 2]);
    }

    #[test]
    fn test_drain_budget() {
        let ring = StripedRing::new(2, 8);
        for i in 0..4 {
            ring.push(0, i);
            ring.push(1, 100 + i);
        }

        let mut out = vec![];
        let consumed = ring.drain(3, |i| out.push(i));
        assert_eq!(consumed, 3);
        assert_eq!(ring.occupancy(), 5);
    }

    #[test]
    fn test_concurrent_producers() {
        use std::sync::Arc;

        let ring = Arc::new(StripedRing::new(4, 1024));
        let handles = (0..4)
            .map(|stripe| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    for i in 0..256 {
                        ring.push(stripe, (stripe, i));
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut per_stripe: Vec<Vec<usize>> = vec![vec![]; 4];
        ring.drain(usize::MAX, |(stripe, i)| per_stripe[stripe].push(i));

        // Per stripe, drain order equals enqueue order.
        for seq in per_stripe {
            assert_eq!(seq, (0..256).collect::<Vec<_>>());
        }
        assert_eq!(ring.dropped(), 0);
    }
}
