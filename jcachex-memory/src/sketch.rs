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

const DEPTH: usize = 4;
const SAMPLE_FACTOR: u64 = 10;
const COUNTER_MAX: u64 = 15;
/// Clears the bit shifted into each nibble from its left neighbour.
const AGING_MASK: u64 = 0x7777_7777_7777_7777;

/// Per-row hash seeds, large odd constants for independent index streams.
const SEEDS: [u64; 4] = [
    0xc3a5_c85c_97cb_3127,
    0xb492_b66f_be98_f273,
    0x9ae1_6a3b_2f90_404f,
    0xcbf2_9ce4_8422_2325,
];

#[inline]
fn spread(hash: u64, seed: u64) -> u64 {
    let mut h = hash.wrapping_add(seed).wrapping_mul(seed);
    h ^= h >> 32;
    h
}

/// Count-Min frequency sketch with 4-bit saturating counters, sixteen per
/// word. The estimate for a key is the minimum across [`DEPTH`] rows, so the
/// sketch may over-count but never under-counts. Counters are halved once
/// the number of increments since the last aging reaches the sample size,
/// which weights recent traffic over ancient traffic.
pub struct FrequencySketch {
    table: Vec<AtomicU64>,
    index_mask: u64,
    words_per_row: usize,
    sample_size: u64,
    count: AtomicU64,
    doorkeeper: Option<Doorkeeper>,
}

impl FrequencySketch {
    /// `capacity` is the expected number of distinct tracked keys; it is
    /// rounded up to a power of two for mask-based indexing.
    pub fn new(capacity: usize, doorkeeper: bool) -> Self {
        let width = capacity.next_power_of_two().max(64);
        let words_per_row = width / 16;
        let table = (0..DEPTH * words_per_row)
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            table,
            index_mask: width as u64 - 1,
            words_per_row,
            sample_size: SAMPLE_FACTOR * width as u64,
            count: AtomicU64::new(0),
            doorkeeper: doorkeeper.then(|| Doorkeeper::new(width)),
        }
    }

    /// Record one occurrence of `hash`.
    pub fn increment(&self, hash: u64) {
        // A first occurrence is absorbed by the doorkeeper and does not
        // touch the counters, keeping singleton noise out of the table.
        let absorbed = match &self.doorkeeper {
            Some(doorkeeper) => !doorkeeper.contains_or_add(hash),
            None => false,
        };

        if !absorbed {
            for row in 0..DEPTH {
                self.increment_row(row, hash);
            }
        }

        if self.count.fetch_add(1, Ordering::Relaxed) + 1 >= self.sample_size {
            self.reset();
        }
    }

    fn increment_row(&self, row: usize, hash: u64) {
        let counter = (spread(hash, SEEDS[row]) & self.index_mask) as usize;
        let word_index = row * self.words_per_row + (counter >> 4);
        let shift = (counter & 15) * 4;
        let word = &self.table[word_index];

        loop {
            let current = word.load(Ordering::Acquire);
            if (current >> shift) & 0xF >= COUNTER_MAX {
                return;
            }
            let updated = current + (1 << shift);
            if word
                .compare_exchange_weak(current, updated, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Estimated occurrence count of `hash`: the minimum across rows, plus
    /// one if the doorkeeper has absorbed a first occurrence.
    pub fn frequency(&self, hash: u64) -> u64 {
        let mut freq = u64::MAX;
        for row in 0..DEPTH {
            let counter = (spread(hash, SEEDS[row]) & self.index_mask) as usize;
            let word_index = row * self.words_per_row + (counter >> 4);
            let shift = (counter & 15) * 4;
            let value = (self.table[word_index].load(Ordering::Acquire) >> shift) & 0xF;
            freq = freq.min(value);
        }
        match &self.doorkeeper {
            Some(doorkeeper) if doorkeeper.contains(hash) => freq + 1,
            _ => freq,
        }
    }

    /// Halve every counter and clear the doorkeeper. Concurrent increments
    /// during aging may be off by one step, within the approximation
    /// contract of the sketch.
    pub fn reset(&self) {
        for word in &self.table {
            let current = word.load(Ordering::Relaxed);
            word.store((current >> 1) & AGING_MASK, Ordering::Relaxed);
        }
        if let Some(doorkeeper) = &self.doorkeeper {
            doorkeeper.clear();
        }
        self.count.store(0, Ordering::Relaxed);
    }

    /// Age if the sample threshold has been reached. Backstop for the
    /// scheduler; increments normally age inline when they cross the
    /// threshold themselves.
    pub fn maybe_age(&self) {
        if self.count.load(Ordering::Relaxed) >= self.sample_size {
            self.reset();
        }
    }

    /// Zero everything.
    pub fn clear(&self) {
        for word in &self.table {
            word.store(0, Ordering::Relaxed);
        }
        if let Some(doorkeeper) = &self.doorkeeper {
            doorkeeper.clear();
        }
        self.count.store(0, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn raw_min(&self, hash: u64) -> u64 {
        let mut freq = u64::MAX;
        for row in 0..DEPTH {
            let counter = (spread(hash, SEEDS[row]) & self.index_mask) as usize;
            let word_index = row * self.words_per_row + (counter >> 4);
            let shift = (counter & 15) * 4;
            freq = freq.min((self.table[word_index].load(Ordering::Acquire) >> shift) & 0xF);
        }
        freq
    }
}

/// Bit vector in front of the counters that soaks up single-shot keys.
struct Doorkeeper {
    bits: Vec<AtomicU64>,
    bit_mask: u64,
}

impl Doorkeeper {
    fn new(capacity: usize) -> Self {
        let bit_count = (capacity * 8).next_power_of_two().max(64);
        Self {
            bits: (0..bit_count / 64).map(|_| AtomicU64::new(0)).collect(),
            bit_mask: bit_count as u64 - 1,
        }
    }

    /// Set the key's bits. Returns `true` if every bit was already set,
    /// i.e. the key had been seen before.
    fn contains_or_add(&self, hash: u64) -> bool {
        let mut seen = true;
        for seed in SEEDS {
            let bit = spread(hash, seed) & self.bit_mask;
            let mask = 1u64 << (bit & 63);
            let prev = self.bits[(bit >> 6) as usize].fetch_or(mask, Ordering::Relaxed);
            if prev & mask == 0 {
                seen = false;
            }
        }
        seen
    }

    fn contains(&self, hash: u64) -> bool {
        SEEDS.iter().all(|&seed| {
            let bit = spread(hash, seed) & self.bit_mask;
            let mask = 1u64 << (bit & 63);
            self.bits[(bit >> 6) as usize].load(Ordering::Relaxed) & mask != 0
        })
    }

    fn clear(&self) {
        for word in &self.bits {
            word.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::SmallRng, RngCore, SeedableRng};

    use super::*;

    #[test]
    fn test_increment_and_estimate() {
        let sketch = FrequencySketch::new(256, false);
        for _ in 0..5 {
            sketch.increment(42);
        }
        assert_eq!(sketch.frequency(42), 5);
    }

    #[test]
    fn test_counters_saturate() {
        let sketch = FrequencySketch::new(256, false);
        for _ in 0..100 {
            sketch.increment(7);
        }
        assert_eq!(sketch.frequency(7), COUNTER_MAX);
    }

    #[test]
    fn test_never_under_counts() {
        let sketch = FrequencySketch::new(1024, false);
        let mut rng = SmallRng::seed_from_u64(42);
        let keys: Vec<u64> = (0..64).map(|_| rng.next_u64()).collect();
        for (i, &key) in keys.iter().enumerate() {
            for _ in 0..(i % 8) + 1 {
                sketch.increment(key);
            }
        }
        for (i, &key) in keys.iter().enumerate() {
            assert!(sketch.frequency(key) >= ((i % 8) + 1) as u64);
        }
    }

    #[test]
    fn test_aging_halves_counters() {
        let sketch = FrequencySketch::new(256, false);
        for _ in 0..9 {
            sketch.increment(13);
        }
        sketch.reset();
        assert_eq!(sketch.frequency(13), 4);
        sketch.reset();
        assert_eq!(sketch.frequency(13), 2);
    }

    #[test]
    fn test_aging_triggers_at_sample_size() {
        let sketch = FrequencySketch::new(64, false);
        // sample size = 10 * 64 = 640 increments.
        for _ in 0..10 {
            sketch.increment(99);
        }
        assert_eq!(sketch.frequency(99), 10);
        for _ in 0..630 {
            sketch.increment(1000);
        }
        // The shared count crossed the sample size, so key 99 was halved.
        assert!(sketch.frequency(99) < 10);
    }

    #[test]
    fn test_doorkeeper_absorbs_first_touch() {
        let sketch = FrequencySketch::new(256, true);
        sketch.increment(5);
        // First touch lives in the doorkeeper only.
        assert_eq!(sketch.raw_min(5), 0);
        assert_eq!(sketch.frequency(5), 1);

        sketch.increment(5);
        assert_eq!(sketch.raw_min(5), 1);
        assert_eq!(sketch.frequency(5), 2);
    }

    #[test]
    fn test_clear_zeroes_everything() {
        let sketch = FrequencySketch::new(256, true);
        for _ in 0..8 {
            sketch.increment(11);
        }
        sketch.clear();
        assert_eq!(sketch.frequency(11), 0);
    }
}
