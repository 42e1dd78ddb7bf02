//! Anti-replay filtering for inbound media
//!
//! One 256-counter sliding window per (key id, SSRC). Counters are the 64-bit
//! AEAD nonce inputs, so they never wrap and no wraparound handling is needed.

use std::collections::HashMap;
use std::time::Instant;

/// Width of the replay window in counters
pub const REPLAY_WINDOW_SIZE: u64 = 256;

const WORDS: usize = (REPLAY_WINDOW_SIZE / 64) as usize;

/// Sliding window over recently accepted counters
///
/// Bit N of the bitmap represents `(highest - N)`.
#[derive(Debug, Clone, Default)]
pub struct ReplayFilter {
    highest: Option<u64>,
    bitmap: [u64; WORDS],
}

impl ReplayFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `counter` would be accepted, without recording it
    pub fn check(&self, counter: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if counter > highest {
            return true;
        }
        let offset = highest - counter;
        offset < REPLAY_WINDOW_SIZE && !self.is_set(offset)
    }

    /// Accept `counter` if it has not been seen and is inside the window
    pub fn accept(&mut self, counter: u64) -> bool {
        let Some(highest) = self.highest else {
            self.highest = Some(counter);
            self.bitmap = [0; WORDS];
            self.set(0);
            return true;
        };

        if counter > highest {
            self.shift(counter - highest);
            self.highest = Some(counter);
            self.set(0);
            return true;
        }

        let offset = highest - counter;
        if offset >= REPLAY_WINDOW_SIZE || self.is_set(offset) {
            return false;
        }
        self.set(offset);
        true
    }

    /// Highest accepted counter
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    fn is_set(&self, offset: u64) -> bool {
        let (word, bit) = ((offset / 64) as usize, offset % 64);
        self.bitmap[word] & (1u64 << bit) != 0
    }

    fn set(&mut self, offset: u64) {
        let (word, bit) = ((offset / 64) as usize, offset % 64);
        self.bitmap[word] |= 1u64 << bit;
    }

    /// Move the window forward by `delta`, dropping bits that fall out
    fn shift(&mut self, delta: u64) {
        if delta >= REPLAY_WINDOW_SIZE {
            self.bitmap = [0; WORDS];
            return;
        }
        let words = (delta / 64) as usize;
        let bits = (delta % 64) as u32;

        for i in (0..WORDS).rev() {
            let mut value = 0u64;
            if i >= words {
                value = self.bitmap[i - words] << bits;
                if bits > 0 && i > words {
                    value |= self.bitmap[i - words - 1] >> (64 - bits);
                }
            }
            self.bitmap[i] = value;
        }
    }
}

struct FilterEntry {
    filter: ReplayFilter,
    last_used: Instant,
}

/// Replay filters for every inbound (key id, SSRC) pair, capacity-bounded
///
/// An evicted filter forgets its window, so old counters of that stream pass
/// again. Eviction therefore picks among streams the caller does not keep
/// before touching kept ones.
pub struct ReplayFilters {
    filters: HashMap<(u8, u32), FilterEntry>,
    capacity: usize,
}

impl ReplayFilters {
    pub fn new(capacity: usize) -> Self {
        Self {
            filters: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Check without recording; unknown pairs always pass
    pub fn check(&self, key_id: u8, ssrc: u32, counter: u64) -> bool {
        self.filters
            .get(&(key_id, ssrc))
            .map_or(true, |entry| entry.filter.check(counter))
    }

    /// Record `counter`, creating the filter on first use
    pub fn accept(&mut self, key_id: u8, ssrc: u32, counter: u64, now: Instant) -> bool {
        self.accept_keeping(key_id, ssrc, counter, now, |_| false)
    }

    /// Like [`accept`](Self::accept), but a full set evicts the least recent
    /// filter whose SSRC `keep` rejects, if there is one
    pub fn accept_keeping<F>(
        &mut self,
        key_id: u8,
        ssrc: u32,
        counter: u64,
        now: Instant,
        keep: F,
    ) -> bool
    where
        F: Fn(u32) -> bool,
    {
        if !self.filters.contains_key(&(key_id, ssrc)) && self.filters.len() >= self.capacity {
            self.evict_least_recent(keep);
        }
        let entry = self
            .filters
            .entry((key_id, ssrc))
            .or_insert_with(|| FilterEntry {
                filter: ReplayFilter::new(),
                last_used: now,
            });
        entry.last_used = now;
        entry.filter.accept(counter)
    }

    pub fn remove_ssrc(&mut self, ssrc: u32) {
        self.filters.retain(|(_, s), _| *s != ssrc);
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    fn evict_least_recent<F>(&mut self, keep: F)
    where
        F: Fn(u32) -> bool,
    {
        let oldest = |kept: bool| {
            self.filters
                .iter()
                .filter(|((_, ssrc), _)| keep(*ssrc) == kept)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| *key)
        };
        let victim = oldest(false).or_else(|| oldest(true));
        if let Some(key) = victim {
            self.filters.remove(&key);
        }
    }
}
