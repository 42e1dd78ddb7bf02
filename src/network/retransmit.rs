//! Loss recovery: retransmission cache and NACK/PLI rate limiting

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// A sealed packet kept around to answer NACKs
#[derive(Debug, Clone)]
struct CachedPacket {
    sequence: u16,
    sent_at: Instant,
    data: Vec<u8>,
}

/// Send-side cache keyed by (SSRC, sequence)
///
/// Per SSRC, packets are kept in send order so both age and capacity eviction
/// drop from the front.
#[derive(Debug)]
pub struct RetransmitCache {
    streams: HashMap<u32, VecDeque<CachedPacket>>,
    max_age: Duration,
    capacity_per_ssrc: usize,
}

impl RetransmitCache {
    pub fn new(max_age: Duration, capacity_per_ssrc: usize) -> Self {
        Self {
            streams: HashMap::new(),
            max_age,
            capacity_per_ssrc: capacity_per_ssrc.max(1),
        }
    }

    pub fn insert(&mut self, ssrc: u32, sequence: u16, data: Vec<u8>, now: Instant) {
        let max_age = self.max_age;
        let queue = self.streams.entry(ssrc).or_default();

        while queue
            .front()
            .is_some_and(|p| now.saturating_duration_since(p.sent_at) >= max_age)
        {
            queue.pop_front();
        }
        while queue.len() >= self.capacity_per_ssrc {
            queue.pop_front();
        }

        queue.push_back(CachedPacket {
            sequence,
            sent_at: now,
            data,
        });
    }

    /// Look up a packet that is still within the age bound
    pub fn get(&self, ssrc: u32, sequence: u16, now: Instant) -> Option<&[u8]> {
        self.streams
            .get(&ssrc)?
            .iter()
            .rev()
            .find(|p| p.sequence == sequence)
            .filter(|p| now.saturating_duration_since(p.sent_at) < self.max_age)
            .map(|p| p.data.as_slice())
    }

    /// Drop expired packets from every stream
    pub fn cleanup(&mut self, now: Instant) {
        let max_age = self.max_age;
        for queue in self.streams.values_mut() {
            while queue
                .front()
                .is_some_and(|p| now.saturating_duration_since(p.sent_at) >= max_age)
            {
                queue.pop_front();
            }
        }
        self.streams.retain(|_, queue| !queue.is_empty());
    }

    pub fn remove_ssrc(&mut self, ssrc: u32) {
        self.streams.remove(&ssrc);
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }

    /// Number of cached packets for one stream
    pub fn len(&self, ssrc: u32) -> usize {
        self.streams.get(&ssrc).map_or(0, VecDeque::len)
    }
}

/// Per-SSRC minimum interval between feedback messages
#[derive(Debug)]
struct FeedbackLimiter {
    last_sent: HashMap<u32, Instant>,
    min_interval: Duration,
}

impl FeedbackLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_sent: HashMap::new(),
            min_interval,
        }
    }

    fn should_send(&mut self, ssrc: u32, now: Instant) -> bool {
        match self.last_sent.get(&ssrc) {
            Some(last) if now.saturating_duration_since(*last) < self.min_interval => false,
            _ => {
                self.last_sent.insert(ssrc, now);
                true
            }
        }
    }

    fn cleanup(&mut self, now: Instant) {
        let min_interval = self.min_interval;
        self.last_sent
            .retain(|_, last| now.saturating_duration_since(*last) < min_interval);
    }
}

/// Rate limiter for outbound NACKs (default 50 ms per SSRC)
#[derive(Debug)]
pub struct NackTracker(FeedbackLimiter);

impl NackTracker {
    pub fn new(min_interval: Duration) -> Self {
        Self(FeedbackLimiter::new(min_interval))
    }

    /// Whether a NACK for `ssrc` may go out now; records it if so
    pub fn should_send_nack(&mut self, ssrc: u32, now: Instant) -> bool {
        self.0.should_send(ssrc, now)
    }

    pub fn remove_ssrc(&mut self, ssrc: u32) {
        self.0.last_sent.remove(&ssrc);
    }

    pub fn cleanup(&mut self, now: Instant) {
        self.0.cleanup(now);
    }

    pub fn clear(&mut self) {
        self.0.last_sent.clear();
    }
}

/// Rate limiter for outbound PLIs (default 500 ms per SSRC)
#[derive(Debug)]
pub struct PliTracker(FeedbackLimiter);

impl PliTracker {
    pub fn new(min_interval: Duration) -> Self {
        Self(FeedbackLimiter::new(min_interval))
    }

    /// Whether a PLI for `ssrc` may go out now; records it if so
    pub fn should_send_pli(&mut self, ssrc: u32, now: Instant) -> bool {
        self.0.should_send(ssrc, now)
    }

    pub fn remove_ssrc(&mut self, ssrc: u32) {
        self.0.last_sent.remove(&ssrc);
    }

    pub fn cleanup(&mut self, now: Instant) {
        self.0.cleanup(now);
    }

    pub fn clear(&mut self) {
        self.0.last_sent.clear();
    }
}
