//! Receive-side statistics: sequence gaps, loss, jitter and aggregate counters
//!
//! Sequence numbers are 16-bit and wrap; the tracker extends them with a
//! cycle count so gaps spanning the wrap are handled like any other.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::protocol::{MediaKind, ReceiverReport};

/// Upper bound on sequences remembered as missing per stream
pub const MAX_TRACKED_MISSING: usize = 512;

/// Forward jumps larger than this are treated as a stream restart, not loss
pub const MAX_SEQUENCE_JUMP: u16 = 3000;

const HALF_SEQUENCE_SPACE: u16 = 1 << 15;

/// Tracks 16-bit sequence numbers of one stream to detect missing packets
#[derive(Debug, Default)]
pub struct SequenceTracker {
    /// Highest sequence seen, extended with wrap cycles
    highest: Option<u64>,
    /// Extended sequence -> time the gap was detected
    missing: BTreeMap<u64, Instant>,
    packets_lost: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an arriving sequence number
    pub fn record(&mut self, sequence: u16, now: Instant) {
        let Some(highest) = self.highest else {
            self.highest = Some(sequence as u64);
            return;
        };

        let highest16 = highest as u16;
        let forward = sequence.wrapping_sub(highest16);

        if forward != 0 && forward < HALF_SEQUENCE_SPACE {
            let extended = highest + forward as u64;
            let gap = forward - 1;

            if gap > MAX_SEQUENCE_JUMP {
                trace!("Sequence jump of {}; resetting gap tracking", forward);
                self.missing.clear();
            } else {
                for ext in (highest + 1)..extended {
                    self.missing.insert(ext, now);
                }
                self.packets_lost += gap as u64;
                while self.missing.len() > MAX_TRACKED_MISSING {
                    self.missing.pop_first();
                }
            }
            self.highest = Some(extended);
            return;
        }

        // at or behind the highest: a late arrival or a duplicate
        let back = highest16.wrapping_sub(sequence) as u64;
        if back <= highest && self.missing.remove(&(highest - back)).is_some() {
            self.packets_lost = self.packets_lost.saturating_sub(1);
        }
    }

    /// Missing sequences detected at least `grace` ago, oldest first
    pub fn missing_sequences(&self, now: Instant, grace: Duration) -> Vec<u16> {
        self.missing
            .iter()
            .filter(|(_, detected)| now.saturating_duration_since(**detected) >= grace)
            .map(|(ext, _)| *ext as u16)
            .collect()
    }

    /// Stop tracking gaps older than `max_age`; they stay counted as lost
    pub fn expire(&mut self, now: Instant, max_age: Duration) {
        self.missing
            .retain(|_, detected| now.saturating_duration_since(*detected) < max_age);
    }

    pub fn highest_extended(&self) -> Option<u64> {
        self.highest
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }
}

/// Public statistics of one remote stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStats {
    pub ssrc: u32,
    pub kind: MediaKind,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_received: u64,
    /// Extended highest sequence (wrap cycles in the upper bits)
    pub highest_sequence: u32,
    /// Smoothed inter-arrival jitter in milliseconds
    pub jitter_ms: f64,
    pub last_packet_at: Option<Instant>,
}

/// Latest receiver report a remote peer sent about one of our streams
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteReport {
    pub report: ReceiverReport,
    pub received_at: Instant,
}

#[derive(Debug)]
struct StreamState {
    kind: MediaKind,
    tracker: SequenceTracker,
    packets_received: u64,
    bytes_received: u64,
    jitter_ms: f64,
    last_arrival: Option<Instant>,
    last_timestamp: u32,
    first_extended: u64,
    reported_expected: u64,
    reported_lost: u64,
}

impl StreamState {
    fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            tracker: SequenceTracker::new(),
            packets_received: 0,
            bytes_received: 0,
            jitter_ms: 0.0,
            last_arrival: None,
            last_timestamp: 0,
            first_extended: 0,
            reported_expected: 0,
            reported_lost: 0,
        }
    }

    fn record(&mut self, sequence: u16, timestamp: u32, bytes: usize, now: Instant) {
        if self.tracker.highest_extended().is_none() {
            self.first_extended = sequence as u64;
        }
        self.tracker.record(sequence, now);
        self.packets_received += 1;
        self.bytes_received += bytes as u64;

        // https://tools.ietf.org/html/rfc3550#appendix-A.8
        if let Some(last_arrival) = self.last_arrival {
            let arrival_delta_ms =
                now.saturating_duration_since(last_arrival).as_secs_f64() * 1000.0;
            let ts_delta = timestamp.wrapping_sub(self.last_timestamp) as i32;
            let ts_delta_ms = ts_delta as f64 * 1000.0 / self.kind.clock_rate() as f64;
            let d = (arrival_delta_ms - ts_delta_ms).abs();
            self.jitter_ms += (d - self.jitter_ms) / 16.0;
        }
        self.last_arrival = Some(now);
        self.last_timestamp = timestamp;
    }

    fn expected(&self) -> u64 {
        self.tracker
            .highest_extended()
            .map_or(0, |h| h.saturating_sub(self.first_extended) + 1)
    }

    fn snapshot(&self, ssrc: u32) -> StreamStats {
        StreamStats {
            ssrc,
            kind: self.kind,
            packets_received: self.packets_received,
            packets_lost: self.tracker.packets_lost(),
            bytes_received: self.bytes_received,
            highest_sequence: self.tracker.highest_extended().unwrap_or(0) as u32,
            jitter_ms: self.jitter_ms,
            last_packet_at: self.last_arrival,
        }
    }

    fn report(&mut self, ssrc: u32, reporter_ssrc: u32) -> ReceiverReport {
        let expected = self.expected();
        let lost = self.tracker.packets_lost();

        let expected_interval = expected.saturating_sub(self.reported_expected);
        let lost_interval = lost.saturating_sub(self.reported_lost);
        let fraction_lost = if expected_interval > 0 {
            (lost_interval * 255 / expected_interval).min(255) as u8
        } else {
            0
        };

        self.reported_expected = expected;
        self.reported_lost = lost;

        ReceiverReport {
            ssrc,
            reporter_ssrc,
            fraction_lost,
            cumulative_lost: lost.min(0x00FF_FFFF) as u32,
            highest_sequence: self.tracker.highest_extended().unwrap_or(0) as u32,
            // whole milliseconds
            jitter: self.jitter_ms.round() as u32,
        }
    }
}

/// Snapshot of all session statistics
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Last measured round-trip time in milliseconds
    pub rtt_ms: Option<f64>,
    pub decrypt_failures: u64,
    pub streams: Vec<StreamStats>,
    pub remote_reports: Vec<RemoteReport>,
}

/// Per-stream and aggregate statistics for one session
#[derive(Debug)]
pub struct StatsCollector {
    streams: HashMap<u32, StreamState>,
    capacity: usize,
    remote_reports: HashMap<u32, RemoteReport>,
    packets_sent: u64,
    bytes_sent: u64,
    packets_received: u64,
    bytes_received: u64,
    rtt_ms: Option<f64>,
    decrypt_failures: u64,
}

impl StatsCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: HashMap::new(),
            capacity: capacity.max(1),
            remote_reports: HashMap::new(),
            packets_sent: 0,
            bytes_sent: 0,
            packets_received: 0,
            bytes_received: 0,
            rtt_ms: None,
            decrypt_failures: 0,
        }
    }

    pub fn record_received(
        &mut self,
        ssrc: u32,
        kind: MediaKind,
        sequence: u16,
        timestamp: u32,
        bytes: usize,
        now: Instant,
    ) {
        if !self.streams.contains_key(&ssrc) && self.streams.len() >= self.capacity {
            self.evict_least_recent();
        }
        self.streams
            .entry(ssrc)
            .or_insert_with(|| StreamState::new(kind))
            .record(sequence, timestamp, bytes, now);
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Count one decrypt failure, returning the running total
    pub fn record_decrypt_failure(&mut self) -> u64 {
        self.decrypt_failures += 1;
        self.decrypt_failures
    }

    pub fn set_rtt(&mut self, rtt_ms: f64) {
        self.rtt_ms = Some(rtt_ms);
    }

    pub fn rtt_ms(&self) -> Option<f64> {
        self.rtt_ms
    }

    pub fn record_remote_report(&mut self, report: ReceiverReport, now: Instant) {
        self.remote_reports.insert(
            report.ssrc,
            RemoteReport {
                report,
                received_at: now,
            },
        );
    }

    /// Missing sequences of `ssrc` older than the grace period
    pub fn missing_sequences(&self, ssrc: u32, now: Instant, grace: Duration) -> Vec<u16> {
        self.streams
            .get(&ssrc)
            .map(|s| s.tracker.missing_sequences(now, grace))
            .unwrap_or_default()
    }

    /// Give up on gaps older than `max_age` in every stream
    pub fn expire_missing(&mut self, now: Instant, max_age: Duration) {
        for stream in self.streams.values_mut() {
            stream.tracker.expire(now, max_age);
        }
    }

    /// One receiver report per known remote stream
    pub fn receiver_reports(&mut self, reporter_ssrc: u32) -> Vec<ReceiverReport> {
        self.streams
            .iter_mut()
            .map(|(ssrc, stream)| stream.report(*ssrc, reporter_ssrc))
            .collect()
    }

    /// Remote SSRCs of the given kind
    pub fn stream_ssrcs(&self, kind: MediaKind) -> Vec<u32> {
        self.streams
            .iter()
            .filter(|(_, s)| s.kind == kind)
            .map(|(ssrc, _)| *ssrc)
            .collect()
    }

    pub fn stream(&self, ssrc: u32) -> Option<StreamStats> {
        self.streams.get(&ssrc).map(|s| s.snapshot(ssrc))
    }

    pub fn remove_stream(&mut self, ssrc: u32) {
        self.streams.remove(&ssrc);
    }

    /// Forget per-stream state; aggregate counters survive
    pub fn clear_streams(&mut self) {
        self.streams.clear();
        self.remote_reports.clear();
    }

    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            packets_sent: self.packets_sent,
            bytes_sent: self.bytes_sent,
            packets_received: self.packets_received,
            bytes_received: self.bytes_received,
            rtt_ms: self.rtt_ms,
            decrypt_failures: self.decrypt_failures,
            streams: self
                .streams
                .iter()
                .map(|(ssrc, s)| s.snapshot(*ssrc))
                .collect(),
            remote_reports: self.remote_reports.values().cloned().collect(),
        }
    }

    fn evict_least_recent(&mut self) {
        if let Some(ssrc) = self
            .streams
            .iter()
            .min_by_key(|(_, s)| s.last_arrival)
            .map(|(ssrc, _)| *ssrc)
        {
            self.streams.remove(&ssrc);
        }
    }
}
