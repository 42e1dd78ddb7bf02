//! Video frame fragmentation and reassembly
//!
//! Frames larger than one packet are split into fragments that share a frame
//! id. Each fragment's payload starts with a [`FragmentHeader`].

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::trace;

use super::error::NetworkError;
use crate::protocol::{FragmentHeader, FRAGMENT_HEADER_SIZE, MAX_FRAGMENT_PAYLOAD};

/// Splits outbound frames of one video stream
#[derive(Debug)]
pub struct Fragmenter {
    next_frame_id: u32,
    max_payload: usize,
}

impl Fragmenter {
    /// Start at a random frame id
    pub fn new() -> Self {
        Self::with_start(rand::random(), MAX_FRAGMENT_PAYLOAD)
    }

    pub fn with_start(first_frame_id: u32, max_payload: usize) -> Self {
        Self {
            next_frame_id: first_frame_id,
            max_payload: max_payload.max(1),
        }
    }

    /// Split `frame` into fragment payloads (fragment header + chunk).
    ///
    /// An empty frame produces no fragments and consumes no frame id.
    pub fn fragment(&mut self, frame: &[u8]) -> Result<Vec<Vec<u8>>, NetworkError> {
        if frame.is_empty() {
            return Ok(Vec::new());
        }

        let count = frame.len().div_ceil(self.max_payload);
        if count > u16::MAX as usize || frame.len() > u32::MAX as usize {
            return Err(NetworkError::FrameTooLarge(frame.len()));
        }

        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);

        let fragments = frame
            .chunks(self.max_payload)
            .enumerate()
            .map(|(index, chunk)| {
                let header = FragmentHeader {
                    frame_id,
                    index: index as u16,
                    count: count as u16,
                    frame_length: frame.len() as u32,
                };
                let mut payload = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
                payload.extend_from_slice(&header.to_bytes());
                payload.extend_from_slice(chunk);
                payload
            })
            .collect();

        Ok(fragments)
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully reassembled video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFrame {
    pub frame_id: u32,
    pub is_keyframe: bool,
    pub data: Vec<u8>,
}

/// Reassembly state for one frame id
#[derive(Debug)]
struct PendingFrame {
    fragments: BTreeMap<u16, Vec<u8>>,
    count: u16,
    frame_length: u32,
    is_keyframe: bool,
    first_arrival: Instant,
}

/// Reassembles fragments of one remote video stream
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<u32, PendingFrame>,
    capacity: usize,
    max_age: Duration,
    /// Incomplete frames dropped by eviction or the age sweep
    frames_dropped: u64,
}

impl Reassembler {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            capacity: capacity.max(1),
            max_age,
            frames_dropped: 0,
        }
    }

    /// Add one decrypted fragment payload.
    ///
    /// Returns the frame once its last missing fragment arrives. Malformed or
    /// inconsistent fragments are dropped.
    pub fn add_fragment(
        &mut self,
        payload: &[u8],
        is_keyframe: bool,
        now: Instant,
    ) -> Option<CompletedFrame> {
        let header = FragmentHeader::from_bytes(payload).ok()?;
        if header.count == 0
            || header.index >= header.count
            || header.frame_length as usize > header.count as usize * MAX_FRAGMENT_PAYLOAD
        {
            trace!("Dropping degenerate fragment header {:?}", header);
            return None;
        }
        let chunk = &payload[FRAGMENT_HEADER_SIZE..];

        if !self.pending.contains_key(&header.frame_id) && self.pending.len() >= self.capacity {
            self.evict_oldest();
        }

        let frame = self
            .pending
            .entry(header.frame_id)
            .or_insert_with(|| PendingFrame {
                fragments: BTreeMap::new(),
                count: header.count,
                frame_length: header.frame_length,
                is_keyframe: false,
                first_arrival: now,
            });

        if frame.count != header.count || frame.frame_length != header.frame_length {
            trace!(
                "Fragment of frame {} disagrees with earlier fragments",
                header.frame_id
            );
            return None;
        }

        frame.is_keyframe |= is_keyframe;
        frame.fragments.entry(header.index).or_insert_with(|| chunk.to_vec());

        if frame.fragments.len() < frame.count as usize {
            return None;
        }

        let frame = self.pending.remove(&header.frame_id)?;
        let mut data = Vec::with_capacity(frame.frame_length as usize);
        for chunk in frame.fragments.values() {
            data.extend_from_slice(chunk);
        }

        if data.len() != frame.frame_length as usize {
            trace!(
                "Frame {} reassembled to {} bytes, expected {}",
                header.frame_id,
                data.len(),
                frame.frame_length
            );
            self.frames_dropped += 1;
            return None;
        }

        Some(CompletedFrame {
            frame_id: header.frame_id,
            is_keyframe: frame.is_keyframe,
            data,
        })
    }

    /// Drop frames whose first fragment is older than the age bound.
    ///
    /// Returns the number of frames dropped.
    pub fn cleanup(&mut self, now: Instant) -> usize {
        let max_age = self.max_age;
        let before = self.pending.len();
        self.pending
            .retain(|_, frame| now.saturating_duration_since(frame.first_arrival) < max_age);
        let dropped = before - self.pending.len();
        self.frames_dropped += dropped as u64;
        dropped
    }

    /// Number of incomplete frames currently held
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    fn evict_oldest(&mut self) {
        if let Some(frame_id) = self
            .pending
            .iter()
            .min_by_key(|(_, frame)| frame.first_arrival)
            .map(|(id, _)| *id)
        {
            trace!("Evicting incomplete frame {}", frame_id);
            self.pending.remove(&frame_id);
            self.frames_dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn reassembler() -> Reassembler {
        Reassembler::new(8, Duration::from_millis(1000))
    }

    #[test]
    fn test_fragment_count_and_sizes() {
        let mut fragmenter = Fragmenter::with_start(1, MAX_FRAGMENT_PAYLOAD);
        let data = frame(3000);
        let fragments = fragmenter.fragment(&data).unwrap();

        assert_eq!(fragments.len(), 3000usize.div_ceil(MAX_FRAGMENT_PAYLOAD));
        for (i, fragment) in fragments.iter().enumerate() {
            let header = FragmentHeader::from_bytes(fragment).unwrap();
            assert_eq!(header.frame_id, 1);
            assert_eq!(header.index as usize, i);
            assert_eq!(header.count as usize, fragments.len());
            assert_eq!(header.frame_length, 3000);
            assert!(fragment.len() <= FRAGMENT_HEADER_SIZE + MAX_FRAGMENT_PAYLOAD);
        }
    }

    #[test]
    fn test_frame_ids_increase_and_wrap() {
        let mut fragmenter = Fragmenter::with_start(u32::MAX, 100);
        let a = fragmenter.fragment(&frame(10)).unwrap();
        let b = fragmenter.fragment(&frame(10)).unwrap();
        assert_eq!(FragmentHeader::from_bytes(&a[0]).unwrap().frame_id, u32::MAX);
        assert_eq!(FragmentHeader::from_bytes(&b[0]).unwrap().frame_id, 0);
    }

    #[test]
    fn test_empty_frame() {
        let mut fragmenter = Fragmenter::with_start(5, 100);
        assert!(fragmenter.fragment(&[]).unwrap().is_empty());
        let next = fragmenter.fragment(&[1]).unwrap();
        assert_eq!(FragmentHeader::from_bytes(&next[0]).unwrap().frame_id, 5);
    }

    #[test]
    fn test_reverse_order_reassembly() {
        let now = Instant::now();
        let mut fragmenter = Fragmenter::new();
        let data = frame(3000);
        let fragments = fragmenter.fragment(&data).unwrap();
        let mut reassembler = reassembler();

        let last = fragments.len() - 1;
        let mut completed = Vec::new();
        for (i, fragment) in fragments.iter().enumerate().rev() {
            // only the first-sent fragment carries the keyframe flag
            if let Some(done) = reassembler.add_fragment(fragment, i == 0, now) {
                completed.push(done);
            }
            if i > 0 {
                assert!(completed.is_empty(), "completed early at {} of {}", i, last);
            }
        }

        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].data, data);
        assert!(completed[0].is_keyframe);
        assert_eq!(reassembler.pending_frames(), 0);
    }

    #[test]
    fn test_missing_fragment_then_arrival() {
        let now = Instant::now();
        let mut fragmenter = Fragmenter::with_start(9, 100);
        let data = frame(350);
        let fragments = fragmenter.fragment(&data).unwrap();
        assert_eq!(fragments.len(), 4);

        let mut reassembler = reassembler();
        for i in [0, 1, 3] {
            assert!(reassembler.add_fragment(&fragments[i], false, now).is_none());
        }
        // duplicate does not complete the frame
        assert!(reassembler.add_fragment(&fragments[1], false, now).is_none());

        let done = reassembler.add_fragment(&fragments[2], false, now).unwrap();
        assert_eq!(done.frame_id, 9);
        assert_eq!(done.data, data);
        assert!(!done.is_keyframe);
    }

    #[test]
    fn test_cleanup_removes_stale_partial_frame() {
        let start = Instant::now();
        let mut fragmenter = Fragmenter::with_start(1, 100);
        let fragments = fragmenter.fragment(&frame(250)).unwrap();

        let mut reassembler = reassembler();
        reassembler.add_fragment(&fragments[0], false, start);
        assert_eq!(reassembler.cleanup(start + Duration::from_millis(500)), 0);
        assert_eq!(reassembler.pending_frames(), 1);

        assert_eq!(reassembler.cleanup(start + Duration::from_millis(1000)), 1);
        assert_eq!(reassembler.pending_frames(), 0);
        assert_eq!(reassembler.frames_dropped(), 1);

        // late fragments start a new partial frame that never completes alone
        assert!(reassembler.add_fragment(&fragments[1], false, start).is_none());
    }

    #[test]
    fn test_degenerate_headers_rejected() {
        let now = Instant::now();
        let mut reassembler = reassembler();

        let zero_count = FragmentHeader {
            frame_id: 1,
            index: 0,
            count: 0,
            frame_length: 0,
        };
        assert!(reassembler
            .add_fragment(&zero_count.to_bytes(), false, now)
            .is_none());

        let bad_index = FragmentHeader {
            frame_id: 1,
            index: 2,
            count: 2,
            frame_length: 4,
        };
        assert!(reassembler
            .add_fragment(&bad_index.to_bytes(), false, now)
            .is_none());
        assert!(reassembler.add_fragment(&[0u8; 5], false, now).is_none());

        // a length no `count` fragments could carry
        let oversized = FragmentHeader {
            frame_id: 2,
            index: 0,
            count: 2,
            frame_length: u32::MAX,
        };
        let mut payload = oversized.to_bytes().to_vec();
        payload.extend_from_slice(&[7u8; 16]);
        assert!(reassembler.add_fragment(&payload, false, now).is_none());
        assert_eq!(reassembler.pending_frames(), 0);
    }

    #[test]
    fn test_length_mismatch_dropped() {
        let now = Instant::now();
        let header = FragmentHeader {
            frame_id: 3,
            index: 0,
            count: 1,
            frame_length: 10,
        };
        let mut payload = header.to_bytes().to_vec();
        payload.extend_from_slice(&[1, 2, 3]);

        let mut reassembler = reassembler();
        assert!(reassembler.add_fragment(&payload, false, now).is_none());
        assert_eq!(reassembler.pending_frames(), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let start = Instant::now();
        let mut fragmenter = Fragmenter::with_start(100, 10);
        let mut reassembler = Reassembler::new(2, Duration::from_secs(1));

        let first = fragmenter.fragment(&frame(20)).unwrap();
        let second = fragmenter.fragment(&frame(20)).unwrap();
        let third = fragmenter.fragment(&frame(20)).unwrap();

        reassembler.add_fragment(&first[0], false, start);
        reassembler.add_fragment(&second[0], false, start + Duration::from_millis(1));
        reassembler.add_fragment(&third[0], false, start + Duration::from_millis(2));
        assert_eq!(reassembler.pending_frames(), 2);
        assert_eq!(reassembler.frames_dropped(), 1);

        // the oldest frame was evicted, so its second half starts over
        assert!(reassembler
            .add_fragment(&first[1], false, start + Duration::from_millis(3))
            .is_none());
        // the newest still completes
        let done = reassembler
            .add_fragment(&third[1], false, start + Duration::from_millis(4))
            .unwrap();
        assert_eq!(done.frame_id, 102);
    }
}
