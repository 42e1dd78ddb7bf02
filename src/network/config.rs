//! Session configuration
//!
//! [`SessionConfig`] holds transport tuning (timeouts, intervals, cache
//! bounds) and can be loaded from JSON; [`SessionParams`] is what signaling
//! hands over for one call.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{Codec, ParticipantInfo};

/// Transport tuning knobs, all durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Local address to bind the UDP socket to
    pub bind_addr: String,
    /// Handshake must complete within this bound
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub receiver_report_interval_ms: u64,
    /// Period of the cache/reassembly cleanup sweep
    pub cleanup_interval_ms: u64,
    /// Incomplete frames older than this are dropped
    pub reassembly_max_age_ms: u64,
    /// Maximum incomplete frames held per remote video stream
    pub reassembly_capacity: usize,
    pub retransmit_max_age_ms: u64,
    pub retransmit_capacity: usize,
    pub nack_interval_ms: u64,
    pub pli_interval_ms: u64,
    /// Gaps younger than this are treated as reordering, not loss
    pub missing_grace_ms: u64,
    /// Gaps older than this are no longer NACKed
    pub missing_max_age_ms: u64,
    /// Upper bound on the best-effort BYE send during disconnect
    pub bye_grace_ms: u64,
    /// Maximum remote streams tracked (stats, replay filters, reassembly)
    pub max_remote_streams: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            connect_timeout_ms: 10_000,
            ping_interval_ms: 5_000,
            receiver_report_interval_ms: 250,
            cleanup_interval_ms: 250,
            reassembly_max_age_ms: 1_000,
            reassembly_capacity: 64,
            retransmit_max_age_ms: 500,
            retransmit_capacity: 500,
            nack_interval_ms: 50,
            pli_interval_ms: 500,
            missing_grace_ms: 35,
            missing_max_age_ms: 1_000,
            bye_grace_ms: 200,
            max_remote_streams: 256,
        }
    }
}

impl SessionConfig {
    /// Replace zero values with defaults
    pub fn validated(self) -> Self {
        let defaults = Self::default();
        let pick = |value: u64, default: u64| if value == 0 { default } else { value };
        let pick_size = |value: usize, default: usize| if value == 0 { default } else { value };

        Self {
            bind_addr: if self.bind_addr.is_empty() {
                defaults.bind_addr
            } else {
                self.bind_addr
            },
            connect_timeout_ms: pick(self.connect_timeout_ms, defaults.connect_timeout_ms),
            ping_interval_ms: pick(self.ping_interval_ms, defaults.ping_interval_ms),
            receiver_report_interval_ms: pick(
                self.receiver_report_interval_ms,
                defaults.receiver_report_interval_ms,
            ),
            cleanup_interval_ms: pick(self.cleanup_interval_ms, defaults.cleanup_interval_ms),
            reassembly_max_age_ms: pick(self.reassembly_max_age_ms, defaults.reassembly_max_age_ms),
            reassembly_capacity: pick_size(self.reassembly_capacity, defaults.reassembly_capacity),
            retransmit_max_age_ms: pick(self.retransmit_max_age_ms, defaults.retransmit_max_age_ms),
            retransmit_capacity: pick_size(self.retransmit_capacity, defaults.retransmit_capacity),
            nack_interval_ms: pick(self.nack_interval_ms, defaults.nack_interval_ms),
            pli_interval_ms: pick(self.pli_interval_ms, defaults.pli_interval_ms),
            // zero grace is meaningful: NACK immediately
            missing_grace_ms: self.missing_grace_ms,
            missing_max_age_ms: pick(self.missing_max_age_ms, defaults.missing_max_age_ms),
            bye_grace_ms: pick(self.bye_grace_ms, defaults.bye_grace_ms),
            max_remote_streams: pick_size(self.max_remote_streams, defaults.max_remote_streams),
        }
    }

    /// Parse a JSON config; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Self>(json).map(Self::validated)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn receiver_report_interval(&self) -> Duration {
        Duration::from_millis(self.receiver_report_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn reassembly_max_age(&self) -> Duration {
        Duration::from_millis(self.reassembly_max_age_ms)
    }

    pub fn retransmit_max_age(&self) -> Duration {
        Duration::from_millis(self.retransmit_max_age_ms)
    }

    pub fn nack_interval(&self) -> Duration {
        Duration::from_millis(self.nack_interval_ms)
    }

    pub fn pli_interval(&self) -> Duration {
        Duration::from_millis(self.pli_interval_ms)
    }

    pub fn missing_grace(&self) -> Duration {
        Duration::from_millis(self.missing_grace_ms)
    }

    pub fn missing_max_age(&self) -> Duration {
        Duration::from_millis(self.missing_max_age_ms)
    }

    pub fn bye_grace(&self) -> Duration {
        Duration::from_millis(self.bye_grace_ms)
    }
}

/// Everything signaling negotiated for one call
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub host: String,
    pub port: u16,
    pub server_id: Option<String>,
    /// One-time voice token presented in HELLO
    pub token: String,
    pub room_id: String,
    pub user_id: String,
    pub audio_codec: Codec,
    /// `None` for audio-only calls
    pub video_codec: Option<Codec>,
    pub key_id: u8,
    /// 256-bit AEAD key material
    pub key: Vec<u8>,
    pub participants: Vec<ParticipantInfo>,
}
