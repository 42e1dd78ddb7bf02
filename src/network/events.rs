//! Events delivered from a session to the owning application

use crate::protocol::ParticipantInfo;

use super::error::NetworkError;

/// SSRCs the server assigned to our outbound streams (0 = not assigned)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalSsrcs {
    pub audio: u32,
    pub video: u32,
    pub screen: u32,
}

impl LocalSsrcs {
    pub fn contains(&self, ssrc: u32) -> bool {
        ssrc != 0 && (ssrc == self.audio || ssrc == self.video || ssrc == self.screen)
    }
}

/// Result of a completed handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedInfo {
    pub session_id: String,
    pub ssrcs: LocalSsrcs,
    pub participants: Vec<ParticipantInfo>,
}

/// One decrypted audio packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub ssrc: u32,
    pub user_id: Option<String>,
    pub sequence: u16,
    pub timestamp: u32,
    /// Presentation time in milliseconds, derived from the RTP timestamp
    pub pts_ms: u64,
    pub data: Vec<u8>,
}

/// One reassembled video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub ssrc: u32,
    pub user_id: Option<String>,
    pub frame_id: u32,
    /// Sequence of the fragment that completed the frame
    pub sequence: u16,
    pub timestamp: u32,
    pub pts_ms: u64,
    pub is_keyframe: bool,
    pub data: Vec<u8>,
}

/// Everything a session reports, delivered through one channel
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected(ConnectedInfo),
    Disconnected,
    /// Non-fatal transport failure after the handshake
    Error(NetworkError),
    Audio(AudioFrame),
    Video(VideoFrame),
    Speaking {
        user_id: String,
        ssrc: Option<u32>,
        speaking: bool,
    },
    MediaState {
        user_id: String,
        muted: bool,
        video_enabled: bool,
        screen_sharing: bool,
    },
    ParticipantJoined(ParticipantInfo),
    ParticipantUpdated(ParticipantInfo),
    ParticipantLeft {
        user_id: String,
        ssrcs: Vec<u32>,
    },
    /// Round-trip time in milliseconds
    Rtt(f64),
    /// The server asks for a keyframe on one of our video streams
    PliRequested {
        ssrc: u32,
    },
    DecryptError {
        ssrc: u32,
        key_id: u8,
        sequence: u16,
        failures: u64,
    },
}
