//! Network module for encrypted media sessions
//!
//! Handles UDP transport, AEAD sealing, replay protection, fragmentation,
//! loss recovery feedback, statistics, and the session state machine.

mod config;
mod error;
mod events;
mod fragment;
mod keyring;
mod replay;
mod retransmit;
mod session;
mod state;
mod stats;
mod transport;

pub use config::{SessionConfig, SessionParams};
pub use error::{KeyError, NetworkError};
pub use events::{AudioFrame, ConnectedInfo, LocalSsrcs, SessionEvent, VideoFrame};
pub use fragment::{CompletedFrame, Fragmenter, Reassembler};
pub use keyring::{KeyRing, KEY_SIZE};
pub use replay::{ReplayFilter, ReplayFilters, REPLAY_WINDOW_SIZE};
pub use retransmit::{NackTracker, PliTracker, RetransmitCache};
pub use session::TransportSession;
pub use state::{SessionState, VideoSource, MAX_NACK_SEQUENCES};
pub use stats::{
    RemoteReport, SequenceTracker, SessionStats, StatsCollector, StreamStats,
    MAX_SEQUENCE_JUMP, MAX_TRACKED_MISSING,
};
pub use transport::{UdpTransport, RECV_BUFFER_SIZE};
