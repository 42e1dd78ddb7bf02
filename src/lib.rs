//! callwire - Encrypted UDP transport for real-time voice and video calls
//!
//! This library provides the client side of a call's media path: the wire
//! codec, AES-256-GCM sealing, replay protection, video fragmentation, loss
//! feedback, and the session that ties them to one voice server.

pub mod network;
pub mod protocol;

pub use network::{SessionConfig, SessionEvent, SessionParams, TransportSession};
pub use protocol::PacketType;
