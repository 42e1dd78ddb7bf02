//! Network protocol definitions
//!
//! Defines the binary media/feedback packets and the JSON control packets.

mod control;
mod packet;

pub use control::{
    Codec, ControlMessage, CryptoParams, Hello, MediaState, ParticipantInfo, ParticipantLeft,
    Speaking, Subscribe, Welcome, AEAD_ALGORITHM, PROTOCOL_VERSION,
};
pub(crate) use control::named_ssrcs;
pub use packet::{
    Bye, FragmentHeader, MalformedPacket, MediaHeader, MediaKind, Nack, PacketType, Pli,
    ReceiverReport, Timestamped, AUTH_TAG_SIZE, FLAG_KEYFRAME, FRAGMENT_HEADER_SIZE,
    MAX_FRAGMENT_PAYLOAD, MAX_PACKET_SIZE, MEDIA_HEADER_SIZE, MTU, RECEIVER_REPORT_SIZE,
};
