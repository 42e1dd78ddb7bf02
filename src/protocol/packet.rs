//! Binary packet definitions for the callwire protocol
//!
//! Every datagram starts with a one-byte packet type. Media packets carry a
//! fixed 24-byte header:
//! - type: 1 byte (AUDIO or VIDEO)
//! - flags: 1 byte (bit 0 = keyframe)
//! - key id: 1 byte
//! - codec: 1 byte
//! - sequence: 2 bytes (big-endian)
//! - timestamp: 4 bytes (big-endian, RTP clock units)
//! - ssrc: 4 bytes (big-endian)
//! - counter: 8 bytes (big-endian, AEAD nonce input)
//! - reserved: 2 bytes
//!
//! Video payloads are additionally prefixed (inside the sealed payload) with a
//! 12-byte fragment header.

use thiserror::Error;

/// Media header size in bytes
pub const MEDIA_HEADER_SIZE: usize = 24;

/// Fragment header size in bytes
pub const FRAGMENT_HEADER_SIZE: usize = 12;

/// AES-GCM authentication tag size
pub const AUTH_TAG_SIZE: usize = 16;

/// Target datagram size used for fragmentation
pub const MTU: usize = 1200;

/// Largest video payload that fits one fragment packet
/// 1200 - 24 - 12 - 16 = 1148 bytes
pub const MAX_FRAGMENT_PAYLOAD: usize =
    MTU - MEDIA_HEADER_SIZE - FRAGMENT_HEADER_SIZE - AUTH_TAG_SIZE;

/// Hard upper bound for any outbound datagram
pub const MAX_PACKET_SIZE: usize = 1500;

/// Keyframe bit in the media header flags
pub const FLAG_KEYFRAME: u8 = 0x01;

/// Receiver report body size (after the type byte)
pub const RECEIVER_REPORT_SIZE: usize = 24;

/// Errors produced when a datagram cannot be decoded.
///
/// These are never surfaced to the application: the session drops the packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedPacket {
    #[error("packet too short: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("unknown packet type 0x{0:02x}")]
    UnknownType(u8),

    #[error("expected packet type {expected:?}, got 0x{got:02x}")]
    WrongType { expected: PacketType, got: u8 },

    #[error("invalid control body: {0}")]
    InvalidBody(String),
}

/// Packet types (first byte of every datagram)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Hello = 0x01,
    Welcome = 0x02,
    Audio = 0x03,
    Video = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    Bye = 0x07,
    Speaking = 0x08,
    MediaState = 0x09,
    Nack = 0x0a,
    Pli = 0x0b,
    ReceiverReport = 0x0c,
    ParticipantLeft = 0x0d,
    Subscribe = 0x0e,
}

impl TryFrom<u8> for PacketType {
    type Error = MalformedPacket;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Hello),
            0x02 => Ok(PacketType::Welcome),
            0x03 => Ok(PacketType::Audio),
            0x04 => Ok(PacketType::Video),
            0x05 => Ok(PacketType::Ping),
            0x06 => Ok(PacketType::Pong),
            0x07 => Ok(PacketType::Bye),
            0x08 => Ok(PacketType::Speaking),
            0x09 => Ok(PacketType::MediaState),
            0x0a => Ok(PacketType::Nack),
            0x0b => Ok(PacketType::Pli),
            0x0c => Ok(PacketType::ReceiverReport),
            0x0d => Ok(PacketType::ParticipantLeft),
            0x0e => Ok(PacketType::Subscribe),
            other => Err(MalformedPacket::UnknownType(other)),
        }
    }
}

impl PacketType {
    /// Read the packet type from the first byte of a datagram
    pub fn of(data: &[u8]) -> Result<Self, MalformedPacket> {
        let first = *data
            .first()
            .ok_or(MalformedPacket::Truncated { need: 1, got: 0 })?;
        PacketType::try_from(first)
    }
}

/// Kind of media carried by a media packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn packet_type(self) -> PacketType {
        match self {
            MediaKind::Audio => PacketType::Audio,
            MediaKind::Video => PacketType::Video,
        }
    }

    /// RTP clock rate used for timestamps of this media kind
    pub fn clock_rate(self) -> u32 {
        match self {
            MediaKind::Audio => 48_000,
            MediaKind::Video => 90_000,
        }
    }
}

fn ensure_len(data: &[u8], need: usize) -> Result<(), MalformedPacket> {
    if data.len() < need {
        return Err(MalformedPacket::Truncated {
            need,
            got: data.len(),
        });
    }
    Ok(())
}

fn ensure_type(data: &[u8], expected: PacketType) -> Result<(), MalformedPacket> {
    ensure_len(data, 1)?;
    if data[0] != expected as u8 {
        return Err(MalformedPacket::WrongType {
            expected,
            got: data[0],
        });
    }
    Ok(())
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_be_bytes(buf)
}

/// Fixed header of every AUDIO/VIDEO packet.
///
/// The encoded bytes double as AEAD associated data, so any change to a field
/// invalidates the packet's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaHeader {
    pub kind: MediaKind,
    pub flags: u8,
    pub key_id: u8,
    pub codec: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub counter: u64,
}

impl MediaHeader {
    pub fn is_keyframe(&self) -> bool {
        self.flags & FLAG_KEYFRAME != 0
    }

    /// Serialize the header to its 24-byte wire form
    pub fn to_bytes(&self) -> [u8; MEDIA_HEADER_SIZE] {
        let mut buf = [0u8; MEDIA_HEADER_SIZE];
        buf[0] = self.kind.packet_type() as u8;
        buf[1] = self.flags;
        buf[2] = self.key_id;
        buf[3] = self.codec;
        buf[4..6].copy_from_slice(&self.sequence.to_be_bytes());
        buf[6..10].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[10..14].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[14..22].copy_from_slice(&self.counter.to_be_bytes());
        // 22..24 reserved
        buf
    }

    /// Parse the header from the start of a datagram
    pub fn from_bytes(data: &[u8]) -> Result<Self, MalformedPacket> {
        ensure_len(data, MEDIA_HEADER_SIZE)?;

        let kind = match PacketType::try_from(data[0])? {
            PacketType::Audio => MediaKind::Audio,
            PacketType::Video => MediaKind::Video,
            _ => return Err(MalformedPacket::UnknownType(data[0])),
        };

        Ok(Self {
            kind,
            flags: data[1],
            key_id: data[2],
            codec: data[3],
            sequence: read_u16(data, 4),
            timestamp: read_u32(data, 6),
            ssrc: read_u32(data, 10),
            counter: read_u64(data, 14),
        })
    }
}

/// Header prepended to every video fragment, inside the sealed payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub frame_id: u32,
    pub index: u16,
    pub count: u16,
    pub frame_length: u32,
}

impl FragmentHeader {
    pub fn to_bytes(&self) -> [u8; FRAGMENT_HEADER_SIZE] {
        let mut buf = [0u8; FRAGMENT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.frame_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.index.to_be_bytes());
        buf[6..8].copy_from_slice(&self.count.to_be_bytes());
        buf[8..12].copy_from_slice(&self.frame_length.to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MalformedPacket> {
        ensure_len(data, FRAGMENT_HEADER_SIZE)?;
        Ok(Self {
            frame_id: read_u32(data, 0),
            index: read_u16(data, 4),
            count: read_u16(data, 6),
            frame_length: read_u32(data, 8),
        })
    }
}

/// PING / PONG body: an 8-byte send timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamped {
    pub packet_type: PacketType,
    pub sent_ms: u64,
}

impl Timestamped {
    pub fn ping(sent_ms: u64) -> Self {
        Self {
            packet_type: PacketType::Ping,
            sent_ms,
        }
    }

    pub fn pong(sent_ms: u64) -> Self {
        Self {
            packet_type: PacketType::Pong,
            sent_ms,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9);
        buf.push(self.packet_type as u8);
        buf.extend_from_slice(&self.sent_ms.to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MalformedPacket> {
        let packet_type = PacketType::of(data)?;
        if !matches!(packet_type, PacketType::Ping | PacketType::Pong) {
            return Err(MalformedPacket::WrongType {
                expected: PacketType::Ping,
                got: data[0],
            });
        }
        ensure_len(data, 9)?;
        Ok(Self {
            packet_type,
            sent_ms: read_u64(data, 1),
        })
    }
}

/// BYE: the departing stream's SSRC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bye {
    pub ssrc: u32,
}

impl Bye {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        buf.push(PacketType::Bye as u8);
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MalformedPacket> {
        ensure_type(data, PacketType::Bye)?;
        ensure_len(data, 5)?;
        Ok(Self {
            ssrc: read_u32(data, 1),
        })
    }
}

/// NACK: retransmission request for sequences of one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub ssrc: u32,
    pub sequences: Vec<u16>,
}

impl Nack {
    pub fn to_bytes(&self) -> Vec<u8> {
        let count = self.sequences.len().min(u16::MAX as usize);
        let mut buf = Vec::with_capacity(7 + count * 2);
        buf.push(PacketType::Nack as u8);
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.extend_from_slice(&(count as u16).to_be_bytes());
        for seq in &self.sequences[..count] {
            buf.extend_from_slice(&seq.to_be_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MalformedPacket> {
        ensure_type(data, PacketType::Nack)?;
        ensure_len(data, 7)?;
        let ssrc = read_u32(data, 1);
        let count = read_u16(data, 5) as usize;
        ensure_len(data, 7 + count * 2)?;
        let sequences = (0..count).map(|i| read_u16(data, 7 + i * 2)).collect();
        Ok(Self { ssrc, sequences })
    }
}

/// PLI: keyframe request for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pli {
    pub ssrc: u32,
}

impl Pli {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        buf.push(PacketType::Pli as u8);
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MalformedPacket> {
        ensure_type(data, PacketType::Pli)?;
        ensure_len(data, 5)?;
        Ok(Self {
            ssrc: read_u32(data, 1),
        })
    }
}

/// Receiver report describing how one remote stream is being received
///
/// Layout after the type byte: target ssrc (4), reporter ssrc (4),
/// fraction lost x255 (1), cumulative lost (3), highest sequence (4),
/// jitter (4), reserved (4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reporter_ssrc: u32,
    pub fraction_lost: u8,
    /// Only the low 24 bits are transmitted
    pub cumulative_lost: u32,
    pub highest_sequence: u32,
    pub jitter: u32,
}

impl ReceiverReport {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + RECEIVER_REPORT_SIZE);
        buf.push(PacketType::ReceiverReport as u8);
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.extend_from_slice(&self.reporter_ssrc.to_be_bytes());
        buf.push(self.fraction_lost);
        let lost = self.cumulative_lost.min(0x00FF_FFFF).to_be_bytes();
        buf.extend_from_slice(&lost[1..4]);
        buf.extend_from_slice(&self.highest_sequence.to_be_bytes());
        buf.extend_from_slice(&self.jitter.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MalformedPacket> {
        ensure_type(data, PacketType::ReceiverReport)?;
        ensure_len(data, 1 + RECEIVER_REPORT_SIZE)?;
        Ok(Self {
            ssrc: read_u32(data, 1),
            reporter_ssrc: read_u32(data, 5),
            fraction_lost: data[9],
            cumulative_lost: u32::from_be_bytes([0, data[10], data[11], data[12]]),
            highest_sequence: read_u32(data, 13),
            jitter: read_u32(data, 17),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> MediaHeader {
        MediaHeader {
            kind: MediaKind::Video,
            flags: FLAG_KEYFRAME,
            key_id: 7,
            codec: 2,
            sequence: 0xBEEF,
            timestamp: 0x0102_0304,
            ssrc: 0xDEAD_BEEF,
            counter: 0x1122_3344_5566_7788,
        }
    }

    #[test]
    fn test_media_header_roundtrip() {
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), MEDIA_HEADER_SIZE);
        assert_eq!(MediaHeader::from_bytes(&bytes), Ok(header));
        assert!(header.is_keyframe());
    }

    #[test]
    fn test_media_header_layout() {
        let bytes = sample_header().to_bytes();
        assert_eq!(bytes[0], PacketType::Video as u8);
        assert_eq!(bytes[1], FLAG_KEYFRAME);
        assert_eq!(bytes[2], 7);
        assert_eq!(&bytes[4..6], &[0xBE, 0xEF]);
        assert_eq!(&bytes[10..14], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(bytes[14], 0x11);
        assert_eq!(bytes[21], 0x88);
        assert_eq!(&bytes[22..24], &[0, 0]);
    }

    #[test]
    fn test_media_header_too_short() {
        let bytes = sample_header().to_bytes();
        let result = MediaHeader::from_bytes(&bytes[..MEDIA_HEADER_SIZE - 1]);
        assert_eq!(
            result,
            Err(MalformedPacket::Truncated {
                need: MEDIA_HEADER_SIZE,
                got: MEDIA_HEADER_SIZE - 1
            })
        );
    }

    #[test]
    fn test_media_header_rejects_control_type() {
        let mut bytes = sample_header().to_bytes();
        bytes[0] = PacketType::Ping as u8;
        assert!(MediaHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_fragment_header_roundtrip() {
        let header = FragmentHeader {
            frame_id: u32::MAX,
            index: 3,
            count: 4,
            frame_length: 4000,
        };
        assert_eq!(FragmentHeader::from_bytes(&header.to_bytes()), Ok(header));
        assert!(FragmentHeader::from_bytes(&[0u8; 11]).is_err());
    }

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::try_from(0x01), Ok(PacketType::Hello));
        assert_eq!(PacketType::try_from(0x0c), Ok(PacketType::ReceiverReport));
        assert_eq!(PacketType::try_from(0x0e), Ok(PacketType::Subscribe));
        assert_eq!(
            PacketType::try_from(0xFF),
            Err(MalformedPacket::UnknownType(0xFF))
        );
        assert!(PacketType::of(&[]).is_err());
    }

    #[test]
    fn test_ping_pong() {
        let ping = Timestamped::ping(1_700_000_000_123);
        let bytes = ping.to_bytes();
        assert_eq!(bytes.len(), 9);
        assert_eq!(Timestamped::from_bytes(&bytes), Ok(ping));

        let pong = Timestamped::pong(42);
        assert_eq!(Timestamped::from_bytes(&pong.to_bytes()), Ok(pong));
        assert!(Timestamped::from_bytes(&bytes[..8]).is_err());
    }

    #[test]
    fn test_nack_layout() {
        let nack = Nack {
            ssrc: 1000,
            sequences: vec![1, 65535, 7],
        };
        let bytes = nack.to_bytes();
        assert_eq!(bytes.len(), 7 + 6);
        assert_eq!(&bytes[5..7], &[0, 3]);
        assert_eq!(Nack::from_bytes(&bytes), Ok(nack));

        // count claims more sequences than present
        assert!(Nack::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_bye_and_pli() {
        let bye = Bye { ssrc: 99 };
        assert_eq!(Bye::from_bytes(&bye.to_bytes()), Ok(bye));
        let pli = Pli { ssrc: 100 };
        assert_eq!(Pli::from_bytes(&pli.to_bytes()), Ok(pli));
        assert!(Pli::from_bytes(&bye.to_bytes()).is_err());
    }

    #[test]
    fn test_receiver_report_layout() {
        let report = ReceiverReport {
            ssrc: 1,
            reporter_ssrc: 2,
            fraction_lost: 128,
            cumulative_lost: 0x0012_3456,
            highest_sequence: 70_000,
            jitter: 12,
        };
        let bytes = report.to_bytes();
        assert_eq!(bytes.len(), 1 + RECEIVER_REPORT_SIZE);
        assert_eq!(&bytes[10..13], &[0x12, 0x34, 0x56]);
        assert_eq!(ReceiverReport::from_bytes(&bytes), Ok(report));
    }

    #[test]
    fn test_receiver_report_clamps_cumulative_lost() {
        let report = ReceiverReport {
            cumulative_lost: u32::MAX,
            ..Default::default()
        };
        let decoded = ReceiverReport::from_bytes(&report.to_bytes()).unwrap();
        assert_eq!(decoded.cumulative_lost, 0x00FF_FFFF);
    }

    #[test]
    fn test_max_fragment_payload() {
        assert_eq!(MAX_FRAGMENT_PAYLOAD, 1148);
    }
}
