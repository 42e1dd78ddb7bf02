//! JSON-bodied control packets
//!
//! Wire form is `[type byte][UTF-8 JSON]`. Encoders emit camelCase field
//! names; decoders also accept the snake_case spellings, and user/session ids
//! given as JSON numbers are normalized to strings here so nothing downstream
//! has to care.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use super::packet::{MalformedPacket, PacketType};

/// Protocol version announced in HELLO
pub const PROTOCOL_VERSION: u8 = 1;

/// AEAD algorithm name announced in HELLO
pub const AEAD_ALGORITHM: &str = "aes-256-gcm";

/// Media codecs negotiated by signaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Opus,
    Vp8,
    Vp9,
    H264,
    Av1,
}

impl Codec {
    /// Codec byte carried in the media header
    pub fn id(self) -> u8 {
        match self {
            Codec::Opus => 1,
            Codec::Vp8 => 2,
            Codec::Vp9 => 3,
            Codec::H264 => 4,
            Codec::Av1 => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::Opus => "opus",
            Codec::Vp8 => "vp8",
            Codec::Vp9 => "vp9",
            Codec::H264 => "h264",
            Codec::Av1 => "av1",
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "opus" => Ok(Codec::Opus),
            "vp8" => Ok(Codec::Vp8),
            "vp9" => Ok(Codec::Vp9),
            "h264" => Ok(Codec::H264),
            "av1" => Ok(Codec::Av1),
            other => Err(format!("unknown codec: {}", other)),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Number(u64),
}

impl From<IdRepr> for String {
    fn from(value: IdRepr) -> Self {
        match value {
            IdRepr::Text(s) => s,
            IdRepr::Number(n) => n.to_string(),
        }
    }
}

fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    IdRepr::deserialize(deserializer).map(String::from)
}

fn de_opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<IdRepr>::deserialize(deserializer)?.map(String::from))
}

/// Absent or null SSRCs decode as 0 ("no stream")
fn de_ssrc<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    Ok(Option::<u32>::deserialize(deserializer)?.unwrap_or(0))
}

/// Shared encode/decode for every JSON control packet
pub trait ControlMessage: Serialize + DeserializeOwned {
    const PACKET_TYPE: PacketType;

    fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut buf = vec![Self::PACKET_TYPE as u8];
        serde_json::to_writer(&mut buf, self)?;
        Ok(buf)
    }

    fn from_bytes(data: &[u8]) -> Result<Self, MalformedPacket> {
        let first = *data
            .first()
            .ok_or(MalformedPacket::Truncated { need: 1, got: 0 })?;
        if first != Self::PACKET_TYPE as u8 {
            return Err(MalformedPacket::WrongType {
                expected: Self::PACKET_TYPE,
                got: first,
            });
        }
        serde_json::from_slice(&data[1..]).map_err(|e| MalformedPacket::InvalidBody(e.to_string()))
    }
}

/// A call participant as described by the server
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    #[serde(alias = "user_id", deserialize_with = "de_id")]
    pub user_id: String,
    /// Audio SSRC (0 = absent)
    #[serde(
        default,
        alias = "audioSsrc",
        alias = "audio_ssrc",
        deserialize_with = "de_ssrc"
    )]
    pub ssrc: u32,
    #[serde(default, alias = "video_ssrc", deserialize_with = "de_ssrc")]
    pub video_ssrc: u32,
    #[serde(default, alias = "screen_ssrc", deserialize_with = "de_ssrc")]
    pub screen_ssrc: u32,
    #[serde(default)]
    pub muted: bool,
    #[serde(default, alias = "video_enabled")]
    pub video_enabled: bool,
    #[serde(default, alias = "screen_sharing")]
    pub screen_sharing: bool,
    #[serde(default)]
    pub speaking: bool,
    #[serde(default, alias = "display_name", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, alias = "avatar_url", skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl ParticipantInfo {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// All non-zero SSRCs owned by this participant
    pub fn ssrcs(&self) -> impl Iterator<Item = u32> {
        [self.ssrc, self.video_ssrc, self.screen_ssrc]
            .into_iter()
            .filter(|s| *s != 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoParams {
    pub aead: String,
    #[serde(alias = "key_id")]
    pub key_id: u8,
}

/// HELLO: first packet of the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub token: String,
    #[serde(alias = "protocol_version")]
    pub protocol_version: u8,
    pub codec: Codec,
    #[serde(alias = "room_id", deserialize_with = "de_id")]
    pub room_id: String,
    #[serde(alias = "user_id", deserialize_with = "de_id")]
    pub user_id: String,
    #[serde(
        default,
        alias = "server_id",
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub server_id: Option<String>,
    #[serde(default)]
    pub video: bool,
    #[serde(default, alias = "video_codec", skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<Codec>,
    pub crypto: CryptoParams,
}

impl ControlMessage for Hello {
    const PACKET_TYPE: PacketType = PacketType::Hello;
}

/// WELCOME: handshake reply assigning local SSRCs and the roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    #[serde(alias = "session_id", deserialize_with = "de_id")]
    pub session_id: String,
    #[serde(
        default,
        alias = "audioSsrc",
        alias = "audio_ssrc",
        deserialize_with = "de_ssrc"
    )]
    pub ssrc: u32,
    #[serde(default, alias = "video_ssrc", deserialize_with = "de_ssrc")]
    pub video_ssrc: u32,
    #[serde(default, alias = "screen_ssrc", deserialize_with = "de_ssrc")]
    pub screen_ssrc: u32,
    #[serde(default)]
    pub participants: Vec<ParticipantInfo>,
}

impl ControlMessage for Welcome {
    const PACKET_TYPE: PacketType = PacketType::Welcome;
}

/// SPEAKING: voice activity of one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Speaking {
    #[serde(
        default,
        alias = "user_id",
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    #[serde(
        default,
        alias = "audioSsrc",
        alias = "audio_ssrc",
        skip_serializing_if = "Option::is_none"
    )]
    pub ssrc: Option<u32>,
    #[serde(default, alias = "video_ssrc", skip_serializing_if = "Option::is_none")]
    pub video_ssrc: Option<u32>,
    #[serde(default, alias = "screen_ssrc", skip_serializing_if = "Option::is_none")]
    pub screen_ssrc: Option<u32>,
    pub speaking: bool,
}

impl ControlMessage for Speaking {
    const PACKET_TYPE: PacketType = PacketType::Speaking;
}

/// MEDIA_STATE: mute / camera / screen-share flags of one participant
///
/// Absent flags leave the known value untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    #[serde(
        default,
        alias = "user_id",
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    #[serde(
        default,
        alias = "audioSsrc",
        alias = "audio_ssrc",
        skip_serializing_if = "Option::is_none"
    )]
    pub ssrc: Option<u32>,
    #[serde(default, alias = "video_ssrc", skip_serializing_if = "Option::is_none")]
    pub video_ssrc: Option<u32>,
    #[serde(default, alias = "screen_ssrc", skip_serializing_if = "Option::is_none")]
    pub screen_ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, alias = "video_enabled", skip_serializing_if = "Option::is_none")]
    pub video_enabled: Option<bool>,
    #[serde(default, alias = "screen_sharing", skip_serializing_if = "Option::is_none")]
    pub screen_sharing: Option<bool>,
}

impl ControlMessage for MediaState {
    const PACKET_TYPE: PacketType = PacketType::MediaState;
}

/// PARTICIPANT_LEFT: a participant's streams are gone
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantLeft {
    #[serde(
        default,
        alias = "user_id",
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    #[serde(
        default,
        alias = "audioSsrc",
        alias = "audio_ssrc",
        skip_serializing_if = "Option::is_none"
    )]
    pub ssrc: Option<u32>,
    #[serde(default, alias = "video_ssrc", skip_serializing_if = "Option::is_none")]
    pub video_ssrc: Option<u32>,
    #[serde(default, alias = "screen_ssrc", skip_serializing_if = "Option::is_none")]
    pub screen_ssrc: Option<u32>,
}

impl ControlMessage for ParticipantLeft {
    const PACKET_TYPE: PacketType = PacketType::ParticipantLeft;
}

/// SUBSCRIBE: remote SSRCs this client wants forwarded
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Subscribe {
    #[serde(default)]
    pub subscriptions: Vec<u32>,
}

impl ControlMessage for Subscribe {
    const PACKET_TYPE: PacketType = PacketType::Subscribe;
}

/// Non-zero SSRCs named by an optional audio/video/screen triple
pub(crate) fn named_ssrcs(
    ssrc: Option<u32>,
    video_ssrc: Option<u32>,
    screen_ssrc: Option<u32>,
) -> Vec<u32> {
    [ssrc, video_ssrc, screen_ssrc]
        .into_iter()
        .flatten()
        .filter(|s| *s != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(packet_type: PacketType, json: &str) -> Vec<u8> {
        let mut buf = vec![packet_type as u8];
        buf.extend_from_slice(json.as_bytes());
        buf
    }

    #[test]
    fn test_hello_emits_primary_spelling() {
        let hello = Hello {
            token: "tok".into(),
            protocol_version: PROTOCOL_VERSION,
            codec: Codec::Opus,
            room_id: "r1".into(),
            user_id: "u1".into(),
            server_id: None,
            video: true,
            video_codec: Some(Codec::Vp8),
            crypto: CryptoParams {
                aead: AEAD_ALGORITHM.into(),
                key_id: 1,
            },
        };
        let bytes = hello.to_bytes().unwrap();
        assert_eq!(bytes[0], PacketType::Hello as u8);

        let json: serde_json::Value = serde_json::from_slice(&bytes[1..]).unwrap();
        assert_eq!(json["roomId"], "r1");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["videoCodec"], "vp8");
        assert_eq!(json["crypto"]["keyId"], 1);
        assert!(json.get("user_id").is_none());
        assert!(json.get("serverId").is_none());

        assert_eq!(Hello::from_bytes(&bytes).unwrap(), hello);
    }

    #[test]
    fn test_welcome_accepts_both_spellings() {
        let camel = body(
            PacketType::Welcome,
            r#"{"sessionId":"s1","ssrc":10,"videoSsrc":11,"screenSsrc":12,
                "participants":[{"userId":"a","ssrc":20,"videoSsrc":21,"displayName":"Ann"}]}"#,
        );
        let snake = body(
            PacketType::Welcome,
            r#"{"session_id":"s1","audio_ssrc":10,"video_ssrc":11,"screen_ssrc":12,
                "participants":[{"user_id":"a","audio_ssrc":20,"video_ssrc":21,"display_name":"Ann"}]}"#,
        );

        let a = Welcome::from_bytes(&camel).unwrap();
        let b = Welcome::from_bytes(&snake).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.video_ssrc, 11);
        assert_eq!(a.participants[0].ssrc, 20);
        assert_eq!(a.participants[0].display_name.as_deref(), Some("Ann"));
    }

    #[test]
    fn test_numeric_ids_become_strings() {
        let data = body(
            PacketType::Welcome,
            r#"{"sessionId":77,"participants":[{"userId":12345,"videoSsrc":null}]}"#,
        );
        let welcome = Welcome::from_bytes(&data).unwrap();
        assert_eq!(welcome.session_id, "77");
        assert_eq!(welcome.ssrc, 0);
        assert_eq!(welcome.participants[0].user_id, "12345");
        assert_eq!(welcome.participants[0].video_ssrc, 0);
    }

    #[test]
    fn test_media_state_partial_update() {
        let data = body(PacketType::MediaState, r#"{"user_id":"u","muted":true}"#);
        let state = MediaState::from_bytes(&data).unwrap();
        assert_eq!(state.user_id.as_deref(), Some("u"));
        assert_eq!(state.muted, Some(true));
        assert_eq!(state.video_enabled, None);
    }

    #[test]
    fn test_wrong_type_and_bad_json() {
        let data = body(PacketType::Speaking, r#"{"speaking":true}"#);
        assert!(matches!(
            MediaState::from_bytes(&data),
            Err(MalformedPacket::WrongType { .. })
        ));

        let broken = body(PacketType::Speaking, "{not json");
        assert!(matches!(
            Speaking::from_bytes(&broken),
            Err(MalformedPacket::InvalidBody(_))
        ));
        assert!(Speaking::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_participant_ssrcs_skip_absent() {
        let mut p = ParticipantInfo::new("u");
        p.ssrc = 5;
        p.screen_ssrc = 9;
        assert_eq!(p.ssrcs().collect::<Vec<_>>(), vec![5, 9]);
        assert_eq!(named_ssrcs(Some(0), None, Some(3)), vec![3]);
    }

    #[test]
    fn test_codec_ids() {
        let codecs = [Codec::Opus, Codec::Vp8, Codec::Vp9, Codec::H264, Codec::Av1];
        for codec in codecs {
            assert_eq!(codec.name().parse::<Codec>(), Ok(codec));
        }
        let mut ids: Vec<u8> = codecs.iter().map(|c| c.id()).collect();
        ids.dedup();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert!("mp3".parse::<Codec>().is_err());
    }
}
