//! Transport session tests against an in-process fake voice server
//!
//! Each test binds a plain UDP socket on loopback that plays the server side
//! of the protocol.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;

use callwire::network::{
    KeyRing, NetworkError, Reassembler, SessionConfig, SessionEvent, SessionParams, SessionState,
    TransportSession, VideoSource, KEY_SIZE,
};
use callwire::protocol::{
    Codec, ControlMessage, Hello, MediaHeader, MediaKind, Nack, PacketType, ParticipantInfo,
    ParticipantLeft, Pli, Timestamped, Welcome, MEDIA_HEADER_SIZE,
};

const KEY: [u8; KEY_SIZE] = [0x5a; KEY_SIZE];
const ROOM: &str = "room-1";
const WAIT: Duration = Duration::from_secs(2);

struct FakeServer {
    socket: UdpSocket,
}

impl FakeServer {
    async fn new() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    async fn recv(&self) -> (Vec<u8>, SocketAddr) {
        let mut buf = vec![0u8; 2048];
        let (len, from) = tokio::time::timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for client packet")
            .unwrap();
        buf.truncate(len);
        (buf, from)
    }

    /// Next packet of the given type, skipping everything else
    async fn recv_type(&self, packet_type: PacketType) -> (Vec<u8>, SocketAddr) {
        loop {
            let (data, from) = self.recv().await;
            if data.first() == Some(&(packet_type as u8)) {
                return (data, from);
            }
        }
    }

    async fn send(&self, data: &[u8], to: SocketAddr) {
        self.socket.send_to(data, to).await.unwrap();
    }

    /// Answer the next HELLO with a WELCOME; returns the client address
    async fn accept(&self, participants: Vec<ParticipantInfo>) -> SocketAddr {
        let (hello, client) = self.recv_type(PacketType::Hello).await;
        let hello = Hello::from_bytes(&hello).unwrap();
        assert_eq!(hello.room_id, ROOM);
        let welcome = Welcome {
            session_id: "session-1".into(),
            ssrc: 1000,
            video_ssrc: if hello.video { 1001 } else { 0 },
            screen_ssrc: if hello.video { 1002 } else { 0 },
            participants,
        };
        self.send(&welcome.to_bytes().unwrap(), client).await;
        client
    }
}

fn params(port: u16) -> SessionParams {
    SessionParams {
        host: "127.0.0.1".into(),
        port,
        server_id: None,
        token: "voice-token".into(),
        room_id: ROOM.into(),
        user_id: "me".into(),
        audio_codec: Codec::Opus,
        video_codec: Some(Codec::Vp8),
        key_id: 3,
        key: KEY.to_vec(),
        participants: Vec::new(),
    }
}

fn config() -> SessionConfig {
    SessionConfig {
        bind_addr: "127.0.0.1:0".into(),
        connect_timeout_ms: 500,
        ..Default::default()
    }
}

fn alice() -> ParticipantInfo {
    let mut alice = ParticipantInfo::new("alice");
    alice.ssrc = 2000;
    alice.video_ssrc = 2001;
    alice
}

/// Media packet sealed the way a remote sender with the shared key would
fn sealed_media(
    kind: MediaKind,
    ssrc: u32,
    sequence: u16,
    counter: u64,
    payload: &[u8],
) -> Vec<u8> {
    let mut ring = KeyRing::new(ROOM);
    ring.set_key(3, &KEY).unwrap();
    let header = MediaHeader {
        kind,
        flags: 0,
        key_id: 3,
        codec: Codec::Opus.id(),
        sequence,
        timestamp: 960,
        ssrc,
        counter,
    };
    let aad = header.to_bytes();
    let mut packet = aad.to_vec();
    packet.extend(ring.seal(&aad, payload, 3, ssrc, counter).unwrap());
    packet
}

async fn next_event<F>(events: &mut UnboundedReceiver<SessionEvent>, matches: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn connected_session(
    server: &FakeServer,
    config: SessionConfig,
) -> (TransportSession, UnboundedReceiver<SessionEvent>, SocketAddr) {
    let (session, mut events) = TransportSession::new(config, params(server.port())).unwrap();
    let (info, client) = tokio::join!(session.connect(), server.accept(vec![alice()]));
    info.unwrap();
    next_event(&mut events, |e| matches!(e, SessionEvent::Connected(_))).await;
    (session, events, client)
}

/// Test: Handshake
/// Given a server that answers HELLO
/// When the client connects
/// Then it adopts the assigned SSRCs and the roster
#[tokio::test]
async fn test_handshake() {
    let server = FakeServer::new().await;
    let (session, _events, client) = connected_session(&server, config()).await;

    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.session_id().as_deref(), Some("session-1"));
    let ssrcs = session.local_ssrcs();
    assert_eq!((ssrcs.audio, ssrcs.video, ssrcs.screen), (1000, 1001, 1002));
    assert_eq!(session.participants(), vec![alice()]);
    assert_eq!(session.local_addr(), Some(client));
}

/// Test: Concurrent connect calls share one handshake
#[tokio::test]
async fn test_concurrent_connect_single_hello() {
    let server = FakeServer::new().await;
    let (session, _events) = TransportSession::new(config(), params(server.port())).unwrap();

    let (a, b, _) = tokio::join!(
        session.connect(),
        session.connect(),
        server.accept(Vec::new())
    );
    assert_eq!(a.unwrap(), b.unwrap());

    // no second HELLO follows
    let mut buf = [0u8; 2048];
    let extra =
        tokio::time::timeout(Duration::from_millis(200), server.socket.recv_from(&mut buf)).await;
    assert!(extra.is_err(), "unexpected extra packet");
}

/// Test: Handshake timeout
/// Given a server that never answers
/// When the client connects
/// Then connect fails with a timeout and can be retried
#[tokio::test]
async fn test_connect_timeout_then_retry() {
    let server = FakeServer::new().await;
    let (session, mut events) = TransportSession::new(config(), params(server.port())).unwrap();

    let result = session.connect().await;
    assert!(matches!(result, Err(NetworkError::ConnectionTimeout)));
    assert_eq!(session.state(), SessionState::Idle);
    server.recv_type(PacketType::Hello).await;

    let (info, _) = tokio::join!(session.connect(), server.accept(Vec::new()));
    assert_eq!(info.unwrap().session_id, "session-1");
    next_event(&mut events, |e| matches!(e, SessionEvent::Connected(_))).await;
}

/// Test: Socket error during the handshake
/// Given a server port with nothing listening
/// When the client connects
/// Then connect fails with the socket error well before the timeout
/// And the socket is released
#[tokio::test]
async fn test_connect_socket_error_fails_fast() {
    let port = {
        let closed = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        closed.local_addr().unwrap().port()
    };
    let config = SessionConfig {
        connect_timeout_ms: 5_000,
        ..config()
    };
    let (session, _events) = TransportSession::new(config, params(port)).unwrap();

    let started = Instant::now();
    let result = session.connect().await;
    assert!(matches!(result, Err(NetworkError::Io(_))), "{:?}", result);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.local_addr().is_none());
}

/// Test: Socket error after the handshake
/// Given a connected session whose server went away
/// When the client keeps sending
/// Then the failure is reported as an event and the session stays up
#[tokio::test]
async fn test_socket_error_after_connect_keeps_session() {
    let server = FakeServer::new().await;
    let (session, mut events, client) = connected_session(&server, config()).await;
    drop(server);

    let error = tokio::time::timeout(WAIT, async {
        loop {
            // the refusal is reported to whichever socket call comes next
            let _ = session.send_audio(b"frame").await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            while let Ok(event) = events.try_recv() {
                if let SessionEvent::Error(e) = event {
                    return e;
                }
            }
        }
    })
    .await
    .expect("no transport error event");

    assert!(matches!(error, NetworkError::Io(_)), "{:?}", error);
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.local_addr(), Some(client));
}

/// Test: Inbound audio is decrypted, attributed and deduplicated
#[tokio::test]
async fn test_receive_audio_rejects_replay() {
    let server = FakeServer::new().await;
    let (_session, mut events, client) = connected_session(&server, config()).await;

    let first = sealed_media(MediaKind::Audio, 2000, 10, 500, b"frame-1");
    server.send(&first, client).await;
    server.send(&first, client).await;
    let second = sealed_media(MediaKind::Audio, 2000, 11, 501, b"frame-2");
    server.send(&second, client).await;

    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Audio(_))).await;
    let SessionEvent::Audio(frame) = event else {
        unreachable!()
    };
    assert_eq!(frame.data, b"frame-1");
    assert_eq!(frame.user_id.as_deref(), Some("alice"));
    assert_eq!(frame.pts_ms, 20);

    // the replayed copy produced nothing; the next frame is the new one
    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Audio(_))).await;
    let SessionEvent::Audio(frame) = event else {
        unreachable!()
    };
    assert_eq!(frame.data, b"frame-2");
    assert_eq!(frame.sequence, 11);
}

/// Test: Tampered media surfaces a decrypt error
#[tokio::test]
async fn test_decrypt_error_event() {
    let server = FakeServer::new().await;
    let (session, mut events, client) = connected_session(&server, config()).await;

    let mut packet = sealed_media(MediaKind::Audio, 2000, 1, 1, b"payload");
    packet[MEDIA_HEADER_SIZE] ^= 0x01;
    server.send(&packet, client).await;

    let event = next_event(&mut events, |e| matches!(e, SessionEvent::DecryptError { .. })).await;
    assert!(matches!(
        event,
        SessionEvent::DecryptError {
            ssrc: 2000,
            key_id: 3,
            sequence: 1,
            failures: 1
        }
    ));
    assert_eq!(session.stats().decrypt_failures, 1);
    assert_eq!(session.state(), SessionState::Connected);
}

/// Test: A departing participant is removed from the roster
#[tokio::test]
async fn test_participant_left() {
    let server = FakeServer::new().await;
    let (session, mut events, client) = connected_session(&server, config()).await;

    let left = ParticipantLeft {
        user_id: Some("alice".into()),
        ..Default::default()
    };
    server.send(&left.to_bytes().unwrap(), client).await;

    let event = next_event(&mut events, |e| {
        matches!(e, SessionEvent::ParticipantLeft { .. })
    })
    .await;
    let SessionEvent::ParticipantLeft { user_id, ssrcs } = event else {
        unreachable!()
    };
    assert_eq!(user_id, "alice");
    assert_eq!(ssrcs, vec![2000, 2001]);
    assert!(session.participants().is_empty());
}

/// Test: NACK triggers a verbatim retransmission
#[tokio::test]
async fn test_nack_retransmits() {
    let server = FakeServer::new().await;
    let (session, _events, client) = connected_session(&server, config()).await;

    session.send_audio(b"voice").await.unwrap();
    let (original, _) = server.recv_type(PacketType::Audio).await;
    let header = MediaHeader::from_bytes(&original).unwrap();
    assert_eq!(header.ssrc, 1000);
    assert_eq!(header.key_id, 3);

    let nack = Nack {
        ssrc: 1000,
        sequences: vec![header.sequence],
    };
    server.send(&nack.to_bytes(), client).await;
    let (resent, _) = server.recv_type(PacketType::Audio).await;
    assert_eq!(resent, original);
}

/// Test: PLI for a local video stream reaches the application
#[tokio::test]
async fn test_pli_requested() {
    let server = FakeServer::new().await;
    let (_session, mut events, client) = connected_session(&server, config()).await;

    server.send(&Pli { ssrc: 1001 }.to_bytes(), client).await;
    let event = next_event(&mut events, |e| matches!(e, SessionEvent::PliRequested { .. })).await;
    assert!(matches!(event, SessionEvent::PliRequested { ssrc: 1001 }));
}

/// Test: Video frames are fragmented below the MTU
#[tokio::test]
async fn test_send_video_fragments() {
    let server = FakeServer::new().await;
    let (session, _events, _client) = connected_session(&server, config()).await;

    let frame: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    session
        .send_video(&frame, true, VideoSource::Camera)
        .await
        .unwrap();

    let mut ring = KeyRing::new(ROOM);
    ring.set_key(3, &KEY).unwrap();
    let mut reassembler = Reassembler::new(8, Duration::from_secs(1));
    let mut completed = None;
    for _ in 0..3 {
        let (packet, _) = server.recv_type(PacketType::Video).await;
        assert!(packet.len() <= 1200);
        let header = MediaHeader::from_bytes(&packet).unwrap();
        assert_eq!(header.ssrc, 1001);
        assert!(header.is_keyframe());
        let (aad, body) = packet.split_at(MEDIA_HEADER_SIZE);
        let payload = ring
            .open(aad, body, header.key_id, header.ssrc, header.counter)
            .expect("fragment decrypts");
        completed =
            reassembler.add_fragment(&payload, header.is_keyframe(), std::time::Instant::now());
    }
    let completed = completed.expect("frame completes");
    assert_eq!(completed.data, frame);
    assert!(completed.is_keyframe);
}

/// Test: PING/PONG measures round-trip time
#[tokio::test]
async fn test_rtt_from_pong() {
    let server = FakeServer::new().await;
    let config = SessionConfig {
        ping_interval_ms: 50,
        ..config()
    };
    let (session, mut events, client) = connected_session(&server, config).await;

    let (ping, _) = server.recv_type(PacketType::Ping).await;
    let ping = Timestamped::from_bytes(&ping).unwrap();
    server.send(&Timestamped::pong(ping.sent_ms).to_bytes(), client).await;

    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Rtt(_))).await;
    let SessionEvent::Rtt(rtt) = event else {
        unreachable!()
    };
    assert!(rtt >= 0.0);
    assert!(session.stats().rtt_ms.is_some());
}

/// Test: Disconnect
/// When the client disconnects twice
/// Then one BYE is sent and one Disconnected event is emitted
#[tokio::test]
async fn test_disconnect_sends_bye_once() {
    let server = FakeServer::new().await;
    let (session, mut events, _client) = connected_session(&server, config()).await;

    session.disconnect().await;
    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Closed);

    let (bye, _) = server.recv_type(PacketType::Bye).await;
    assert_eq!(callwire::protocol::Bye::from_bytes(&bye).unwrap().ssrc, 1000);

    next_event(&mut events, |e| matches!(e, SessionEvent::Disconnected)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::Disconnected));
    }

    // a closed session stays closed
    assert!(matches!(
        session.connect().await,
        Err(NetworkError::SessionClosed)
    ));
    assert!(matches!(
        session.send_audio(b"x").await,
        Err(NetworkError::SessionClosed)
    ));
}
