//! Session state machine
//!
//! All per-connection state and packet handling lives here, free of I/O. The
//! async shell in `session.rs` feeds it datagrams and timer ticks and sends
//! whatever packets it hands back. Handlers run to completion under the
//! session lock, one at a time.

use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::config::{SessionConfig, SessionParams};
use super::error::NetworkError;
use super::events::{AudioFrame, ConnectedInfo, LocalSsrcs, SessionEvent, VideoFrame};
use super::fragment::{Fragmenter, Reassembler};
use super::keyring::KeyRing;
use super::replay::ReplayFilters;
use super::retransmit::{NackTracker, PliTracker, RetransmitCache};
use super::stats::{SessionStats, StatsCollector};
use crate::protocol::{
    named_ssrcs, Bye, ControlMessage, CryptoParams, Hello, MediaHeader, MediaKind, MediaState,
    Nack, PacketType, ParticipantInfo, ParticipantLeft, Pli, ReceiverReport, Speaking,
    Subscribe, Timestamped, Welcome, AEAD_ALGORITHM, AUTH_TAG_SIZE, FLAG_KEYFRAME,
    MAX_PACKET_SIZE, MEDIA_HEADER_SIZE, PROTOCOL_VERSION,
};

/// Most sequences named in one outbound NACK
pub const MAX_NACK_SEQUENCES: usize = 64;

/// Connection lifecycle
///
/// ```text
/// Idle --> Connecting: connect()
/// Connecting --> Connected: WELCOME
/// Connecting --> Idle: timeout / socket error
/// Idle | Connecting | Connected --> Closed: disconnect()
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Which local video stream a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSource {
    Camera,
    Screen,
}

#[derive(Debug, Clone, Copy)]
enum StreamSlot {
    Audio,
    Camera,
    Screen,
}

impl StreamSlot {
    fn name(self) -> &'static str {
        match self {
            StreamSlot::Audio => "audio",
            StreamSlot::Camera => "camera",
            StreamSlot::Screen => "screen",
        }
    }

    fn kind(self) -> MediaKind {
        match self {
            StreamSlot::Audio => MediaKind::Audio,
            StreamSlot::Camera | StreamSlot::Screen => MediaKind::Video,
        }
    }
}

impl From<VideoSource> for StreamSlot {
    fn from(source: VideoSource) -> Self {
        match source {
            VideoSource::Camera => StreamSlot::Camera,
            VideoSource::Screen => StreamSlot::Screen,
        }
    }
}

/// Sequence/counter state of one outbound stream
///
/// The counter is the AEAD nonce input. It starts at the wall clock in
/// microseconds so it keeps increasing across sessions that reuse a key and
/// SSRC, and it never wraps: sealing refuses `u64::MAX`.
#[derive(Debug)]
struct LocalStream {
    ssrc: u32,
    sequence: u16,
    counter: u64,
    timestamp_base: u32,
    fragmenter: Fragmenter,
}

impl LocalStream {
    fn new(ssrc: u32) -> Self {
        let counter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self {
            ssrc,
            sequence: rand::random(),
            counter,
            timestamp_base: rand::random(),
            fragmenter: Fragmenter::new(),
        }
    }

    fn advance(&mut self) -> (u16, u64) {
        let sequence = self.sequence;
        let counter = self.counter;
        self.sequence = self.sequence.wrapping_add(1);
        self.counter = self.counter.saturating_add(1);
        (sequence, counter)
    }
}

pub(crate) type ConnectResult = Result<ConnectedInfo, NetworkError>;

/// Outstanding `connect()` callers for one attempt; resolved at most once
#[derive(Default)]
pub(crate) struct ConnectSlot {
    waiters: Vec<oneshot::Sender<ConnectResult>>,
}

impl ConnectSlot {
    fn subscribe(&mut self) -> oneshot::Receiver<ConnectResult> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }

    /// Deliver `result` to every waiter. Returns false if nobody was waiting.
    fn resolve(&mut self, result: ConnectResult) -> bool {
        if self.waiters.is_empty() {
            return false;
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
        true
    }
}

pub(crate) enum ConnectStart {
    /// Already connected; nothing to do
    Connected(ConnectedInfo),
    Closed,
    /// A handshake is in flight; wait for its outcome
    Pending(oneshot::Receiver<ConnectResult>),
    /// Caller must open the socket and send HELLO
    Start(oneshot::Receiver<ConnectResult>),
}

/// Result of feeding one datagram to the session
#[derive(Debug, Default)]
pub(crate) struct Dispatch {
    pub outbound: Vec<Vec<u8>>,
    /// The datagram completed the handshake
    pub connected: bool,
}

pub(crate) struct Shutdown {
    /// The session was connecting or connected
    pub was_live: bool,
    pub bye: Option<Vec<u8>>,
}

pub(crate) struct SessionCore {
    config: SessionConfig,
    params: SessionParams,
    state: SessionState,
    epoch: Instant,
    events: mpsc::UnboundedSender<SessionEvent>,
    connect: ConnectSlot,

    session_id: Option<String>,
    ssrcs: LocalSsrcs,
    audio: Option<LocalStream>,
    camera: Option<LocalStream>,
    screen: Option<LocalStream>,
    active_key_id: u8,
    subscriptions: Vec<u32>,

    participants: HashMap<String, ParticipantInfo>,
    ssrc_users: HashMap<u32, String>,

    keyring: KeyRing,
    replay: ReplayFilters,
    reassemblers: HashMap<u32, Reassembler>,
    retransmit: RetransmitCache,
    nacks: NackTracker,
    plis: PliTracker,
    stats: StatsCollector,
}

impl SessionCore {
    pub(crate) fn new(
        config: SessionConfig,
        mut params: SessionParams,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, NetworkError> {
        let config = config.validated();

        let mut keyring = KeyRing::new(params.room_id.clone());
        keyring.set_key(params.key_id, &params.key)?;
        params.key.clear();

        let initial = std::mem::take(&mut params.participants);
        let mut core = Self {
            replay: ReplayFilters::new(config.max_remote_streams),
            retransmit: RetransmitCache::new(
                config.retransmit_max_age(),
                config.retransmit_capacity,
            ),
            nacks: NackTracker::new(config.nack_interval()),
            plis: PliTracker::new(config.pli_interval()),
            stats: StatsCollector::new(config.max_remote_streams),
            active_key_id: params.key_id,
            config,
            params,
            state: SessionState::Idle,
            epoch: Instant::now(),
            events,
            connect: ConnectSlot::default(),
            session_id: None,
            ssrcs: LocalSsrcs::default(),
            audio: None,
            camera: None,
            screen: None,
            subscriptions: Vec::new(),
            participants: HashMap::new(),
            ssrc_users: HashMap::new(),
            keyring,
            reassemblers: HashMap::new(),
        };
        for participant in initial {
            core.index_participant(participant);
        }
        Ok(core)
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn params(&self) -> &SessionParams {
        &self.params
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    pub(crate) fn local_ssrcs(&self) -> LocalSsrcs {
        self.ssrcs
    }

    pub(crate) fn subscriptions(&self) -> &[u32] {
        &self.subscriptions
    }

    /// Roster snapshot, ordered by user id
    pub(crate) fn participants(&self) -> Vec<ParticipantInfo> {
        let mut participants: Vec<ParticipantInfo> = self.participants.values().cloned().collect();
        participants.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        participants
    }

    pub(crate) fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    // ----- lifecycle -----

    pub(crate) fn begin_connect(&mut self) -> ConnectStart {
        match self.state {
            SessionState::Connected => ConnectStart::Connected(self.connected_info()),
            SessionState::Closed => ConnectStart::Closed,
            SessionState::Connecting => ConnectStart::Pending(self.connect.subscribe()),
            SessionState::Idle => {
                self.state = SessionState::Connecting;
                info!(
                    "Connecting to {}:{} (room {})",
                    self.params.host, self.params.port, self.params.room_id
                );
                ConnectStart::Start(self.connect.subscribe())
            }
        }
    }

    pub(crate) fn hello_packet(&self) -> Result<Vec<u8>, NetworkError> {
        let hello = Hello {
            token: self.params.token.clone(),
            protocol_version: PROTOCOL_VERSION,
            codec: self.params.audio_codec,
            room_id: self.params.room_id.clone(),
            user_id: self.params.user_id.clone(),
            server_id: self.params.server_id.clone(),
            video: self.params.video_codec.is_some(),
            video_codec: self.params.video_codec,
            crypto: CryptoParams {
                aead: AEAD_ALGORITHM.to_string(),
                key_id: self.active_key_id,
            },
        };
        Ok(hello.to_bytes()?)
    }

    /// Fail an in-flight handshake. Returns true if one was pending.
    pub(crate) fn fail_connect(&mut self, error: NetworkError) -> bool {
        if self.state != SessionState::Connecting {
            return false;
        }
        warn!("Connect failed: {}", error);
        self.state = SessionState::Idle;
        self.connect.resolve(Err(error));
        true
    }

    /// Tear down all per-connection state. Safe in any state.
    pub(crate) fn shutdown(&mut self) -> Shutdown {
        let was_live = matches!(
            self.state,
            SessionState::Connecting | SessionState::Connected
        );
        let bye = (self.state == SessionState::Connected && self.ssrcs.audio != 0)
            .then(|| Bye {
                ssrc: self.ssrcs.audio,
            }
            .to_bytes());

        if self.state == SessionState::Connecting {
            self.connect.resolve(Err(NetworkError::Cancelled));
        }
        if was_live {
            info!(
                "Disconnecting session {} ({} participants)",
                self.session_id.as_deref().unwrap_or("-"),
                self.participants.len()
            );
        }

        self.state = SessionState::Closed;
        self.participants.clear();
        self.ssrc_users.clear();
        self.audio = None;
        self.camera = None;
        self.screen = None;
        self.replay.clear();
        self.reassemblers.clear();
        self.retransmit.clear();
        self.nacks.clear();
        self.plis.clear();
        self.stats.clear_streams();

        Shutdown { was_live, bye }
    }

    fn connected_info(&self) -> ConnectedInfo {
        ConnectedInfo {
            session_id: self.session_id.clone().unwrap_or_default(),
            ssrcs: self.ssrcs,
            participants: self.participants(),
        }
    }

    fn ensure_connected(&self) -> Result<(), NetworkError> {
        match self.state {
            SessionState::Connected => Ok(()),
            SessionState::Closed => Err(NetworkError::SessionClosed),
            _ => Err(NetworkError::NotConnected),
        }
    }

    fn clock_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    // ----- inbound -----

    pub(crate) fn handle_datagram(&mut self, data: &[u8], now: Instant) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let packet_type = match PacketType::of(data) {
            Ok(packet_type) => packet_type,
            Err(e) => {
                trace!("Dropping datagram: {}", e);
                return dispatch;
            }
        };

        match (self.state, packet_type) {
            (SessionState::Connecting, PacketType::Welcome) => {
                dispatch.connected = self.handle_welcome(data);
            }
            (SessionState::Connected, _) => {
                self.handle_connected(packet_type, data, now, &mut dispatch.outbound);
            }
            (state, packet_type) => trace!("Ignoring {:?} while {:?}", packet_type, state),
        }
        dispatch
    }

    fn handle_welcome(&mut self, data: &[u8]) -> bool {
        let welcome = match Welcome::from_bytes(data) {
            Ok(welcome) => welcome,
            Err(e) => {
                debug!("Dropping malformed WELCOME: {}", e);
                return false;
            }
        };

        self.session_id = Some(welcome.session_id);
        self.ssrcs = LocalSsrcs {
            audio: welcome.ssrc,
            video: welcome.video_ssrc,
            screen: welcome.screen_ssrc,
        };
        self.audio = (welcome.ssrc != 0).then(|| LocalStream::new(welcome.ssrc));
        self.camera = (welcome.video_ssrc != 0).then(|| LocalStream::new(welcome.video_ssrc));
        self.screen = (welcome.screen_ssrc != 0).then(|| LocalStream::new(welcome.screen_ssrc));

        self.participants.clear();
        self.ssrc_users.clear();
        for participant in welcome.participants {
            self.index_participant(participant);
        }

        self.state = SessionState::Connected;
        let info = self.connected_info();
        info!(
            "Connected: session {} (audio ssrc {}, video ssrc {}, screen ssrc {}), {} participants",
            info.session_id,
            info.ssrcs.audio,
            info.ssrcs.video,
            info.ssrcs.screen,
            info.participants.len()
        );
        self.connect.resolve(Ok(info.clone()));
        self.emit(SessionEvent::Connected(info));
        true
    }

    fn handle_connected(
        &mut self,
        packet_type: PacketType,
        data: &[u8],
        now: Instant,
        out: &mut Vec<Vec<u8>>,
    ) {
        let result = match packet_type {
            PacketType::Audio | PacketType::Video => {
                self.handle_media(data, now, out);
                Ok(())
            }
            PacketType::Ping => Timestamped::from_bytes(data)
                .map(|ping| out.push(Timestamped::pong(ping.sent_ms).to_bytes())),
            PacketType::Pong => {
                Timestamped::from_bytes(data).map(|pong| self.handle_pong(pong.sent_ms, now))
            }
            PacketType::Speaking => Speaking::from_bytes(data).map(|msg| self.handle_speaking(msg)),
            PacketType::MediaState => {
                MediaState::from_bytes(data).map(|msg| self.handle_media_state(msg))
            }
            PacketType::ParticipantLeft => {
                ParticipantLeft::from_bytes(data).map(|msg| self.handle_participant_left(msg))
            }
            PacketType::Nack => Nack::from_bytes(data).map(|nack| self.handle_nack(nack, now, out)),
            PacketType::Pli => Pli::from_bytes(data).map(|pli| self.handle_pli(pli)),
            PacketType::ReceiverReport => ReceiverReport::from_bytes(data)
                .map(|report| self.handle_receiver_report(report, now)),
            PacketType::Bye => Bye::from_bytes(data).map(|bye| self.handle_bye(bye)),
            PacketType::Welcome | PacketType::Hello | PacketType::Subscribe => {
                trace!("Ignoring {:?} after handshake", packet_type);
                Ok(())
            }
        };

        if let Err(e) = result {
            trace!("Dropping malformed {:?}: {}", packet_type, e);
        }
    }

    fn handle_media(&mut self, data: &[u8], now: Instant, out: &mut Vec<Vec<u8>>) {
        if data.len() < MEDIA_HEADER_SIZE + AUTH_TAG_SIZE {
            trace!("Dropping undersized media packet ({} bytes)", data.len());
            return;
        }
        let header = match MediaHeader::from_bytes(data) {
            Ok(header) => header,
            Err(e) => {
                trace!("Dropping media packet: {}", e);
                return;
            }
        };
        if self.ssrcs.contains(header.ssrc) {
            trace!("Dropping looped-back packet of own ssrc {}", header.ssrc);
            return;
        }
        if !self.replay.check(header.key_id, header.ssrc, header.counter) {
            trace!(
                "Dropping replayed counter {} on ssrc {}",
                header.counter,
                header.ssrc
            );
            return;
        }

        let (aad, ciphertext) = data.split_at(MEDIA_HEADER_SIZE);
        let Some(plaintext) =
            self.keyring
                .open(aad, ciphertext, header.key_id, header.ssrc, header.counter)
        else {
            let failures = self.stats.record_decrypt_failure();
            debug!(
                "Decrypt failed for ssrc {} key {} seq {} ({} total)",
                header.ssrc, header.key_id, header.sequence, failures
            );
            self.emit(SessionEvent::DecryptError {
                ssrc: header.ssrc,
                key_id: header.key_id,
                sequence: header.sequence,
                failures,
            });
            return;
        };
        let roster = &self.ssrc_users;
        self.replay.accept_keeping(
            header.key_id,
            header.ssrc,
            header.counter,
            now,
            |ssrc| roster.contains_key(&ssrc),
        );

        let user_id = self.resolve_user(header.ssrc);
        self.stats.record_received(
            header.ssrc,
            header.kind,
            header.sequence,
            header.timestamp,
            data.len(),
            now,
        );
        let pts_ms = header.timestamp as u64 * 1000 / header.kind.clock_rate() as u64;

        match header.kind {
            MediaKind::Audio => self.emit(SessionEvent::Audio(AudioFrame {
                ssrc: header.ssrc,
                user_id,
                sequence: header.sequence,
                timestamp: header.timestamp,
                pts_ms,
                data: plaintext,
            })),
            MediaKind::Video => {
                let reassembler = self.reassembler(header.ssrc);
                let dropped_before = reassembler.frames_dropped();
                let completed = reassembler.add_fragment(&plaintext, header.is_keyframe(), now);
                let lost_frame = reassembler.frames_dropped() > dropped_before;

                if let Some(frame) = completed {
                    self.emit(SessionEvent::Video(VideoFrame {
                        ssrc: header.ssrc,
                        user_id,
                        frame_id: frame.frame_id,
                        sequence: header.sequence,
                        timestamp: header.timestamp,
                        pts_ms,
                        is_keyframe: frame.is_keyframe,
                        data: frame.data,
                    }));
                }
                if lost_frame {
                    out.extend(self.pli_for(header.ssrc, now));
                }
                out.extend(self.nack_for(header.ssrc, now));
            }
        }
    }

    fn handle_pong(&mut self, sent_ms: u64, now: Instant) {
        let now_ms = self.clock_ms(now);
        if sent_ms > now_ms {
            trace!("Ignoring PONG with future timestamp {}", sent_ms);
            return;
        }
        let rtt = (now_ms - sent_ms) as f64;
        self.stats.set_rtt(rtt);
        trace!("RTT {:.0}ms", rtt);
        self.emit(SessionEvent::Rtt(rtt));
    }

    fn handle_speaking(&mut self, msg: Speaking) {
        let Some((user_id, existed)) =
            self.upsert_participant(msg.user_id, msg.ssrc, msg.video_ssrc, msg.screen_ssrc)
        else {
            trace!("Ignoring SPEAKING for unknown or local user");
            return;
        };
        let Some(participant) = self.participants.get_mut(&user_id) else {
            return;
        };
        participant.speaking = msg.speaking;
        let snapshot = participant.clone();

        self.emit(SessionEvent::Speaking {
            user_id,
            ssrc: Some(snapshot.ssrc).filter(|s| *s != 0),
            speaking: msg.speaking,
        });
        self.emit_roster_change(snapshot, existed);
    }

    fn handle_media_state(&mut self, msg: MediaState) {
        let Some((user_id, existed)) =
            self.upsert_participant(msg.user_id, msg.ssrc, msg.video_ssrc, msg.screen_ssrc)
        else {
            trace!("Ignoring MEDIA_STATE for unknown or local user");
            return;
        };
        let Some(participant) = self.participants.get_mut(&user_id) else {
            return;
        };
        if let Some(muted) = msg.muted {
            participant.muted = muted;
        }
        if let Some(video_enabled) = msg.video_enabled {
            participant.video_enabled = video_enabled;
        }
        if let Some(screen_sharing) = msg.screen_sharing {
            participant.screen_sharing = screen_sharing;
        }
        let snapshot = participant.clone();

        self.emit(SessionEvent::MediaState {
            user_id,
            muted: snapshot.muted,
            video_enabled: snapshot.video_enabled,
            screen_sharing: snapshot.screen_sharing,
        });
        self.emit_roster_change(snapshot, existed);
    }

    fn handle_participant_left(&mut self, msg: ParticipantLeft) {
        let named = named_ssrcs(msg.ssrc, msg.video_ssrc, msg.screen_ssrc);
        let Some(user_id) = msg
            .user_id
            .or_else(|| named.iter().find_map(|s| self.ssrc_users.get(s).cloned()))
        else {
            trace!("Ignoring PARTICIPANT_LEFT for unknown streams {:?}", named);
            return;
        };
        if user_id == self.params.user_id {
            trace!("Ignoring PARTICIPANT_LEFT naming ourselves");
            return;
        }

        let mut ssrcs = named;
        let removed = self.participants.remove(&user_id);
        if let Some(participant) = &removed {
            ssrcs.extend(participant.ssrcs());
        }
        ssrcs.extend(
            self.ssrc_users
                .iter()
                .filter(|(_, owner)| **owner == user_id)
                .map(|(ssrc, _)| *ssrc),
        );
        ssrcs.retain(|ssrc| !self.ssrcs.contains(*ssrc));
        ssrcs.sort_unstable();
        ssrcs.dedup();

        if removed.is_none() && ssrcs.is_empty() {
            trace!("PARTICIPANT_LEFT for {} changed nothing", user_id);
            return;
        }

        for ssrc in &ssrcs {
            self.purge_stream(*ssrc);
        }
        info!("Participant {} left (ssrcs {:?})", user_id, ssrcs);
        self.emit(SessionEvent::ParticipantLeft { user_id, ssrcs });
    }

    fn handle_nack(&mut self, nack: Nack, now: Instant, out: &mut Vec<Vec<u8>>) {
        if !self.ssrcs.contains(nack.ssrc) {
            trace!("Ignoring NACK for foreign ssrc {}", nack.ssrc);
            return;
        }
        let mut resent = 0;
        for sequence in &nack.sequences {
            if let Some(packet) = self.retransmit.get(nack.ssrc, *sequence, now) {
                self.stats.record_sent(packet.len());
                out.push(packet.to_vec());
                resent += 1;
            }
        }
        debug!(
            "NACK for ssrc {}: resending {}/{} packets",
            nack.ssrc,
            resent,
            nack.sequences.len()
        );
    }

    fn handle_pli(&mut self, pli: Pli) {
        if !self.ssrcs.contains(pli.ssrc) {
            trace!("Ignoring PLI for foreign ssrc {}", pli.ssrc);
            return;
        }
        debug!("Keyframe requested for ssrc {}", pli.ssrc);
        self.emit(SessionEvent::PliRequested { ssrc: pli.ssrc });
    }

    fn handle_receiver_report(&mut self, report: ReceiverReport, now: Instant) {
        if !self.ssrcs.contains(report.ssrc) {
            return;
        }
        trace!(
            "Receiver report for ssrc {}: fraction lost {}/255, jitter {}",
            report.ssrc,
            report.fraction_lost,
            report.jitter
        );
        self.stats.record_remote_report(report, now);
    }

    fn handle_bye(&mut self, bye: Bye) {
        if self.ssrcs.contains(bye.ssrc) {
            return;
        }
        debug!("BYE for ssrc {}", bye.ssrc);
        self.purge_stream(bye.ssrc);
    }

    // ----- timers -----

    pub(crate) fn ping_packet(&self, now: Instant) -> Option<Vec<u8>> {
        (self.state == SessionState::Connected)
            .then(|| Timestamped::ping(self.clock_ms(now)).to_bytes())
    }

    /// One receiver report per remote stream, plus NACKs for overdue gaps.
    ///
    /// Reports always name the local audio SSRC as reporter, even for video
    /// streams and even when no audio SSRC was assigned (reporter 0).
    pub(crate) fn report_tick(&mut self, now: Instant) -> Vec<Vec<u8>> {
        if self.state != SessionState::Connected {
            return Vec::new();
        }
        let mut out: Vec<Vec<u8>> = self
            .stats
            .receiver_reports(self.ssrcs.audio)
            .iter()
            .map(ReceiverReport::to_bytes)
            .collect();
        for ssrc in self.stats.stream_ssrcs(MediaKind::Video) {
            out.extend(self.nack_for(ssrc, now));
        }
        out
    }

    /// Age out caches; request keyframes for frames that never completed
    pub(crate) fn cleanup_tick(&mut self, now: Instant) -> Vec<Vec<u8>> {
        if self.state != SessionState::Connected {
            return Vec::new();
        }
        let lost: Vec<u32> = self
            .reassemblers
            .iter_mut()
            .filter_map(|(ssrc, reassembler)| (reassembler.cleanup(now) > 0).then_some(*ssrc))
            .collect();

        let mut out = Vec::new();
        for ssrc in lost {
            debug!("Incomplete frame expired on ssrc {}", ssrc);
            out.extend(self.pli_for(ssrc, now));
        }

        self.retransmit.cleanup(now);
        self.stats
            .expire_missing(now, self.config.missing_max_age());
        self.nacks.cleanup(now);
        self.plis.cleanup(now);
        out
    }

    fn nack_for(&mut self, ssrc: u32, now: Instant) -> Option<Vec<u8>> {
        let mut missing = self
            .stats
            .missing_sequences(ssrc, now, self.config.missing_grace());
        if missing.is_empty() || !self.nacks.should_send_nack(ssrc, now) {
            return None;
        }
        if missing.len() > MAX_NACK_SEQUENCES {
            missing.drain(..missing.len() - MAX_NACK_SEQUENCES);
        }
        trace!("NACK ssrc {} for {} sequences", ssrc, missing.len());
        Some(
            Nack {
                ssrc,
                sequences: missing,
            }
            .to_bytes(),
        )
    }

    fn pli_for(&mut self, ssrc: u32, now: Instant) -> Option<Vec<u8>> {
        self.plis
            .should_send_pli(ssrc, now)
            .then(|| Pli { ssrc }.to_bytes())
    }

    // ----- outbound -----

    pub(crate) fn send_audio(
        &mut self,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<Vec<u8>>, NetworkError> {
        self.ensure_connected()?;
        let timestamp = self.media_timestamp(StreamSlot::Audio, now)?;
        Ok(self
            .build_media(StreamSlot::Audio, data, false, timestamp, now)?
            .into_iter()
            .collect())
    }

    pub(crate) fn send_video(
        &mut self,
        data: &[u8],
        is_keyframe: bool,
        source: VideoSource,
        now: Instant,
    ) -> Result<Vec<Vec<u8>>, NetworkError> {
        self.ensure_connected()?;
        let slot = StreamSlot::from(source);
        let timestamp = self.media_timestamp(slot, now)?;
        let fragments = self
            .stream_mut(slot)?
            .fragmenter
            .fragment(data)?;

        let mut packets = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            packets.extend(self.build_media(slot, &fragment, is_keyframe, timestamp, now)?);
        }
        Ok(packets)
    }

    pub(crate) fn speaking_packet(&self, speaking: bool) -> Result<Vec<u8>, NetworkError> {
        self.ensure_connected()?;
        let msg = Speaking {
            user_id: Some(self.params.user_id.clone()),
            ssrc: Some(self.ssrcs.audio).filter(|s| *s != 0),
            video_ssrc: None,
            screen_ssrc: None,
            speaking,
        };
        Ok(msg.to_bytes()?)
    }

    pub(crate) fn media_state_packet(
        &self,
        muted: bool,
        video_enabled: bool,
        screen_sharing: bool,
    ) -> Result<Vec<u8>, NetworkError> {
        self.ensure_connected()?;
        let msg = MediaState {
            user_id: Some(self.params.user_id.clone()),
            ssrc: Some(self.ssrcs.audio).filter(|s| *s != 0),
            video_ssrc: Some(self.ssrcs.video).filter(|s| *s != 0),
            screen_ssrc: Some(self.ssrcs.screen).filter(|s| *s != 0),
            muted: Some(muted),
            video_enabled: Some(video_enabled),
            screen_sharing: Some(screen_sharing),
        };
        Ok(msg.to_bytes()?)
    }

    pub(crate) fn subscribe_packet(&mut self, ssrcs: Vec<u32>) -> Result<Vec<u8>, NetworkError> {
        self.ensure_connected()?;
        self.subscriptions = ssrcs.clone();
        Ok(Subscribe {
            subscriptions: ssrcs,
        }
        .to_bytes()?)
    }

    /// PLI for a remote stream, unless one went out too recently
    pub(crate) fn keyframe_request(
        &mut self,
        ssrc: u32,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, NetworkError> {
        self.ensure_connected()?;
        Ok(self.pli_for(ssrc, now))
    }

    /// Install key material and seal with it from now on
    pub(crate) fn set_key(&mut self, key_id: u8, material: &[u8]) -> Result<(), NetworkError> {
        self.keyring.set_key(key_id, material)?;
        self.active_key_id = key_id;
        info!("Sealing with key id {}", key_id);
        Ok(())
    }

    fn stream_mut(&mut self, slot: StreamSlot) -> Result<&mut LocalStream, NetworkError> {
        let stream = match slot {
            StreamSlot::Audio => self.audio.as_mut(),
            StreamSlot::Camera => self.camera.as_mut(),
            StreamSlot::Screen => self.screen.as_mut(),
        };
        stream.ok_or(NetworkError::NoStream(slot.name()))
    }

    fn media_timestamp(&mut self, slot: StreamSlot, now: Instant) -> Result<u32, NetworkError> {
        let elapsed = now.saturating_duration_since(self.epoch);
        let ticks = (elapsed.as_micros() * slot.kind().clock_rate() as u128 / 1_000_000) as u32;
        Ok(self.stream_mut(slot)?.timestamp_base.wrapping_add(ticks))
    }

    /// Seal one media packet and remember it for retransmission.
    ///
    /// Returns `None` if the finished packet exceeds the datagram bound.
    fn build_media(
        &mut self,
        slot: StreamSlot,
        payload: &[u8],
        is_keyframe: bool,
        timestamp: u32,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, NetworkError> {
        let kind = slot.kind();
        let key_id = self.active_key_id;
        let codec = match kind {
            MediaKind::Audio => self.params.audio_codec.id(),
            MediaKind::Video => self.params.video_codec.map_or(0, |c| c.id()),
        };
        let stream = self.stream_mut(slot)?;
        let ssrc = stream.ssrc;
        let (sequence, counter) = stream.advance();

        let header = MediaHeader {
            kind,
            flags: if is_keyframe { FLAG_KEYFRAME } else { 0 },
            key_id,
            codec,
            sequence,
            timestamp,
            ssrc,
            counter,
        };
        let aad = header.to_bytes();
        let sealed = self.keyring.seal(&aad, payload, key_id, ssrc, counter)?;

        let mut packet = Vec::with_capacity(MEDIA_HEADER_SIZE + sealed.len());
        packet.extend_from_slice(&aad);
        packet.extend_from_slice(&sealed);

        if packet.len() > MAX_PACKET_SIZE {
            warn!(
                "Dropping oversized {} packet ({} bytes) on ssrc {}",
                slot.name(),
                packet.len(),
                ssrc
            );
            return Ok(None);
        }

        self.retransmit.insert(ssrc, sequence, packet.clone(), now);
        self.stats.record_sent(packet.len());
        Ok(Some(packet))
    }

    // ----- roster -----

    fn index_participant(&mut self, participant: ParticipantInfo) {
        for ssrc in participant.ssrcs() {
            self.ssrc_users.insert(ssrc, participant.user_id.clone());
        }
        self.participants
            .insert(participant.user_id.clone(), participant);
    }

    fn resolve_user(&mut self, ssrc: u32) -> Option<String> {
        if let Some(user_id) = self.ssrc_users.get(&ssrc) {
            return Some(user_id.clone());
        }
        let user_id = self
            .participants
            .values()
            .find(|p| p.ssrcs().any(|s| s == ssrc))
            .map(|p| p.user_id.clone())?;
        self.ssrc_users.insert(ssrc, user_id.clone());
        Some(user_id)
    }

    /// Find or create the participant a control message refers to and record
    /// its SSRCs. Returns the user id and whether it was already known.
    fn upsert_participant(
        &mut self,
        user_id: Option<String>,
        ssrc: Option<u32>,
        video_ssrc: Option<u32>,
        screen_ssrc: Option<u32>,
    ) -> Option<(String, bool)> {
        let named = named_ssrcs(ssrc, video_ssrc, screen_ssrc);
        let user_id =
            user_id.or_else(|| named.iter().find_map(|s| self.ssrc_users.get(s).cloned()))?;
        if user_id == self.params.user_id {
            return None;
        }

        let existed = self.participants.contains_key(&user_id);
        let participant = self
            .participants
            .entry(user_id.clone())
            .or_insert_with(|| ParticipantInfo::new(user_id.clone()));
        if let Some(s) = ssrc.filter(|s| *s != 0) {
            participant.ssrc = s;
        }
        if let Some(s) = video_ssrc.filter(|s| *s != 0) {
            participant.video_ssrc = s;
        }
        if let Some(s) = screen_ssrc.filter(|s| *s != 0) {
            participant.screen_ssrc = s;
        }
        for s in participant.ssrcs() {
            self.ssrc_users.insert(s, user_id.clone());
        }
        Some((user_id, existed))
    }

    fn emit_roster_change(&self, participant: ParticipantInfo, existed: bool) {
        if existed {
            self.emit(SessionEvent::ParticipantUpdated(participant));
        } else {
            debug!("Participant {} joined", participant.user_id);
            self.emit(SessionEvent::ParticipantJoined(participant));
        }
    }

    fn reassembler(&mut self, ssrc: u32) -> &mut Reassembler {
        if !self.reassemblers.contains_key(&ssrc)
            && self.reassemblers.len() >= self.config.max_remote_streams
        {
            if let Some(victim) = self
                .reassemblers
                .iter()
                .min_by_key(|(_, r)| r.pending_frames())
                .map(|(s, _)| *s)
            {
                self.reassemblers.remove(&victim);
            }
        }
        let capacity = self.config.reassembly_capacity;
        let max_age = self.config.reassembly_max_age();
        self.reassemblers
            .entry(ssrc)
            .or_insert_with(|| Reassembler::new(capacity, max_age))
    }

    /// Forget everything known about one remote stream
    fn purge_stream(&mut self, ssrc: u32) {
        self.replay.remove_ssrc(ssrc);
        self.reassemblers.remove(&ssrc);
        self.stats.remove_stream(ssrc);
        self.retransmit.remove_ssrc(ssrc);
        self.nacks.remove_ssrc(ssrc);
        self.plis.remove_ssrc(ssrc);
        self.keyring.forget_ssrc(ssrc);
        self.ssrc_users.remove(&ssrc);
    }
}
