//! Transport session
//!
//! [`TransportSession`] owns the UDP socket and the background tasks (receive
//! loop, handshake timeout, ping/report/cleanup timers) around a
//! [`SessionCore`]. Tasks hold only a weak reference, so dropping the session
//! stops them.
//!
//! Lock order is `io` before `core`; neither lock is held across an await.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::{SessionConfig, SessionParams};
use super::error::NetworkError;
use super::events::{ConnectedInfo, LocalSsrcs, SessionEvent};
use super::state::{ConnectResult, ConnectStart, SessionCore, SessionState, VideoSource};
use super::stats::SessionStats;
use super::transport::UdpTransport;
use crate::protocol::ParticipantInfo;

/// Pause after a failed receive before polling the socket again
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Socket and tasks of one connection attempt
struct SessionIo {
    transport: Arc<UdpTransport>,
    recv_task: JoinHandle<()>,
    timeout_task: Option<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
}

impl SessionIo {
    fn abort_all(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.recv_task.abort();
    }
}

struct Shared {
    config: SessionConfig,
    io: Mutex<Option<SessionIo>>,
    core: Mutex<SessionCore>,
}

impl Shared {
    fn transport(&self) -> Option<Arc<UdpTransport>> {
        self.io.lock().as_ref().map(|io| io.transport.clone())
    }

    /// Abort an in-flight handshake and release its socket
    fn fail_connect(&self, error: NetworkError) -> bool {
        let taken = {
            let mut io = self.io.lock();
            if !self.core.lock().fail_connect(error) {
                return false;
            }
            io.take()
        };
        if let Some(mut io) = taken {
            io.abort_all();
        }
        true
    }

    /// Start the periodic tasks once the handshake completed
    fn start_timers(self: &Arc<Self>) {
        let mut guard = self.io.lock();
        let Some(io) = guard.as_mut() else {
            return;
        };
        if let Some(task) = io.timeout_task.take() {
            task.abort();
        }

        let weak = Arc::downgrade(self);
        io.timers.push(spawn_timer(
            weak.clone(),
            io.transport.clone(),
            self.config.ping_interval(),
            |core, now| core.ping_packet(now).into_iter().collect(),
        ));
        io.timers.push(spawn_timer(
            weak.clone(),
            io.transport.clone(),
            self.config.receiver_report_interval(),
            SessionCore::report_tick,
        ));
        io.timers.push(spawn_timer(
            weak,
            io.transport.clone(),
            self.config.cleanup_interval(),
            SessionCore::cleanup_tick,
        ));
        debug!("Session timers started");
    }

    async fn send_all(&self, transport: &UdpTransport, packets: Vec<Vec<u8>>) {
        for packet in packets {
            if let Err(e) = transport.send(&packet).await {
                warn!("Send failed: {}", e);
                self.core.lock().emit(SessionEvent::Error(e));
            }
        }
    }
}

fn spawn_timer<F>(
    weak: Weak<Shared>,
    transport: Arc<UdpTransport>,
    period: Duration,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(&mut SessionCore, Instant) -> Vec<Vec<u8>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(shared) = weak.upgrade() else {
                break;
            };
            let packets = tick(&mut *shared.core.lock(), Instant::now());
            shared.send_all(&transport, packets).await;
        }
    })
}

async fn recv_loop(weak: Weak<Shared>, transport: Arc<UdpTransport>) {
    loop {
        let result = transport.recv().await;
        let Some(shared) = weak.upgrade() else {
            break;
        };
        match result {
            Ok(data) => {
                let dispatch = shared.core.lock().handle_datagram(&data, Instant::now());
                if dispatch.connected {
                    shared.start_timers();
                }
                shared.send_all(&transport, dispatch.outbound).await;
            }
            Err(e) => {
                if shared.fail_connect(e.clone()) {
                    break;
                }
                warn!("Receive failed: {}", e);
                shared.core.lock().emit(SessionEvent::Error(e));
                drop(shared);
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Encrypted media session with one voice server
///
/// Created from [`SessionParams`] handed over by signaling. Events are
/// delivered on the receiver returned by [`TransportSession::new`].
pub struct TransportSession {
    shared: Arc<Shared>,
}

impl TransportSession {
    /// Build an idle session. Fails if the key material is unusable.
    pub fn new(
        config: SessionConfig,
        params: SessionParams,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), NetworkError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let core = SessionCore::new(config, params, events_tx)?;
        let shared = Arc::new(Shared {
            config: core.config().clone(),
            io: Mutex::new(None),
            core: Mutex::new(core),
        });
        Ok((Self { shared }, events_rx))
    }

    /// Perform the HELLO/WELCOME handshake.
    ///
    /// Concurrent callers share one attempt and its outcome. Returns
    /// immediately when already connected.
    pub async fn connect(&self) -> Result<ConnectedInfo, NetworkError> {
        let start = self.shared.core.lock().begin_connect();
        let waiter = match start {
            ConnectStart::Connected(info) => return Ok(info),
            ConnectStart::Closed => return Err(NetworkError::SessionClosed),
            ConnectStart::Pending(waiter) => return wait_connect(waiter).await,
            ConnectStart::Start(waiter) => waiter,
        };

        if let Err(e) = self.open().await {
            self.shared.fail_connect(e);
        }
        wait_connect(waiter).await
    }

    async fn open(&self) -> Result<(), NetworkError> {
        let (host, port, hello) = {
            let core = self.shared.core.lock();
            (
                core.params().host.clone(),
                core.params().port,
                core.hello_packet()?,
            )
        };
        let bind_addr = &self.shared.config.bind_addr;
        let remote = UdpTransport::resolve(&host, port, bind_addr).await?;
        let transport = Arc::new(UdpTransport::connect(bind_addr, remote).await?);

        {
            let mut io = self.shared.io.lock();
            if self.shared.core.lock().state() != SessionState::Connecting {
                debug!("Connect abandoned before HELLO");
                return Ok(());
            }
            let weak = Arc::downgrade(&self.shared);
            let timeout = self.shared.config.connect_timeout();
            let timeout_weak = weak.clone();
            *io = Some(SessionIo {
                transport: transport.clone(),
                recv_task: tokio::spawn(recv_loop(weak, transport.clone())),
                timeout_task: Some(tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(shared) = timeout_weak.upgrade() {
                        shared.fail_connect(NetworkError::ConnectionTimeout);
                    }
                })),
                timers: Vec::new(),
            });
        }

        transport.send(&hello).await?;
        debug!("HELLO sent to {}", remote);
        Ok(())
    }

    /// Leave the session: stop timers, send a best-effort BYE, close the
    /// socket. Safe to call repeatedly; later calls do nothing.
    pub async fn disconnect(&self) {
        let (io, outcome) = {
            let mut io = self.shared.io.lock();
            let outcome = self.shared.core.lock().shutdown();
            (io.take(), outcome)
        };

        if let Some(mut io) = io {
            io.abort_all();
            if let Some(bye) = outcome.bye {
                match tokio::time::timeout(self.shared.config.bye_grace(), io.transport.send(&bye))
                    .await
                {
                    Ok(Ok(())) => debug!("BYE sent"),
                    Ok(Err(e)) => debug!("BYE not sent: {}", e),
                    Err(_) => debug!("BYE timed out"),
                }
            }
        }

        if outcome.was_live {
            info!("Disconnected");
            self.shared.core.lock().emit(SessionEvent::Disconnected);
        }
    }

    /// Encrypt and send one encoded audio frame
    pub async fn send_audio(&self, data: &[u8]) -> Result<(), NetworkError> {
        let packets = self.shared.core.lock().send_audio(data, Instant::now())?;
        self.transmit(packets).await
    }

    /// Fragment, encrypt and send one encoded video frame
    pub async fn send_video(
        &self,
        data: &[u8],
        is_keyframe: bool,
        source: VideoSource,
    ) -> Result<(), NetworkError> {
        let packets = self
            .shared
            .core
            .lock()
            .send_video(data, is_keyframe, source, Instant::now())?;
        self.transmit(packets).await
    }

    pub async fn set_speaking(&self, speaking: bool) -> Result<(), NetworkError> {
        let packet = self.shared.core.lock().speaking_packet(speaking)?;
        self.transmit(vec![packet]).await
    }

    pub async fn set_media_state(
        &self,
        muted: bool,
        video_enabled: bool,
        screen_sharing: bool,
    ) -> Result<(), NetworkError> {
        let packet = self
            .shared
            .core
            .lock()
            .media_state_packet(muted, video_enabled, screen_sharing)?;
        self.transmit(vec![packet]).await
    }

    /// Tell the server which remote SSRCs to forward
    pub async fn set_subscriptions(&self, ssrcs: Vec<u32>) -> Result<(), NetworkError> {
        let packet = self.shared.core.lock().subscribe_packet(ssrcs)?;
        self.transmit(vec![packet]).await
    }

    /// Ask the sender of `ssrc` for a keyframe.
    ///
    /// Returns false when a request for that stream went out too recently.
    pub async fn request_keyframe(&self, ssrc: u32) -> Result<bool, NetworkError> {
        let packet = self
            .shared
            .core
            .lock()
            .keyframe_request(ssrc, Instant::now())?;
        match packet {
            Some(packet) => self.transmit(vec![packet]).await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Install new key material; outbound media uses `key_id` from now on
    pub fn set_key(&self, key_id: u8, material: &[u8]) -> Result<(), NetworkError> {
        self.shared.core.lock().set_key(key_id, material)
    }

    pub fn state(&self) -> SessionState {
        self.shared.core.lock().state()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.core.lock().session_id()
    }

    pub fn local_ssrcs(&self) -> LocalSsrcs {
        self.shared.core.lock().local_ssrcs()
    }

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.shared.core.lock().participants()
    }

    pub fn subscriptions(&self) -> Vec<u32> {
        self.shared.core.lock().subscriptions().to_vec()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.core.lock().stats()
    }

    /// Local socket address while a socket is open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.transport().map(|t| t.local_addr())
    }

    async fn transmit(&self, packets: Vec<Vec<u8>>) -> Result<(), NetworkError> {
        if packets.is_empty() {
            return Ok(());
        }
        let transport = self.shared.transport().ok_or(NetworkError::NotConnected)?;
        for packet in &packets {
            transport.send(packet).await?;
        }
        Ok(())
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(mut io) = self.shared.io.lock().take() {
            io.abort_all();
        }
    }
}

async fn wait_connect(
    waiter: tokio::sync::oneshot::Receiver<ConnectResult>,
) -> Result<ConnectedInfo, NetworkError> {
    waiter.await.unwrap_or(Err(NetworkError::Cancelled))
}
