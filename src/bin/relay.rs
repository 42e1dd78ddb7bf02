//! Minimal voice relay for testing callwire clients
//!
//! Accepts HELLO, assigns SSRCs, and forwards media and control packets
//! between the members of each room without decrypting anything.
//!
//! Run with:
//!   cargo run --bin callwire-relay -- --port 5000
//!
//! Environment variables:
//!   RUST_LOG - Log filter (default: info)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use callwire::network::RECV_BUFFER_SIZE;
use callwire::protocol::{
    Bye, ControlMessage, Hello, MediaHeader, MediaState, Nack, PacketType, ParticipantInfo,
    ParticipantLeft, Pli, ReceiverReport, Subscribe, Timestamped, Welcome, PROTOCOL_VERSION,
};

/// Voice relay for callwire testing
#[derive(Parser, Debug)]
#[command(name = "callwire-relay")]
#[command(about = "Voice relay for callwire testing")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "5000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Drop clients silent for this many seconds
    #[arg(long, default_value = "30", env = "RELAY_IDLE_TIMEOUT")]
    idle_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// One joined client
struct Client {
    room_id: String,
    info: ParticipantInfo,
    /// Empty means "forward everything"
    subscriptions: Vec<u32>,
    last_seen: Instant,
}

type Outbound = Vec<(SocketAddr, Vec<u8>)>;

/// Relay state
struct Relay {
    clients: HashMap<SocketAddr, Client>,
    next_ssrc: u32,
    idle_timeout: Duration,
    packets_forwarded: u64,
}

impl Relay {
    fn new(idle_timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            next_ssrc: (rand::random::<u32>() >> 8) | 1,
            idle_timeout,
            packets_forwarded: 0,
        }
    }

    fn allocate_ssrc(&mut self) -> u32 {
        let ssrc = self.next_ssrc;
        self.next_ssrc = self.next_ssrc.wrapping_add(1).max(1);
        ssrc
    }

    fn room_peers<'a>(
        &'a self,
        room_id: &'a str,
        except: SocketAddr,
    ) -> impl Iterator<Item = (&'a SocketAddr, &'a Client)> + 'a {
        self.clients
            .iter()
            .filter(move |(addr, c)| **addr != except && c.room_id == room_id)
    }

    /// Address of the room member owning `ssrc`
    fn owner_of(&self, room_id: &str, ssrc: u32) -> Option<SocketAddr> {
        self.clients
            .iter()
            .find(|(_, c)| c.room_id == room_id && c.info.ssrcs().any(|s| s == ssrc))
            .map(|(addr, _)| *addr)
    }

    fn handle(&mut self, data: &[u8], from: SocketAddr, now: Instant) -> Outbound {
        let packet_type = match PacketType::of(data) {
            Ok(t) => t,
            Err(e) => {
                trace!("Dropping datagram from {}: {}", from, e);
                return Vec::new();
            }
        };

        if packet_type == PacketType::Hello {
            return self.handle_hello(data, from, now);
        }
        let Some(client) = self.clients.get_mut(&from) else {
            trace!("Dropping {:?} from unknown client {}", packet_type, from);
            return Vec::new();
        };
        client.last_seen = now;
        let room_id = client.room_id.clone();

        match packet_type {
            PacketType::Ping => Timestamped::from_bytes(data)
                .map(|ping| vec![(from, Timestamped::pong(ping.sent_ms).to_bytes())])
                .unwrap_or_default(),
            PacketType::Audio | PacketType::Video => {
                let Ok(header) = MediaHeader::from_bytes(data) else {
                    return Vec::new();
                };
                let out: Outbound = self
                    .room_peers(&room_id, from)
                    .filter(|(_, c)| {
                        c.subscriptions.is_empty() || c.subscriptions.contains(&header.ssrc)
                    })
                    .map(|(addr, _)| (*addr, data.to_vec()))
                    .collect();
                self.packets_forwarded += out.len() as u64;
                out
            }
            PacketType::Nack => {
                self.route_to_owner(&room_id, Nack::from_bytes(data).map(|n| n.ssrc).ok(), data)
            }
            PacketType::Pli => {
                self.route_to_owner(&room_id, Pli::from_bytes(data).map(|p| p.ssrc).ok(), data)
            }
            PacketType::ReceiverReport => self.route_to_owner(
                &room_id,
                ReceiverReport::from_bytes(data).map(|r| r.ssrc).ok(),
                data,
            ),
            PacketType::Speaking | PacketType::MediaState => {
                if packet_type == PacketType::MediaState {
                    if let (Ok(state), Some(client)) =
                        (MediaState::from_bytes(data), self.clients.get_mut(&from))
                    {
                        client.info.muted = state.muted.unwrap_or(client.info.muted);
                        client.info.video_enabled =
                            state.video_enabled.unwrap_or(client.info.video_enabled);
                        client.info.screen_sharing =
                            state.screen_sharing.unwrap_or(client.info.screen_sharing);
                    }
                }
                self.broadcast(&room_id, from, data)
            }
            PacketType::Subscribe => {
                if let (Ok(sub), Some(client)) =
                    (Subscribe::from_bytes(data), self.clients.get_mut(&from))
                {
                    debug!("{} subscribed to {:?}", client.info.user_id, sub.subscriptions);
                    client.subscriptions = sub.subscriptions;
                }
                Vec::new()
            }
            PacketType::Bye => {
                if Bye::from_bytes(data).is_err() {
                    return Vec::new();
                }
                self.remove_client(from)
            }
            PacketType::Hello
            | PacketType::Welcome
            | PacketType::Pong
            | PacketType::ParticipantLeft => Vec::new(),
        }
    }

    fn handle_hello(&mut self, data: &[u8], from: SocketAddr, now: Instant) -> Outbound {
        let hello = match Hello::from_bytes(data) {
            Ok(hello) => hello,
            Err(e) => {
                warn!("Bad HELLO from {}: {}", from, e);
                return Vec::new();
            }
        };
        if hello.protocol_version != PROTOCOL_VERSION {
            warn!(
                "HELLO from {} with protocol version {}",
                from, hello.protocol_version
            );
            return Vec::new();
        }

        let mut out = Vec::new();
        if self.clients.contains_key(&from) {
            // retransmitted HELLO: start over
            out.extend(self.remove_client(from));
        }

        let mut info = ParticipantInfo::new(hello.user_id.clone());
        info.ssrc = self.allocate_ssrc();
        if hello.video {
            info.video_ssrc = self.allocate_ssrc();
            info.screen_ssrc = self.allocate_ssrc();
        }

        let welcome = Welcome {
            session_id: Uuid::new_v4().to_string(),
            ssrc: info.ssrc,
            video_ssrc: info.video_ssrc,
            screen_ssrc: info.screen_ssrc,
            participants: self
                .room_peers(&hello.room_id, from)
                .map(|(_, c)| c.info.clone())
                .collect(),
        };
        let announce = MediaState {
            user_id: Some(info.user_id.clone()),
            ssrc: Some(info.ssrc),
            video_ssrc: Some(info.video_ssrc).filter(|s| *s != 0),
            screen_ssrc: Some(info.screen_ssrc).filter(|s| *s != 0),
            muted: Some(false),
            video_enabled: Some(false),
            screen_sharing: Some(false),
        };

        match (welcome.to_bytes(), announce.to_bytes()) {
            (Ok(welcome_bytes), Ok(announce_bytes)) => {
                out.extend(self.broadcast(&hello.room_id, from, &announce_bytes));
                out.push((from, welcome_bytes));
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to encode WELCOME: {}", e);
                return out;
            }
        }

        info!(
            "{} joined room {} from {} (ssrc {}, session {})",
            info.user_id, hello.room_id, from, info.ssrc, welcome.session_id
        );
        self.clients.insert(
            from,
            Client {
                room_id: hello.room_id,
                info,
                subscriptions: Vec::new(),
                last_seen: now,
            },
        );
        out
    }

    fn route_to_owner(&self, room_id: &str, ssrc: Option<u32>, data: &[u8]) -> Outbound {
        ssrc.and_then(|ssrc| self.owner_of(room_id, ssrc))
            .map(|owner| vec![(owner, data.to_vec())])
            .unwrap_or_default()
    }

    fn broadcast(&self, room_id: &str, from: SocketAddr, data: &[u8]) -> Outbound {
        self.room_peers(room_id, from)
            .map(|(addr, _)| (*addr, data.to_vec()))
            .collect()
    }

    fn remove_client(&mut self, addr: SocketAddr) -> Outbound {
        let Some(client) = self.clients.remove(&addr) else {
            return Vec::new();
        };
        info!("{} left room {}", client.info.user_id, client.room_id);
        let left = ParticipantLeft {
            user_id: Some(client.info.user_id.clone()),
            ssrc: Some(client.info.ssrc),
            video_ssrc: Some(client.info.video_ssrc).filter(|s| *s != 0),
            screen_ssrc: Some(client.info.screen_ssrc).filter(|s| *s != 0),
        };
        match left.to_bytes() {
            Ok(bytes) => self.broadcast(&client.room_id, addr, &bytes),
            Err(e) => {
                warn!("Failed to encode PARTICIPANT_LEFT: {}", e);
                Vec::new()
            }
        }
    }

    fn expire_idle(&mut self, now: Instant) -> Outbound {
        let idle: Vec<SocketAddr> = self
            .clients
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_seen) > self.idle_timeout)
            .map(|(addr, _)| *addr)
            .collect();
        idle.into_iter()
            .flat_map(|addr| {
                debug!("Client {} timed out", addr);
                self.remove_client(addr)
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let addr = format!("{}:{}", args.host, args.port);
    let socket = UdpSocket::bind(&addr).await?;
    info!("Relay listening on {}", socket.local_addr()?);

    let mut relay = Relay::new(Duration::from_secs(args.idle_timeout));
    let mut sweep = tokio::time::interval(Duration::from_secs(1));
    let mut stats = tokio::time::interval(Duration::from_secs(30));
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        let outbound = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => relay.handle(&buf[..len], from, Instant::now()),
                Err(e) => {
                    warn!("Receive error: {}", e);
                    continue;
                }
            },
            _ = sweep.tick() => relay.expire_idle(Instant::now()),
            _ = stats.tick() => {
                info!(
                    "Stats: {} clients, {} packets forwarded",
                    relay.clients.len(),
                    relay.packets_forwarded
                );
                continue;
            }
        };

        for (to, packet) in outbound {
            if let Err(e) = socket.send_to(&packet, to).await {
                warn!("Failed to send to {}: {}", to, e);
            }
        }
    }
}
