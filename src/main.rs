//! callwire - Encrypted UDP voice/video transport client

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

use callwire::network::{
    SessionConfig, SessionEvent, SessionParams, SessionStats, TransportSession, KEY_SIZE,
};
use callwire::protocol::Codec;

/// Opus DTX silence frame
const SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Interval between synthetic audio frames
const AUDIO_FRAME_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(name = "callwire")]
#[command(about = "Encrypted UDP voice/video transport client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a call on a voice server
    Connect {
        /// Voice server host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Voice server UDP port
        #[arg(short, long, default_value = "5000")]
        port: u16,

        /// One-time voice token
        #[arg(long, env = "CALLWIRE_TOKEN", default_value = "")]
        token: String,

        /// Room to join
        #[arg(short, long)]
        room: String,

        /// Our user id
        #[arg(short, long)]
        user: String,

        /// Voice server id from signaling
        #[arg(long)]
        server_id: Option<String>,

        /// 32-byte media key as hex
        #[arg(short, long, env = "CALLWIRE_KEY")]
        key: String,

        /// Key id announced in HELLO and carried by every media packet
        #[arg(long, default_value = "0")]
        key_id: u8,

        /// Audio codec
        #[arg(long, default_value = "opus")]
        codec: Codec,

        /// Video codec; omit for audio-only
        #[arg(long)]
        video_codec: Option<Codec>,

        /// JSON file with transport tuning
        #[arg(long)]
        config: Option<String>,

        /// Send silence frames every 20ms
        #[arg(long)]
        send_audio: bool,

        /// Leave after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Print a fresh random media key
    GenKey,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("callwire={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn parse_key(hex_key: &str) -> Result<Vec<u8>> {
    let key = hex::decode(hex_key.trim()).context("Key must be hex")?;
    if key.len() != KEY_SIZE {
        bail!("Key must be {} bytes, got {}", KEY_SIZE, key.len());
    }
    Ok(key)
}

fn load_config(path: Option<&str>) -> Result<SessionConfig> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path))?;
            SessionConfig::from_json(&json).with_context(|| format!("Invalid config {}", path))
        }
        None => Ok(SessionConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::GenKey => {
            let key: [u8; KEY_SIZE] = rand::random();
            println!("{}", hex::encode(key));
            Ok(())
        }
        Commands::Connect {
            host,
            port,
            token,
            room,
            user,
            server_id,
            key,
            key_id,
            codec,
            video_codec,
            config,
            send_audio,
            duration,
        } => {
            let config = load_config(config.as_deref())?;
            let params = SessionParams {
                host,
                port,
                server_id,
                token,
                room_id: room,
                user_id: user,
                audio_codec: codec,
                video_codec,
                key_id,
                key: parse_key(&key)?,
                participants: Vec::new(),
            };
            run_call(config, params, send_audio, duration.map(Duration::from_secs)).await
        }
    }
}

async fn run_call(
    config: SessionConfig,
    params: SessionParams,
    send_audio: bool,
    duration: Option<Duration>,
) -> Result<()> {
    let (session, events) = TransportSession::new(config, params)?;

    let info = session.connect().await.context("Failed to connect")?;
    info!(
        "Joined session {} as ssrc {} with {} participants",
        info.session_id,
        info.ssrcs.audio,
        info.participants.len()
    );
    for participant in &info.participants {
        info!("  - {} (ssrc {})", participant.user_id, participant.ssrc);
    }

    let event_task = tokio::spawn(log_events(events));

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(AUDIO_FRAME_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = ticker.tick(), if send_audio => {
                if let Err(e) = session.send_audio(&SILENCE_FRAME).await {
                    warn!("Failed to send audio: {}", e);
                }
            }
        }
    }

    let stats = session.stats();
    session.disconnect().await;
    drop(session);
    let _ = event_task.await;

    print_stats(&stats);
    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Connected(_) => {}
            SessionEvent::Disconnected => {
                info!("Session closed");
                break;
            }
            SessionEvent::Error(e) => warn!("Transport error: {}", e),
            SessionEvent::Audio(frame) => debug!(
                "Audio from {} (ssrc {}, seq {}): {} bytes",
                frame.user_id.as_deref().unwrap_or("?"),
                frame.ssrc,
                frame.sequence,
                frame.data.len()
            ),
            SessionEvent::Video(frame) => debug!(
                "Video frame {} from ssrc {}: {} bytes{}",
                frame.frame_id,
                frame.ssrc,
                frame.data.len(),
                if frame.is_keyframe { " (keyframe)" } else { "" }
            ),
            SessionEvent::Speaking {
                user_id, speaking, ..
            } => info!("{} {}", user_id, if speaking { "speaking" } else { "silent" }),
            SessionEvent::MediaState {
                user_id,
                muted,
                video_enabled,
                screen_sharing,
            } => info!(
                "{}: muted={} video={} screen={}",
                user_id, muted, video_enabled, screen_sharing
            ),
            SessionEvent::ParticipantJoined(p) => info!("{} joined", p.user_id),
            SessionEvent::ParticipantUpdated(p) => debug!("{} updated", p.user_id),
            SessionEvent::ParticipantLeft { user_id, .. } => info!("{} left", user_id),
            SessionEvent::Rtt(rtt) => debug!("RTT {:.0}ms", rtt),
            SessionEvent::PliRequested { ssrc } => debug!("Keyframe requested for ssrc {}", ssrc),
            SessionEvent::DecryptError {
                ssrc, failures, ..
            } => warn!("Decrypt failure on ssrc {} ({} total)", ssrc, failures),
        }
    }
}

fn print_stats(stats: &SessionStats) {
    println!("\n Session Statistics");
    println!("   Packets sent:     {:>10}", stats.packets_sent);
    println!("   Packets received: {:>10}", stats.packets_received);
    println!("   Bytes sent:       {:>10}", stats.bytes_sent);
    println!("   Bytes received:   {:>10}", stats.bytes_received);
    println!("   Decrypt failures: {:>10}", stats.decrypt_failures);
    if let Some(rtt) = stats.rtt_ms {
        println!("   RTT:              {:>7.0} ms", rtt);
    }
    for stream in &stats.streams {
        println!(
            "   ssrc {:>10}: {} received, {} lost, jitter {:.1} ms",
            stream.ssrc, stream.packets_received, stream.packets_lost, stream.jitter_ms
        );
    }
}
