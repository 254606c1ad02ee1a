use anyhow::{Context, bail};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use peercall::calls::{CallDependencies, CallManager, CallSession, CallSetup};
use peercall::config::{CallManagerConfig, RelayEndpoint, SignalingConfig};
use peercall::http::UreqHttpClient;
use peercall::loopback::LoopbackRelay;
use peercall::media::LoopbackMediaEngine;
use peercall::rendezvous::{MemoryDirectory, RendezvousDirectory};
use peercall::signaling::SignalingClient;
use peercall::transport::TokioWebSocketTransportFactory;
use peercall::types::{CallMedia, EndReason, LocalProfile, RoomId, SessionEvent, SignalingEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// Demo driver for the call stack.
//
// Usage:
//   cargo run -- probe                                  # public relay, 15s of heartbeats
//   cargo run -- probe --host relay.example --port 9000 --insecure --seconds 30
//   cargo run -- simulate                               # two in-process peers
//   cargo run -- simulate --glare --video               # both sides offer at once

#[derive(Parser)]
#[command(name = "peercall", about = "Peer-to-peer call signaling demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to a relay, print the assigned identity and keep it alive.
    Probe(ProbeArgs),
    /// Run a call between two in-process peers.
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct ProbeArgs {
    #[arg(long, default_value = peercall::config::DEFAULT_PRIMARY_HOST)]
    host: String,
    #[arg(long, default_value_t = 443)]
    port: u16,
    #[arg(long, default_value = "/")]
    path: String,
    #[arg(long, default_value = peercall::config::DEFAULT_RELAY_KEY)]
    key: String,
    /// Use ws:// and http:// instead of wss:// and https://.
    #[arg(long)]
    insecure: bool,
    /// Do not fall back to the secondary public relay.
    #[arg(long)]
    no_fallback: bool,
    /// How long to stay connected.
    #[arg(long, default_value_t = 15)]
    seconds: u64,
}

#[derive(Args)]
struct SimulateArgs {
    /// Both peers place the call, forcing offer glare.
    #[arg(long)]
    glare: bool,
    #[arg(long)]
    video: bool,
    /// How long to hold the call once connected.
    #[arg(long, default_value_t = 5)]
    seconds: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            Command::Probe(args) => probe(args).await,
            Command::Simulate(args) => simulate(args).await,
        }
    })
}

async fn probe(args: ProbeArgs) -> anyhow::Result<()> {
    let mut primary = RelayEndpoint::new(args.host)
        .with_port(args.port)
        .with_path(args.path);
    if args.insecure {
        primary = primary.insecure();
    }
    let defaults = SignalingConfig::default();
    let config = SignalingConfig {
        primary,
        fallback: if args.no_fallback {
            None
        } else {
            defaults.fallback.clone()
        },
        key: args.key,
        ..defaults
    };

    let client = SignalingClient::new(
        config,
        Arc::new(TokioWebSocketTransportFactory::new()),
        Arc::new(UreqHttpClient::new()),
    );
    let mut events = client.subscribe();
    let peer_id = client.connect().await.context("relay did not open")?;
    info!("Connected as {peer_id} via {}", client.current_relay().unwrap_or_default());
    println!("{peer_id}");

    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(SignalingEvent::Open { peer_id }) => info!("Relay identity is now {peer_id}"),
                Ok(SignalingEvent::Message(message)) => info!("Relay sent {}", message.kind()),
                Ok(SignalingEvent::Error(e)) => warn!("Relay error: {e}"),
                Ok(SignalingEvent::Closed { .. }) => {
                    error!("Relay connection lost");
                    break;
                }
                Err(e) => warn!("Missed relay events: {e}"),
            },
        }
    }

    client.disconnect().await;
    info!("Disconnected");
    Ok(())
}

struct SimulatedPeer {
    manager: Arc<CallManager>,
    media: LoopbackMediaEngine,
}

fn simulated_peer(
    relay: &Arc<LoopbackRelay>,
    directory: &RendezvousDirectory,
    name: &str,
) -> SimulatedPeer {
    let config = SignalingConfig {
        primary: RelayEndpoint::new("loopback.primary"),
        fallback: Some(RelayEndpoint::new("loopback.fallback")),
        ..Default::default()
    };
    let media = LoopbackMediaEngine::new();
    let deps = CallDependencies {
        signaling: SignalingClient::new(config, relay.clone(), relay.clone()),
        directory: directory.clone(),
        media: Arc::new(media.clone()),
        notifications: None,
    };
    let profile = LocalProfile::new(name, "").with_user_id(name.to_lowercase());
    SimulatedPeer {
        manager: CallManager::new(CallManagerConfig::default(), deps, profile),
        media,
    }
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let relay = Arc::new(LoopbackRelay::new());
    let directory = RendezvousDirectory::new(Arc::new(MemoryDirectory::new()));
    let alice = simulated_peer(&relay, &directory, "Alice");
    let bob = simulated_peer(&relay, &directory, "Bob");
    let media = if args.video {
        CallMedia::Video
    } else {
        CallMedia::Audio
    };

    let ((caller, mut caller_events), (callee, mut callee_events)) = if args.glare {
        let room = RoomId::generate();
        let (a, b) = tokio::join!(
            place_into(&alice, room.clone(), media),
            place_into(&bob, room, media)
        );
        (a?, b?)
    } else {
        let a = alice.manager.place_call(media, Some("bob".into())).await?;
        let b = bob.manager.join_call(a.0.room().clone(), media).await?;
        (a, b)
    };
    info!("Room {}", caller.room());

    let timeout = Duration::from_secs(60);
    let (a, b) = tokio::join!(
        wait_connected(&mut caller_events, timeout),
        wait_connected(&mut callee_events, timeout)
    );
    a?;
    b?;
    report("Alice", &caller, &alice.media);
    report("Bob", &callee, &bob.media);

    tokio::time::sleep(Duration::from_secs(args.seconds)).await;
    alice.manager.end_call(caller.room()).await?;
    let reason = tokio::time::timeout(timeout, callee.ended())
        .await
        .context("remote side did not end")?;
    info!("Alice ended with {}", EndReason::LocalHangup);
    info!("Bob ended with {reason}");

    alice.manager.shutdown().await;
    bob.manager.shutdown().await;
    Ok(())
}

async fn place_into(
    peer: &SimulatedPeer,
    room: RoomId,
    media: CallMedia,
) -> anyhow::Result<(CallSession, mpsc::UnboundedReceiver<SessionEvent>)> {
    let setup = CallSetup::outgoing(room, media).with_profile(peer.manager.profile().clone());
    let (session, events) = peer.manager.create_call(setup).await?;
    session.start().await?;
    Ok((session, events))
}

async fn wait_connected(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let waited = tokio::time::timeout(timeout, async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Connected => return Ok(()),
                SessionEvent::Ended(reason) => bail!("call ended before connecting: {reason}"),
                SessionEvent::PeerJoined(peer) => info!("{} joined", peer.display_name),
                SessionEvent::StateChanged(state) => info!("State: {state:?}"),
            }
        }
        bail!("session went away")
    })
    .await;
    waited.context("call did not connect in time")?
}

fn report(name: &str, session: &CallSession, media: &LoopbackMediaEngine) {
    let snapshot = session.snapshot();
    info!(
        "{name}: {:?} as {:?}, {} peer connection(s), {} rollback(s)",
        snapshot.state,
        snapshot.role,
        media.peer_connections(),
        media.rollbacks()
    );
}
