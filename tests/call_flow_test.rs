//! End-to-end call flows over the loopback relay, an in-memory directory and
//! loopback media.

use peercall::calls::{CallDependencies, CallManager, CallRole, CallSession, CallSetup};
use peercall::config::{CallManagerConfig, RelayEndpoint, SignalingConfig};
use peercall::loopback::LoopbackRelay;
use peercall::media::LoopbackMediaEngine;
use peercall::notify::{DirectoryNotificationBridge, NotificationBridge};
use peercall::rendezvous::{DirectoryStore, MemoryDirectory, RendezvousDirectory};
use peercall::signaling::SignalingClient;
use peercall::types::{CallMedia, EndReason, LocalProfile, RoomId, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const PRIMARY: &str = "primary.test";
const FALLBACK: &str = "fallback.test";
const WAIT: Duration = Duration::from_secs(120);

struct Network {
    relay: Arc<LoopbackRelay>,
    store: Arc<MemoryDirectory>,
    directory: RendezvousDirectory,
}

impl Network {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Arc::new(MemoryDirectory::new());
        Self {
            relay: Arc::new(LoopbackRelay::new()),
            directory: RendezvousDirectory::new(store.clone()),
            store,
        }
    }

    fn peer(&self, name: &str) -> Peer {
        let config = SignalingConfig {
            primary: RelayEndpoint::new(PRIMARY),
            fallback: Some(RelayEndpoint::new(FALLBACK)),
            ..Default::default()
        };
        let media = LoopbackMediaEngine::new();
        let deps = CallDependencies {
            signaling: SignalingClient::new(config, self.relay.clone(), self.relay.clone()),
            directory: self.directory.clone(),
            media: Arc::new(media.clone()),
            notifications: Some(Arc::new(DirectoryNotificationBridge::new(self.store.clone()))
                as Arc<dyn NotificationBridge>),
        };
        let profile = LocalProfile::new(name, "").with_user_id(name.to_lowercase());
        Peer {
            manager: CallManager::new(CallManagerConfig::default(), deps, profile),
            media,
        }
    }
}

struct Peer {
    manager: Arc<CallManager>,
    media: LoopbackMediaEngine,
}

impl Peer {
    async fn dial_into(&self, room: &RoomId) -> (CallSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let setup = CallSetup::outgoing(room.clone(), CallMedia::Video)
            .with_profile(self.manager.profile().clone());
        let (session, events) = self.manager.create_call(setup).await.unwrap();
        session.start().await.unwrap();
        (session, events)
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no session event in time")
        .expect("session event stream closed")
}

async fn wait_connected(events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
    loop {
        match next_event(events).await {
            SessionEvent::Connected => return,
            SessionEvent::Ended(reason) => panic!("ended before connecting: {reason}"),
            _ => {}
        }
    }
}

async fn wait_ended(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> EndReason {
    loop {
        if let SessionEvent::Ended(reason) = next_event(events).await {
            return reason;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_call_connects_and_hangup_clears_room() {
    let net = Network::new();
    let alice = net.peer("Alice");
    let bob = net.peer("Bob");

    let (caller, mut caller_events) = alice
        .manager
        .place_call(CallMedia::Video, Some("bob".into()))
        .await
        .unwrap();
    let (callee, mut callee_events) = bob
        .manager
        .join_call(caller.room().clone(), CallMedia::Video)
        .await
        .unwrap();

    wait_connected(&mut caller_events).await;
    wait_connected(&mut callee_events).await;
    assert_eq!(caller.role(), CallRole::Offerer);
    assert_eq!(callee.role(), CallRole::Answerer);
    assert_eq!(
        callee.snapshot().remote.map(|r| r.display_name),
        Some("Alice".to_string())
    );

    alice.manager.end_call(caller.room()).await.unwrap();
    assert_eq!(wait_ended(&mut caller_events).await, EndReason::LocalHangup);
    let callee_reason = wait_ended(&mut callee_events).await;
    assert!(
        matches!(callee_reason, EndReason::RemoteLeft | EndReason::RoomCleared),
        "{callee_reason:?}"
    );

    let room_prefix = format!("rooms/{}", caller.room());
    assert!(!net.store.paths().iter().any(|p| p.starts_with(&room_prefix)));
    assert_eq!(alice.media.releases(), 1);
    assert_eq!(bob.media.releases(), 1);
    assert!(!alice.manager.signaling().is_open());
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_offers_resolve_to_one_answerer() {
    let net = Network::new();
    let alice = net.peer("Alice");
    let bob = net.peer("Bob");
    let room = RoomId::generate();

    let ((a, mut a_events), (b, mut b_events)) =
        tokio::join!(alice.dial_into(&room), bob.dial_into(&room));
    wait_connected(&mut a_events).await;
    wait_connected(&mut b_events).await;

    let mut roles = vec![a.role(), b.role()];
    roles.sort_by_key(|r| *r == CallRole::Answerer);
    assert_eq!(roles, vec![CallRole::Offerer, CallRole::Answerer]);
    assert_eq!(alice.media.peer_connections(), 1);
    assert_eq!(bob.media.peer_connections(), 1);
    assert!(alice.media.rollbacks() + bob.media.rollbacks() <= 1);

    alice.manager.shutdown().await;
    bob.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_withdraws_notification() {
    let net = Network::new();
    let alice = net.peer("Alice");

    let (caller, mut events) = alice
        .manager
        .place_call(CallMedia::Audio, Some("bob".into()))
        .await
        .unwrap();
    alice.manager.stop_call(caller.room()).await.unwrap();
    assert_eq!(wait_ended(&mut events).await, EndReason::LocalStop);

    let markers: Vec<String> = net
        .store
        .paths()
        .into_iter()
        .filter(|p| p.starts_with("removeVideoCallNotification/bob/"))
        .collect();
    assert_eq!(markers.len(), 1);
    let auto_id = markers[0].rsplit('/').next().unwrap();
    assert_eq!(net.store.get(&markers[0]).as_deref(), Some(auto_id));
}

#[tokio::test(start_paused = true)]
async fn test_authoritative_end_clears_own_markers() {
    let net = Network::new();
    let alice = net.peer("Alice");
    let bob = net.peer("Bob");
    net.store
        .set(
            "removeVideoCallNotification/bob/170000000000042",
            "170000000000042".to_string(),
        )
        .await
        .unwrap();

    let (caller, mut caller_events) = alice.manager.place_call(CallMedia::Audio, None).await.unwrap();
    let (_callee, mut callee_events) = bob
        .manager
        .join_call(caller.room().clone(), CallMedia::Audio)
        .await
        .unwrap();
    wait_connected(&mut callee_events).await;

    alice.manager.end_call(caller.room()).await.unwrap();
    wait_ended(&mut caller_events).await;
    wait_ended(&mut callee_events).await;
    assert!(
        !net.store
            .paths()
            .iter()
            .any(|p| p.starts_with("removeVideoCallNotification/bob"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_call_connects_through_fallback_relay() {
    let net = Network::new();
    net.relay.set_unresponsive(PRIMARY, true);
    let alice = net.peer("Alice");
    let bob = net.peer("Bob");

    let (caller, mut caller_events) = alice.manager.place_call(CallMedia::Audio, None).await.unwrap();
    let (_callee, mut callee_events) = bob
        .manager
        .join_call(caller.room().clone(), CallMedia::Audio)
        .await
        .unwrap();
    wait_connected(&mut caller_events).await;
    wait_connected(&mut callee_events).await;

    assert_eq!(net.relay.attempts(PRIMARY), 2);
    assert_eq!(net.relay.attempts(FALLBACK), 2);
    assert_eq!(
        alice.manager.signaling().current_relay().as_deref(),
        Some(FALLBACK)
    );
}

#[tokio::test(start_paused = true)]
async fn test_lost_relay_ends_call() {
    let net = Network::new();
    let alice = net.peer("Alice");
    let bob = net.peer("Bob");

    let (caller, mut caller_events) = alice.manager.place_call(CallMedia::Audio, None).await.unwrap();
    let (_callee, mut callee_events) = bob
        .manager
        .join_call(caller.room().clone(), CallMedia::Audio)
        .await
        .unwrap();
    wait_connected(&mut caller_events).await;
    wait_connected(&mut callee_events).await;

    net.relay.set_unreachable(PRIMARY, true);
    net.relay.set_unreachable(FALLBACK, true);
    let alice_id = caller.snapshot().local_id.unwrap();
    net.relay.drop_connection(alice_id.as_str());

    assert_eq!(wait_ended(&mut caller_events).await, EndReason::SignalingLost);
}
