//! One call: an actor that composes the relay, the rendezvous directory and
//! the media engine.
//!
//! Every input (commands from [`CallSession`] handles, relay events, room
//! snapshots, media events and timers) funnels into a single channel consumed
//! by one task, so decisions such as offer glare are taken without locks.

use super::candidates::CandidateQueue;
use super::error::CallError;
use super::state::{
    CallRole, CallSessionState, CallTransition, GlareOutcome, SessionMachine, resolve_glare,
};
use crate::config::CallSessionConfig;
use crate::media::{IceConnectionState, MediaEngine, MediaEvent, PeerConnection};
use crate::notify::NotificationBridge;
use crate::rendezvous::{RendezvousDirectory, RoomEvent, RoomWatch};
use crate::signaling::{SignalingClient, SignalingError, SignalingLease};
use crate::types::call::{CallDirection, CallMedia, EndReason};
use crate::types::events::{SessionEvent, SignalingEvent};
use crate::types::message::{IceCandidateRecord, SessionDescriptor, SignalingMessage};
use crate::types::peer::{LocalProfile, PeerIdentity, PeerRecord, RoomId};
use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;

/// Consecutive directory failures tolerated by the room watch.
const ROOM_WATCH_RETRIES: u32 = 3;
const ROOM_WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What to call and how.
#[derive(Debug, Clone)]
pub struct CallSetup {
    pub room: RoomId,
    pub direction: CallDirection,
    pub media: CallMedia,
    pub profile: LocalProfile,
    /// Application user id of the callee. An outgoing call that never
    /// connects withdraws the callee's notification through it.
    pub remote_user: Option<String>,
}

impl CallSetup {
    pub fn outgoing(room: RoomId, media: CallMedia) -> Self {
        Self {
            room,
            direction: CallDirection::Outgoing,
            media,
            profile: LocalProfile::default(),
            remote_user: None,
        }
    }

    pub fn incoming(room: RoomId, media: CallMedia) -> Self {
        Self {
            direction: CallDirection::Incoming,
            ..Self::outgoing(room, media)
        }
    }

    pub fn with_profile(mut self, profile: LocalProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_remote_user(mut self, user: impl Into<String>) -> Self {
        self.remote_user = Some(user.into());
        self
    }
}

/// Collaborators a session runs against.
#[derive(Clone)]
pub struct CallDependencies {
    pub signaling: Arc<SignalingClient>,
    pub directory: RendezvousDirectory,
    pub media: Arc<dyn MediaEngine>,
    pub notifications: Option<Arc<dyn NotificationBridge>>,
}

/// Point-in-time view of a session, readable from any handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub state: CallSessionState,
    pub role: CallRole,
    pub local_id: Option<PeerIdentity>,
    pub remote_id: Option<PeerIdentity>,
    pub remote: Option<PeerRecord>,
    pub connected_once: bool,
    /// When ICE first connected. Call duration counts from here.
    pub connected_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    /// Time since the call first connected.
    pub fn duration(&self) -> Option<chrono::TimeDelta> {
        self.connected_at.map(|at| Utc::now() - at)
    }
}

/// Handle to a call session. Cheap to clone; all clones drive the same actor.
#[derive(Clone)]
pub struct CallSession {
    room: RoomId,
    direction: CallDirection,
    inputs: mpsc::UnboundedSender<Input>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("room", &self.room)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl CallSession {
    /// Creates the session in `Idle` and spawns its actor. Must be called
    /// inside a Tokio runtime.
    pub fn new(
        setup: CallSetup,
        deps: CallDependencies,
        config: CallSessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (inputs, input_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot::default());

        let handle = Self {
            room: setup.room.clone(),
            direction: setup.direction,
            inputs: inputs.clone(),
            snapshot,
        };
        let actor = SessionActor::new(setup, deps, config, inputs, events, snapshot_tx);
        tokio::spawn(actor.run(input_rx));
        (handle, event_rx)
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> CallSessionState {
        self.snapshot.borrow().state.clone()
    }

    pub fn role(&self) -> CallRole {
        self.snapshot.borrow().role
    }

    pub fn is_ended(&self) -> bool {
        self.snapshot.borrow().state.is_ended()
    }

    /// Prepares media, opens the relay and joins the room. Resolves once the
    /// session is `AwaitingPeer`, or with the error that ended it.
    pub async fn start(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        if self.inputs.send(Input::Start(reply)).is_err() {
            return Err(self.ended_error());
        }
        rx.await.unwrap_or_else(|_| Err(self.ended_error()))
    }

    /// Ends the call for both sides: the room is deleted and the remote told.
    pub async fn hangup(&self) {
        self.end(EndReason::LocalHangup).await;
    }

    /// Ends the call locally, leaving the room in place. Idempotent; returns
    /// once every task of the session has been cancelled.
    pub async fn stop(&self) {
        self.end(EndReason::LocalStop).await;
    }

    /// Resolves with the end reason once the session reaches `Ended`.
    pub async fn ended(&self) -> EndReason {
        let mut rx = self.snapshot.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().state.end_reason() {
                return reason.clone();
            }
            if rx.changed().await.is_err() {
                return rx
                    .borrow()
                    .state
                    .end_reason()
                    .cloned()
                    .unwrap_or(EndReason::LocalStop);
            }
        }
    }

    pub fn set_microphone_muted(&self, muted: bool) {
        let _ = self.inputs.send(Input::Microphone(muted));
    }

    pub fn set_camera_enabled(&self, enabled: bool) {
        let _ = self.inputs.send(Input::Camera(enabled));
    }

    /// Ignored while the camera is off.
    pub fn switch_camera(&self) {
        let _ = self.inputs.send(Input::SwitchCamera);
    }

    async fn end(&self, reason: EndReason) {
        let (done, rx) = oneshot::channel();
        if self.inputs.send(Input::End { reason, done }).is_ok() {
            let _ = rx.await;
        }
    }

    fn ended_error(&self) -> CallError {
        CallError::Ended(
            self.snapshot
                .borrow()
                .state
                .end_reason()
                .cloned()
                .unwrap_or(EndReason::LocalStop),
        )
    }
}

enum Input {
    Start(oneshot::Sender<Result<(), CallError>>),
    End {
        reason: EndReason,
        done: oneshot::Sender<()>,
    },
    Microphone(bool),
    Camera(bool),
    SwitchCamera,
    Bootstrapped(Result<Bootstrap, BootstrapFailure>),
    Signaling(SignalingEvent),
    Room(RoomUpdate),
    Media(MediaEvent),
    Timer { kind: TimerKind, generation: u64 },
}

struct Bootstrap {
    local_id: PeerIdentity,
    peer_connection: Box<dyn PeerConnection>,
}

struct BootstrapFailure {
    reason: EndReason,
    error: CallError,
}

enum RoomUpdate {
    Event(RoomEvent),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    IceConnect,
    IceGrace,
    AnswerFallback,
}

struct SessionActor {
    setup: CallSetup,
    deps: CallDependencies,
    config: CallSessionConfig,
    inputs: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,

    machine: SessionMachine,
    started: bool,
    pending_start: Option<oneshot::Sender<Result<(), CallError>>>,
    lease: Option<SignalingLease>,
    tasks: Vec<AbortHandle>,
    timers: HashMap<TimerKind, (u64, AbortHandle)>,
    timer_generation: u64,
    room_control: Option<mpsc::UnboundedSender<PeerIdentity>>,
    /// Set by bootstrap once our own record is in the room.
    joined: Option<watch::Receiver<Option<PeerIdentity>>>,
    /// The relay closed for good while bootstrap was still running.
    relay_closed: bool,
    /// Outbound signaling held while the relay link is down.
    held: Vec<SignalingMessage>,

    local_id: Option<PeerIdentity>,
    remote_id: Option<PeerIdentity>,
    remote: Option<PeerRecord>,
    peer_connection: Option<Box<dyn PeerConnection>>,
    connection_id: Option<String>,
    /// Local candidates waiting for the remote identity.
    outbound: CandidateQueue,
    /// Remote candidates waiting for the remote description.
    inbound: CandidateQueue,
    /// An offer that arrived before the session finished joining.
    early_offer: Option<(PeerIdentity, SessionDescriptor, String)>,

    camera_enabled: bool,
    connected_once: bool,
    connected_at: Option<DateTime<Utc>>,
    removal_notified: bool,
}

impl SessionActor {
    fn new(
        setup: CallSetup,
        deps: CallDependencies,
        config: CallSessionConfig,
        inputs: mpsc::UnboundedSender<Input>,
        events: mpsc::UnboundedSender<SessionEvent>,
        snapshot: watch::Sender<SessionSnapshot>,
    ) -> Self {
        let camera_enabled = setup.media.has_video();
        Self {
            setup,
            deps,
            config,
            inputs,
            events,
            snapshot,
            machine: SessionMachine::new(),
            started: false,
            pending_start: None,
            lease: None,
            tasks: Vec::new(),
            timers: HashMap::new(),
            timer_generation: 0,
            room_control: None,
            joined: None,
            relay_closed: false,
            held: Vec::new(),
            local_id: None,
            remote_id: None,
            remote: None,
            peer_connection: None,
            connection_id: None,
            outbound: CandidateQueue::new(),
            inbound: CandidateQueue::new(),
            early_offer: None,
            camera_enabled,
            connected_once: false,
            connected_at: None,
            removal_notified: false,
        }
    }

    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = inputs.recv().await {
            self.handle(input).await;
            if self.machine.state().is_ended() {
                break;
            }
        }
        debug!(target: "Call", "Session actor for room {} finished", self.setup.room);
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Start(reply) => self.on_start(reply),
            Input::End { reason, done } => {
                self.terminate(reason).await;
                let _ = done.send(());
            }
            Input::Microphone(muted) => self.deps.media.set_microphone_muted(muted),
            Input::Camera(enabled) => {
                self.camera_enabled = enabled;
                self.deps.media.set_camera_enabled(enabled);
            }
            Input::SwitchCamera => {
                if self.camera_enabled {
                    self.deps.media.switch_camera();
                } else {
                    debug!(target: "Call", "Camera is off, not switching");
                }
            }
            Input::Bootstrapped(result) => self.on_bootstrapped(result).await,
            Input::Signaling(event) => self.on_signaling(event).await,
            Input::Room(update) => self.on_room(update).await,
            Input::Media(event) => self.on_media(event).await,
            Input::Timer { kind, generation } => self.on_timer(kind, generation).await,
        }
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(task).abort_handle());
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            state: self.machine.state().clone(),
            role: self.machine.role(),
            local_id: self.local_id.clone(),
            remote_id: self.remote_id.clone(),
            remote: self.remote.clone(),
            connected_once: self.connected_once,
            connected_at: self.connected_at,
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Applies `transition`, publishing the result. Returns false when the
    /// machine rejected it.
    fn transition(&mut self, transition: CallTransition) -> bool {
        let before = self.machine.state().clone();
        if let Err(e) = self.machine.apply_transition(transition) {
            warn!(target: "Call", "{e}");
            return false;
        }
        self.publish();
        let after = self.machine.state();
        if *after != before {
            debug!(target: "Call", "Room {}: {before:?} -> {after:?}", self.setup.room);
            self.emit(SessionEvent::StateChanged(after.clone()));
        }
        true
    }

    fn on_start(&mut self, reply: oneshot::Sender<Result<(), CallError>>) {
        if self.started {
            let _ = reply.send(Err(CallError::AlreadyStarted));
            return;
        }
        self.started = true;
        self.pending_start = Some(reply);
        info!(
            target: "Call",
            "Starting {:?} {:?} call in room {}",
            self.setup.direction, self.setup.media, self.setup.room
        );

        self.lease = Some(self.deps.signaling.acquire());

        // Subscribe before connecting so nothing sent right after OPEN is missed.
        let relay_events = self.deps.signaling.subscribe();
        self.spawn(signaling_pump(relay_events, self.inputs.clone()));

        let (media_tx, media_rx) = mpsc::unbounded_channel();
        self.spawn(media_pump(media_rx, self.inputs.clone()));

        let (joined_tx, joined_rx) = watch::channel(None);
        self.joined = Some(joined_rx);

        let setup = self.setup.clone();
        let deps = self.deps.clone();
        let inputs = self.inputs.clone();
        self.spawn(async move {
            let result = bootstrap(setup, deps, media_tx, joined_tx).await;
            let _ = inputs.send(Input::Bootstrapped(result));
        });
    }

    async fn on_bootstrapped(&mut self, result: Result<Bootstrap, BootstrapFailure>) {
        let Bootstrap {
            local_id,
            peer_connection,
        } = match result {
            Ok(bootstrap) => bootstrap,
            Err(failure) => {
                warn!(target: "Call", "Could not start call: {}", failure.error);
                let reply = self.pending_start.take();
                self.terminate(failure.reason).await;
                if let Some(reply) = reply {
                    let _ = reply.send(Err(failure.error));
                }
                return;
            }
        };

        self.local_id = Some(local_id.clone());
        self.peer_connection = Some(peer_connection);
        if self.relay_closed {
            warn!(target: "Call", "Relay closed while joining room {}", self.setup.room);
            self.terminate(EndReason::SignalingLost).await;
            return;
        }
        self.transition(CallTransition::Joined);
        self.start_room_watch(local_id.clone());
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Ok(()));
        }

        // The relay may have reissued our identity while we were joining.
        if let Some(current) = self.deps.signaling.peer_id()
            && current != local_id
        {
            self.on_reissued(current).await;
        }
        if let Some((src, offer, connection_id)) = self.early_offer.take() {
            self.on_offer(src, offer, connection_id).await;
        }
    }

    fn start_room_watch(&mut self, local_id: PeerIdentity) {
        let watch = self.deps.directory.watch(&self.setup.room, local_id);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.room_control = Some(control_tx);
        self.spawn(room_pump(watch, control_rx, self.inputs.clone()));
    }

    async fn on_reissued(&mut self, new_id: PeerIdentity) {
        let Some(old_id) = self.local_id.replace(new_id.clone()) else {
            return;
        };
        info!(target: "Call", "Identity reissued: {old_id} -> {new_id}");
        self.publish();
        if let Some(control) = &self.room_control {
            let _ = control.send(new_id.clone());
        }

        let room = &self.setup.room;
        let record = self.setup.profile.record_for(&new_id);
        if let Err(e) = self.deps.directory.join(room, &record).await {
            warn!(target: "Call", "Failed to publish reissued identity: {e}");
        }
        if let Err(e) = self.deps.directory.leave(room, &old_id, false).await {
            warn!(target: "Call", "Failed to remove stale record {old_id}: {e}");
        }
    }

    async fn on_signaling(&mut self, event: SignalingEvent) {
        // While bootstrapping, the outcome of connect() decides.
        let bootstrapping = *self.machine.state() == CallSessionState::Idle;
        match event {
            SignalingEvent::Open { peer_id } => {
                if bootstrapping {
                    self.relay_closed = false;
                    return;
                }
                if self.local_id.as_ref() != Some(&peer_id) {
                    self.on_reissued(peer_id).await;
                }
                self.flush_held();
            }
            SignalingEvent::Message(message) => self.on_message(message).await,
            SignalingEvent::Error(SignalingError::Transport(detail))
                if !bootstrapping && !self.deps.signaling.is_open() =>
            {
                info!(target: "Call", "Relay link lost ({detail}), holding signaling until it reopens");
            }
            SignalingEvent::Error(e) => debug!(target: "Call", "Relay reported: {e}"),
            SignalingEvent::Closed { expected } => {
                if bootstrapping {
                    self.relay_closed = true;
                    return;
                }
                warn!(target: "Call", "Relay connection closed (expected: {expected})");
                self.terminate(EndReason::SignalingLost).await;
            }
        }
    }

    /// Resolves the remote from an offer's sender, or rejects a stranger.
    fn offer_source(&mut self, src: Option<String>) -> Option<PeerIdentity> {
        let src = PeerIdentity::from(src?);
        if self.local_id.as_ref() == Some(&src) {
            return None;
        }
        match &self.remote_id {
            Some(remote) if *remote != src => {
                debug!(target: "Call", "Ignoring OFFER from {src}, talking to {remote}");
                None
            }
            Some(_) => Some(src),
            None => {
                self.resolve_remote(src.clone());
                Some(src)
            }
        }
    }

    fn is_remote(&self, src: Option<&str>, kind: &str) -> bool {
        let matches = matches!((src, &self.remote_id), (Some(src), Some(remote)) if remote == src);
        if !matches {
            debug!(target: "Call", "Ignoring {kind} from {}", src.unwrap_or("<unknown>"));
        }
        matches
    }

    async fn on_message(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Offer {
                src,
                description,
                connection_id,
                ..
            } => {
                let Some(src) = self.offer_source(src) else {
                    return;
                };
                if *self.machine.state() == CallSessionState::Idle {
                    self.early_offer = Some((src, description, connection_id));
                } else {
                    self.on_offer(src, description, connection_id).await;
                }
            }
            SignalingMessage::Answer {
                src, description, ..
            } => {
                if self.is_remote(src.as_deref(), "ANSWER") {
                    self.on_answer(description).await;
                }
            }
            SignalingMessage::Candidate { src, candidate, .. } => {
                if self.is_remote(src.as_deref(), "CANDIDATE")
                    && let Some(candidate) = self.inbound.offer(candidate)
                {
                    self.apply_remote_candidate(candidate).await;
                }
            }
            SignalingMessage::Leave { src, .. } => {
                if self.is_remote(src.as_deref(), "LEAVE") {
                    info!(target: "Call", "Remote peer left room {}", self.setup.room);
                    self.terminate(EndReason::RemoteLeft).await;
                }
            }
            SignalingMessage::Expire { src } => {
                debug!(target: "Call", "Relay could not deliver to {}", src.unwrap_or_default());
            }
            SignalingMessage::Error { message } => {
                warn!(target: "Call", "Relay error: {message}");
            }
            other => trace!(target: "Call", "Ignoring {}", other.kind()),
        }
    }

    fn resolve_remote(&mut self, remote: PeerIdentity) {
        info!(target: "Call", "Remote peer in room {} is {remote}", self.setup.room);
        self.remote_id = Some(remote);
        self.publish();
        for candidate in self.outbound.open() {
            self.send_candidate(candidate);
        }
    }

    fn connection_id(&mut self) -> String {
        self.connection_id
            .get_or_insert_with(new_connection_id)
            .clone()
    }

    /// Sends right away, or holds the message until the relay reopens. Held
    /// messages go out first, in order.
    fn relay_send(&mut self, message: SignalingMessage) {
        if self.held.is_empty() && self.deps.signaling.is_open() {
            self.deps.signaling.send(message);
        } else {
            debug!(target: "Call", "Relay is down, holding {}", message.kind());
            self.held.push(message);
        }
    }

    fn flush_held(&mut self) {
        if self.held.is_empty() {
            return;
        }
        info!(target: "Call", "Relay is back, sending {} held message(s)", self.held.len());
        for message in std::mem::take(&mut self.held) {
            self.deps.signaling.send(message);
        }
    }

    fn send_candidate(&mut self, candidate: IceCandidateRecord) {
        let Some(remote) = self.remote_id.clone() else {
            return;
        };
        let connection_id = self.connection_id();
        self.relay_send(SignalingMessage::candidate(
            remote.as_str(),
            candidate,
            &connection_id,
        ));
    }

    async fn on_room(&mut self, update: RoomUpdate) {
        match update {
            RoomUpdate::Event(RoomEvent::Peers(peers)) => self.on_peers(peers).await,
            RoomUpdate::Event(RoomEvent::Cleared) => {
                self.terminate(EndReason::RoomCleared).await;
            }
            RoomUpdate::Failed(detail) => {
                self.terminate(EndReason::DirectoryUnavailable(detail)).await;
            }
        }
    }

    async fn on_peers(&mut self, peers: Vec<PeerRecord>) {
        if self.remote.is_some() {
            return;
        }
        let record = match &self.remote_id {
            Some(remote) => peers.into_iter().find(|p| remote == p.peer_id.as_str()),
            None => peers
                .into_iter()
                .find(|p| self.local_id.as_ref().is_none_or(|id| id != p.peer_id.as_str())),
        };
        let Some(record) = record else {
            return;
        };

        if self.remote_id.is_none() {
            self.resolve_remote(record.identity());
        }
        self.remote = Some(record.clone());
        self.publish();
        self.emit(SessionEvent::PeerJoined(record));

        if *self.machine.state() != CallSessionState::AwaitingPeer {
            return;
        }
        if self.setup.direction.is_initiator() {
            self.send_offer().await;
        } else if let Some(delay) = self.config.answer_fallback {
            self.arm_timer(TimerKind::AnswerFallback, delay);
        }
    }

    async fn send_offer(&mut self) {
        let Some(remote) = self.remote_id.clone() else {
            return;
        };
        let Some(pc) = self.peer_connection.as_mut() else {
            return;
        };
        let offer = pc.create_offer().await;
        match offer {
            Ok(offer) => {
                let connection_id = new_connection_id();
                self.connection_id = Some(connection_id.clone());
                info!(target: "Call", "Sending offer to {remote}");
                self.relay_send(SignalingMessage::offer(
                    remote.as_str(),
                    offer,
                    &connection_id,
                ));
                self.transition(CallTransition::OfferSent);
                self.arm_ice_connect_timer();
            }
            Err(e) => {
                self.terminate(EndReason::NegotiationFailed(e.to_string()))
                    .await;
            }
        }
    }

    async fn on_offer(
        &mut self,
        src: PeerIdentity,
        offer: SessionDescriptor,
        connection_id: String,
    ) {
        let state = self.machine.state().clone();
        match (state, self.machine.role()) {
            (CallSessionState::AwaitingPeer, _) => {
                self.answer_offer(src, offer, connection_id).await;
            }
            (CallSessionState::Offering, CallRole::Unresolved) => {
                let Some(local_id) = self.local_id.clone() else {
                    return;
                };
                match resolve_glare(&local_id, &src) {
                    GlareOutcome::KeepOffering => {
                        info!(target: "Call", "Offer glare with {src}: keeping our offer");
                    }
                    GlareOutcome::Yield => {
                        info!(target: "Call", "Offer glare with {src}: answering theirs");
                        self.answer_offer(src, offer, connection_id).await;
                    }
                }
            }
            (state, role) => {
                debug!(target: "Call", "Ignoring OFFER from {src} in {state:?} ({role:?})");
            }
        }
    }

    async fn answer_offer(
        &mut self,
        src: PeerIdentity,
        offer: SessionDescriptor,
        connection_id: String,
    ) {
        self.cancel_timer(TimerKind::AnswerFallback);
        let Some(pc) = self.peer_connection.as_mut() else {
            return;
        };
        let answer = pc.accept_offer(offer).await;
        match answer {
            Ok(answer) => {
                self.connection_id = Some(connection_id.clone());
                self.relay_send(SignalingMessage::answer(
                    src.as_str(),
                    answer,
                    &connection_id,
                ));
                self.transition(CallTransition::OfferAccepted);
                self.arm_ice_connect_timer();
                self.apply_buffered_candidates().await;
            }
            Err(e) => {
                self.terminate(EndReason::NegotiationFailed(e.to_string()))
                    .await;
            }
        }
    }

    async fn on_answer(&mut self, answer: SessionDescriptor) {
        if !(*self.machine.state() == CallSessionState::Offering
            && self.machine.role() == CallRole::Unresolved)
        {
            debug!(target: "Call", "Ignoring ANSWER in {:?}", self.machine.state());
            return;
        }
        let Some(pc) = self.peer_connection.as_mut() else {
            return;
        };
        let applied = pc.apply_answer(answer).await;
        match applied {
            Ok(()) => {
                self.transition(CallTransition::AnswerApplied);
                self.apply_buffered_candidates().await;
            }
            Err(e) => {
                self.terminate(EndReason::NegotiationFailed(e.to_string()))
                    .await;
            }
        }
    }

    async fn apply_buffered_candidates(&mut self) {
        for candidate in self.inbound.open() {
            self.apply_remote_candidate(candidate).await;
        }
    }

    async fn apply_remote_candidate(&mut self, candidate: IceCandidateRecord) {
        if let Some(pc) = self.peer_connection.as_mut()
            && let Err(e) = pc.add_remote_candidate(candidate).await
        {
            warn!(target: "Call", "Dropping remote candidate: {e}");
        }
    }

    async fn on_media(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                if let Some(candidate) = self.outbound.offer(candidate) {
                    self.send_candidate(candidate);
                }
            }
            MediaEvent::IceStateChanged(state) => self.on_ice_state(state),
            MediaEvent::NegotiationFailed(detail) => {
                self.terminate(EndReason::NegotiationFailed(detail)).await;
            }
        }
    }

    fn on_ice_state(&mut self, state: IceConnectionState) {
        debug!(target: "Call", "ICE {state:?} in room {}", self.setup.room);
        if state.is_connected() {
            self.cancel_timer(TimerKind::IceGrace);
            if self.machine.state().is_negotiating() && self.transition(CallTransition::IceConnected)
            {
                self.cancel_timer(TimerKind::IceConnect);
                self.connected_once = true;
                self.connected_at.get_or_insert_with(Utc::now);
                self.publish();
                info!(target: "Call", "Call in room {} connected", self.setup.room);
                self.emit(SessionEvent::Connected);
            }
        } else if state.is_interrupted() && !self.timers.contains_key(&TimerKind::IceGrace) {
            self.arm_timer(TimerKind::IceGrace, self.config.ice_disconnect_grace);
        }
    }

    fn arm_ice_connect_timer(&mut self) {
        if !self.connected_once && !self.timers.contains_key(&TimerKind::IceConnect) {
            self.arm_timer(TimerKind::IceConnect, self.config.ice_connect_timeout);
        }
    }

    fn arm_timer(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel_timer(kind);
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let inputs = self.inputs.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(Input::Timer { kind, generation });
        })
        .abort_handle();
        self.timers.insert(kind, (generation, handle));
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.timers.remove(&kind) {
            handle.abort();
        }
    }

    async fn on_timer(&mut self, kind: TimerKind, generation: u64) {
        match self.timers.get(&kind) {
            Some((current, _)) if *current == generation => {
                self.timers.remove(&kind);
            }
            _ => return,
        }
        match kind {
            TimerKind::IceConnect => {
                if *self.machine.state() != CallSessionState::Connected {
                    warn!(target: "Call", "ICE did not connect in time");
                    self.terminate(EndReason::IceTimeout).await;
                }
            }
            TimerKind::IceGrace => {
                warn!(target: "Call", "ICE did not recover in time");
                self.terminate(EndReason::IceDisconnected).await;
            }
            TimerKind::AnswerFallback => {
                if *self.machine.state() == CallSessionState::AwaitingPeer {
                    info!(target: "Call", "No offer received, offering ourselves");
                    self.send_offer().await;
                }
            }
        }
    }

    /// Moves to `Ended` and releases everything. Runs at most once.
    async fn terminate(&mut self, reason: EndReason) {
        if self.machine.state().is_ended() {
            return;
        }
        let authoritative = reason.is_authoritative();
        info!(target: "Call", "Ending call in room {}: {reason}", self.setup.room);
        self.transition(CallTransition::Terminated {
            reason: reason.clone(),
        });

        for task in self.tasks.drain(..) {
            task.abort();
        }
        for (_, (_, timer)) in self.timers.drain() {
            timer.abort();
        }
        self.room_control = None;
        self.outbound.clear();
        self.inbound.clear();
        self.held.clear();

        if let Some(mut pc) = self.peer_connection.take() {
            pc.close().await;
        }

        if self.started {
            self.deps.media.release_local_media().await;
            // Only a session whose own join went through may touch the room.
            let member = self
                .local_id
                .clone()
                .or_else(|| self.joined.as_ref().and_then(|j| j.borrow().clone()));
            if let Some(local_id) = &member {
                self.leave_room(local_id, authoritative).await;
            }
            self.notify(authoritative && member.is_some()).await;
        }

        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }

        self.emit(SessionEvent::Ended(reason.clone()));
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(CallError::Ended(reason)));
        }
    }

    async fn leave_room(&mut self, local_id: &PeerIdentity, authoritative: bool) {
        if authoritative && let Some(remote) = &self.remote_id {
            self.deps
                .signaling
                .send(SignalingMessage::leave(remote.as_str()));
        }

        if let Err(e) = self
            .deps
            .directory
            .leave(&self.setup.room, local_id, authoritative)
            .await
        {
            warn!(target: "Call", "Failed to leave room {}: {e}", self.setup.room);
        }
    }

    /// Withdraws an unanswered call's notification; `clean_own` also clears
    /// the markers addressed to the local user.
    async fn notify(&mut self, clean_own: bool) {
        let Some(bridge) = self.deps.notifications.clone() else {
            return;
        };
        if self.setup.direction == CallDirection::Outgoing
            && !self.connected_once
            && !self.removal_notified
            && let Some(receiver) = &self.setup.remote_user
        {
            self.removal_notified = true;
            if let Err(e) = bridge.notify_remove_call(receiver).await {
                warn!(target: "Call", "Failed to withdraw call notification: {e}");
            }
        }
        if clean_own
            && let Some(uid) = &self.setup.profile.user_id
            && let Err(e) = bridge.cleanup_self_notifications(uid).await
        {
            warn!(target: "Call", "Failed to clean up notifications: {e}");
        }
    }
}

async fn bootstrap(
    setup: CallSetup,
    deps: CallDependencies,
    media_events: mpsc::UnboundedSender<MediaEvent>,
    joined: watch::Sender<Option<PeerIdentity>>,
) -> Result<Bootstrap, BootstrapFailure> {
    deps.media
        .prepare_local_media(setup.media)
        .await
        .map_err(|e| BootstrapFailure {
            reason: EndReason::MediaUnavailable(e.to_string()),
            error: e.into(),
        })?;
    let peer_connection = deps
        .media
        .create_peer_connection(media_events)
        .await
        .map_err(|e| BootstrapFailure {
            reason: EndReason::MediaUnavailable(e.to_string()),
            error: e.into(),
        })?;

    let local_id = deps.signaling.connect().await.map_err(|e| {
        let reason = match e {
            SignalingError::OpenTimeout(_) => EndReason::RelayTimeout,
            _ => EndReason::SignalingLost,
        };
        BootstrapFailure {
            reason,
            error: e.into(),
        }
    })?;

    deps.directory
        .join(&setup.room, &setup.profile.record_for(&local_id))
        .await
        .map_err(|e| BootstrapFailure {
            reason: EndReason::DirectoryUnavailable(e.to_string()),
            error: e.into(),
        })?;
    joined.send_replace(Some(local_id.clone()));

    Ok(Bootstrap {
        local_id,
        peer_connection,
    })
}

async fn signaling_pump(
    mut events: broadcast::Receiver<SignalingEvent>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if inputs.send(Input::Signaling(event)).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target: "Call", "Fell behind the relay, {skipped} events skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn media_pump(
    mut events: mpsc::UnboundedReceiver<MediaEvent>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    while let Some(event) = events.recv().await {
        if inputs.send(Input::Media(event)).is_err() {
            break;
        }
    }
}

async fn room_pump(
    mut watch: RoomWatch,
    mut control: mpsc::UnboundedReceiver<PeerIdentity>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    let mut failures = 0;
    loop {
        let next = tokio::select! {
            biased;
            Some(self_id) = control.recv() => {
                watch.set_self_id(self_id);
                continue;
            }
            next = watch.next() => next,
        };
        match next {
            Ok(Some(event)) => {
                failures = 0;
                if inputs.send(Input::Room(RoomUpdate::Event(event))).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                failures += 1;
                if failures > ROOM_WATCH_RETRIES {
                    let _ = inputs.send(Input::Room(RoomUpdate::Failed(e.to_string())));
                    break;
                }
                warn!(target: "Call", "Room watch failed ({failures}/{ROOM_WATCH_RETRIES}): {e}");
                watch.restart();
                tokio::time::sleep(ROOM_WATCH_RETRY_DELAY).await;
            }
        }
    }
}

fn new_connection_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(12)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("mc_{suffix}")
}
