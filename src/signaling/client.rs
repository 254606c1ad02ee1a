use super::error::SignalingError;
use super::keepalive::heartbeat_loop;
use crate::config::{RelayEndpoint, SignalingConfig};
use crate::http::{HttpClient, HttpRequest};
use crate::transport::{Transport, TransportEvent, TransportFactory, redact_query};
use crate::types::events::SignalingEvent;
use crate::types::message::SignalingMessage;
use crate::types::peer::PeerIdentity;
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const EVENT_CHANNEL_CAPACITY: usize = 100;
const TOKEN_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_LEN: usize = 20;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY_SECS: u64 = 30;

struct ActiveConnection {
    endpoint: RelayEndpoint,
    transport: Arc<dyn Transport>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    writer: JoinHandle<()>,
}

#[derive(Default)]
struct LinkState {
    peer_id: Option<PeerIdentity>,
    connection: Option<ActiveConnection>,
    /// Bumped whenever a connection is installed or torn down, so a reader
    /// task can tell whether the loss it observed is still current.
    epoch: u64,
    primary_failed: bool,
    /// True from `connect()` until the matching `Closed` event went out.
    link_active: bool,
}

struct OpenedConnection {
    endpoint: RelayEndpoint,
    peer_id: PeerIdentity,
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
}

type RecoveryFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

enum LossCause {
    IdTaken,
    TransportClosed,
}

/// Persistent connection to a PeerJS-compatible signaling relay.
///
/// All inbound traffic is parsed once and fanned out to subscribers as
/// [`SignalingEvent`]s. The client is shared through `Arc`; call sessions
/// hold a [`SignalingLease`] and the connection is closed when the last
/// lease is released.
pub struct SignalingClient {
    config: SignalingConfig,
    transport_factory: Arc<dyn TransportFactory>,
    http_client: Arc<dyn HttpClient>,
    events: broadcast::Sender<SignalingEvent>,
    state: Mutex<LinkState>,
    /// Bumped by `disconnect()`; in-flight connects and reconnects watch it.
    generation: watch::Sender<u64>,
    connect_gate: tokio::sync::Mutex<()>,
    is_connecting: AtomicBool,
    id_reissues: AtomicU32,
    leases: AtomicUsize,
}

impl SignalingClient {
    pub fn new(
        config: SignalingConfig,
        transport_factory: Arc<dyn TransportFactory>,
        http_client: Arc<dyn HttpClient>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (generation, _) = watch::channel(0);
        Arc::new(Self {
            config,
            transport_factory,
            http_client,
            events,
            state: Mutex::new(LinkState::default()),
            generation,
            connect_gate: tokio::sync::Mutex::new(()),
            is_connecting: AtomicBool::new(false),
            id_reissues: AtomicU32::new(0),
            leases: AtomicUsize::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.config
    }

    /// The identity the relay currently knows us by, while connected.
    pub fn peer_id(&self) -> Option<PeerIdentity> {
        let state = self.state();
        state.connection.as_ref().and(state.peer_id.clone())
    }

    pub fn is_open(&self) -> bool {
        self.state().connection.is_some()
    }

    pub fn is_connecting(&self) -> bool {
        self.is_connecting.load(Ordering::Relaxed)
    }

    /// Host of the relay the client is connected to.
    pub fn current_relay(&self) -> Option<String> {
        self.state()
            .connection
            .as_ref()
            .map(|c| c.endpoint.host.clone())
    }

    pub fn primary_failed(&self) -> bool {
        self.state().primary_failed
    }

    /// Opens the relay connection, or returns the current identity when it is
    /// already open. Concurrent callers are serialized onto the same attempt.
    pub async fn connect(self: &Arc<Self>) -> Result<PeerIdentity, SignalingError> {
        if let Some(peer_id) = self.peer_id() {
            return Ok(peer_id);
        }
        self.id_reissues.store(0, Ordering::SeqCst);
        self.state().link_active = true;

        let result = self.establish(None).await;
        match &result {
            Ok(_) | Err(SignalingError::Cancelled) => {}
            Err(e) => {
                error!("Failed to connect to signaling relay: {e}");
                self.fail_link(e.clone());
            }
        }
        result
    }

    /// Serializes, then queues the message for the connection's writer.
    /// Never fails synchronously; problems show up as `SignalingEvent::Error`.
    pub fn send(&self, message: SignalingMessage) {
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Signaling/Send", "Cannot encode {}: {e}", message.kind());
                self.emit_error(SignalingError::Encode(e.to_string()));
                return;
            }
        };

        let outbound = self
            .state()
            .connection
            .as_ref()
            .map(|c| c.outbound.clone());
        match outbound {
            Some(tx) if tx.send(frame).is_ok() => {
                debug!(target: "Signaling/Send", "Queued {}", message.kind());
            }
            _ => {
                warn!(target: "Signaling/Send", "Dropping {} while not connected", message.kind());
                self.emit_error(SignalingError::NotConnected);
            }
        }
    }

    /// Closes the connection and cancels heartbeat, reconnect and any
    /// in-flight connect. Safe to call any number of times.
    pub async fn disconnect(&self) {
        self.generation.send_modify(|g| *g += 1);
        let (connection, was_active) = {
            let mut state = self.state();
            state.epoch += 1;
            (
                state.connection.take(),
                std::mem::replace(&mut state.link_active, false),
            )
        };

        if let Some(connection) = connection {
            info!("Disconnecting from relay {}", connection.endpoint.host);
            close_connection(connection).await;
        }
        if was_active {
            let _ = self.events.send(SignalingEvent::Closed { expected: true });
        }
    }

    pub fn acquire(self: &Arc<Self>) -> SignalingLease {
        self.leases.fetch_add(1, Ordering::SeqCst);
        SignalingLease {
            client: self.clone(),
            released: AtomicBool::new(false),
        }
    }

    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    fn emit_error(&self, error: SignalingError) {
        let _ = self.events.send(SignalingEvent::Error(error));
    }

    fn fail_link(&self, error: SignalingError) {
        self.emit_error(error);
        let was_active = std::mem::replace(&mut self.state().link_active, false);
        if was_active {
            let _ = self.events.send(SignalingEvent::Closed { expected: false });
        }
    }

    async fn establish(
        self: &Arc<Self>,
        preset: Option<PeerIdentity>,
    ) -> Result<PeerIdentity, SignalingError> {
        let _gate = self.connect_gate.lock().await;
        if let Some(peer_id) = self.peer_id() {
            return Ok(peer_id);
        }

        self.is_connecting.store(true, Ordering::Relaxed);
        let _reset = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });

        let mut cancel = self.generation.subscribe();
        let started = *cancel.borrow_and_update();

        let (first, fallback) = if self.state().primary_failed {
            let relay = self
                .config
                .fallback
                .clone()
                .unwrap_or_else(|| self.config.primary.clone());
            (relay, None)
        } else {
            (self.config.primary.clone(), self.config.fallback.clone())
        };

        let attempt = self.open_endpoint(&first, preset.clone(), &mut cancel).await;
        let opened = match (attempt, fallback) {
            (Ok(opened), _) => opened,
            (Err(e), Some(fallback)) if e.is_relay_failure() => {
                warn!(
                    "Primary relay {} failed ({e}), switching to fallback {}",
                    first.host, fallback.host
                );
                self.state().primary_failed = true;
                self.open_endpoint(&fallback, preset, &mut cancel).await?
            }
            (Err(e), _) => return Err(e),
        };

        self.install(opened, started).await
    }

    async fn open_endpoint(
        &self,
        endpoint: &RelayEndpoint,
        preset: Option<PeerIdentity>,
        cancel: &mut watch::Receiver<u64>,
    ) -> Result<OpenedConnection, SignalingError> {
        let mut peer_id = match preset {
            Some(peer_id) => peer_id,
            None => self.provision_id(endpoint, cancel).await?,
        };

        loop {
            match self.open_once(endpoint, &peer_id, cancel).await {
                Err(SignalingError::IdTaken(_))
                    if self.id_reissues.fetch_add(1, Ordering::SeqCst)
                        < self.config.max_id_reissues =>
                {
                    let fresh = PeerIdentity::generate();
                    warn!(
                        "Identity {peer_id} is taken on {}, retrying as {fresh}",
                        endpoint.host
                    );
                    peer_id = fresh;
                }
                other => return other,
            }
        }
    }

    /// Asks the relay for an identity; any failure falls back to a local one.
    async fn provision_id(
        &self,
        endpoint: &RelayEndpoint,
        cancel: &mut watch::Receiver<u64>,
    ) -> Result<PeerIdentity, SignalingError> {
        let url = endpoint.id_url(Utc::now().timestamp_millis());
        let request = self.http_client.execute(HttpRequest::get(url));
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.config.open_timeout, request) => outcome,
            _ = cancel.changed() => return Err(SignalingError::Cancelled),
        };

        match outcome {
            Ok(Ok(response)) if response.is_success() => match response.body_string() {
                Ok(body) if !body.trim().is_empty() => {
                    let peer_id = PeerIdentity::new(body.trim());
                    debug!("Relay {} provisioned identity {peer_id}", endpoint.host);
                    return Ok(peer_id);
                }
                Ok(_) => warn!("Relay {} returned an empty identity", endpoint.host),
                Err(e) => warn!("Relay {} returned an unreadable identity: {e}", endpoint.host),
            },
            Ok(Ok(response)) => warn!(
                "Identity provisioning on {} failed with status {}",
                endpoint.host, response.status_code
            ),
            Ok(Err(e)) => warn!("Identity provisioning on {} failed: {e}", endpoint.host),
            Err(_) => warn!("Identity provisioning on {} timed out", endpoint.host),
        }
        Ok(PeerIdentity::generate())
    }

    async fn open_once(
        &self,
        endpoint: &RelayEndpoint,
        peer_id: &PeerIdentity,
        cancel: &mut watch::Receiver<u64>,
    ) -> Result<OpenedConnection, SignalingError> {
        let url = endpoint.socket_url(&self.config.key, peer_id.as_str(), &random_token());
        let deadline = Instant::now() + self.config.open_timeout;
        debug!("Opening relay socket {}", redact_query(&url));

        let created = tokio::select! {
            created = tokio::time::timeout_at(deadline, self.transport_factory.create_transport(&url)) => created,
            _ = cancel.changed() => return Err(SignalingError::Cancelled),
        };
        let (transport, mut events) = match created {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("Could not reach relay {}: {e}", endpoint.host);
                return Err(e.into());
            }
            Err(_) => {
                warn!("Relay {} did not accept the socket in time", endpoint.host);
                return Err(SignalingError::OpenTimeout(self.config.open_timeout));
            }
        };

        let acknowledged = tokio::select! {
            ack = tokio::time::timeout_at(deadline, wait_for_open(&mut events)) => ack,
            _ = cancel.changed() => Ok(Err(SignalingError::Cancelled)),
        };
        match acknowledged {
            Ok(Ok(())) => Ok(OpenedConnection {
                endpoint: endpoint.clone(),
                peer_id: peer_id.clone(),
                transport,
                events,
            }),
            Ok(Err(e)) => {
                transport.disconnect().await;
                Err(match e {
                    SignalingError::IdTaken(_) => SignalingError::IdTaken(peer_id.to_string()),
                    other => other,
                })
            }
            Err(_) => {
                warn!(
                    "Relay {} did not acknowledge within {:?}",
                    endpoint.host, self.config.open_timeout
                );
                transport.disconnect().await;
                Err(SignalingError::OpenTimeout(self.config.open_timeout))
            }
        }
    }

    async fn install(
        self: &Arc<Self>,
        opened: OpenedConnection,
        started: u64,
    ) -> Result<PeerIdentity, SignalingError> {
        let OpenedConnection {
            endpoint,
            peer_id,
            transport,
            events,
        } = opened;

        let cancelled = {
            let mut state = self.state();
            if *self.generation.borrow() != started {
                true
            } else {
                state.epoch += 1;
                let epoch = state.epoch;
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

                let writer = tokio::spawn(write_loop(
                    transport.clone(),
                    outbound_rx,
                    self.events.clone(),
                ));
                tokio::spawn(heartbeat_loop(
                    outbound_tx.clone(),
                    self.config.heartbeat_interval,
                    shutdown_rx.clone(),
                ));
                tokio::spawn(self.clone().read_loop(epoch, events, shutdown_rx));

                state.connection = Some(ActiveConnection {
                    endpoint: endpoint.clone(),
                    transport: transport.clone(),
                    outbound: outbound_tx,
                    shutdown: shutdown_tx,
                    writer,
                });
                state.peer_id = Some(peer_id.clone());
                state.link_active = true;
                false
            }
        };

        if cancelled {
            debug!("Connection to {} finished after disconnect, closing it", endpoint.host);
            transport.disconnect().await;
            return Err(SignalingError::Cancelled);
        }

        info!("Connected to relay {} as {peer_id}", endpoint.host);
        let _ = self.events.send(SignalingEvent::Open {
            peer_id: peer_id.clone(),
        });
        Ok(peer_id)
    }

    async fn read_loop(
        self: Arc<Self>,
        epoch: u64,
        mut events: mpsc::Receiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let cause = loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                event = events.recv() => match event {
                    Some(TransportEvent::TextReceived(text)) => match SignalingMessage::parse(&text) {
                        Ok(SignalingMessage::IdTaken) => break LossCause::IdTaken,
                        Ok(message @ (SignalingMessage::Heartbeat | SignalingMessage::Open)) => {
                            trace!(target: "Signaling/Recv", "Ignoring {}", message.kind());
                        }
                        Ok(message) => {
                            debug!(target: "Signaling/Recv", "<-- {}", message.kind());
                            let _ = self.events.send(SignalingEvent::Message(message));
                        }
                        Err(e) => {
                            warn!(target: "Signaling/Recv", "Dropping malformed relay frame: {e}");
                        }
                    },
                    Some(TransportEvent::Connected) => {}
                    Some(TransportEvent::Disconnected) | None => break LossCause::TransportClosed,
                }
            }
        };
        self.handle_loss(epoch, cause).await;
    }

    /// Boxed so the reader task spawned by `install` does not name its own future type.
    fn handle_loss(self: Arc<Self>, epoch: u64, cause: LossCause) -> RecoveryFuture {
        Box::pin(async move {
            let (connection, peer_id) = {
                let mut state = self.state();
                if state.epoch != epoch {
                    return;
                }
                state.epoch += 1;
                (state.connection.take(), state.peer_id.clone())
            };
            if let Some(connection) = connection {
                close_connection(connection).await;
            }

            match cause {
                LossCause::IdTaken => {
                    let attempt = self.id_reissues.fetch_add(1, Ordering::SeqCst) + 1;
                    let taken = peer_id.map(|p| p.to_string()).unwrap_or_default();
                    if attempt > self.config.max_id_reissues {
                        error!("Identity {taken} taken again, giving up after {attempt} reissues");
                        self.fail_link(SignalingError::IdTaken(taken));
                        return;
                    }
                    let fresh = PeerIdentity::generate();
                    warn!("Relay reported {taken} as taken, reconnecting as {fresh}");
                    match self.establish(Some(fresh)).await {
                        Ok(_) | Err(SignalingError::Cancelled) => {}
                        Err(e) => self.fail_link(e),
                    }
                }
                LossCause::TransportClosed => {
                    self.emit_error(SignalingError::Transport(
                        "relay connection lost".to_string(),
                    ));
                    self.reconnect(peer_id).await;
                }
            }
        })
    }

    async fn reconnect(self: &Arc<Self>, peer_id: Option<PeerIdentity>) {
        let mut cancel = self.generation.subscribe();
        cancel.borrow_and_update();
        let max_attempts = self.config.max_reconnect_attempts;

        for attempt in 1..=max_attempts {
            let delay = Duration::from_secs((u64::from(attempt) * 2).min(MAX_RECONNECT_DELAY_SECS));
            warn!(
                "Relay connection lost, reconnecting in {delay:?} (attempt {attempt}/{max_attempts})"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.changed() => {
                    debug!("Reconnect cancelled by disconnect");
                    return;
                }
            }

            match self.establish(peer_id.clone()).await {
                Ok(peer_id) => {
                    info!("Reconnected to relay as {peer_id}");
                    return;
                }
                Err(SignalingError::Cancelled) => return,
                Err(e) => warn!("Reconnect attempt {attempt} failed: {e}"),
            }
        }

        error!("Giving up on the relay after {max_attempts} reconnect attempts");
        self.fail_link(SignalingError::ReconnectExhausted(max_attempts));
    }
}

/// A claim on a shared [`SignalingClient`]. Releasing the last outstanding
/// lease disconnects the client.
pub struct SignalingLease {
    client: Arc<SignalingClient>,
    released: AtomicBool,
}

impl SignalingLease {
    pub fn client(&self) -> &Arc<SignalingClient> {
        &self.client
    }

    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.client.leases.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("Last signaling lease released");
            self.client.disconnect().await;
        }
    }
}

impl Drop for SignalingLease {
    fn drop(&mut self) {
        // Dropping without `release()` gives the claim back but leaves the
        // connection open; there is no runtime to await the disconnect on.
        if !*self.released.get_mut() {
            self.client.leases.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

async fn wait_for_open(events: &mut mpsc::Receiver<TransportEvent>) -> Result<(), SignalingError> {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => trace!("Socket connected, waiting for OPEN"),
            TransportEvent::TextReceived(text) => match SignalingMessage::parse(&text) {
                Ok(SignalingMessage::Open) => return Ok(()),
                Ok(SignalingMessage::IdTaken) => {
                    return Err(SignalingError::IdTaken(String::new()));
                }
                Ok(SignalingMessage::Error { message }) => {
                    return Err(SignalingError::Server(message));
                }
                Ok(other) => debug!("Ignoring {} before OPEN", other.kind()),
                Err(e) => warn!("Dropping malformed relay frame: {e}"),
            },
            TransportEvent::Disconnected => break,
        }
    }
    Err(SignalingError::Transport(
        "connection closed before OPEN".to_string(),
    ))
}

async fn write_loop(
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: broadcast::Sender<SignalingEvent>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = transport.send(&frame).await {
            warn!(target: "Signaling/Send", "Failed to write frame: {e}");
            let _ = events.send(SignalingEvent::Error(SignalingError::Transport(
                e.to_string(),
            )));
        }
    }
}

/// Stops the connection's tasks, lets the writer drain what is already
/// queued, then closes the socket.
async fn close_connection(connection: ActiveConnection) {
    let ActiveConnection {
        transport,
        outbound,
        shutdown,
        writer,
        ..
    } = connection;

    let _ = shutdown.send(true);
    drop(outbound);
    let writer_abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!("Writer did not drain in time");
        writer_abort.abort();
    }
    transport.disconnect().await;
}

fn random_token() -> String {
    let mut rng = rand::rng();
    (0..TOKEN_LEN)
        .map(|_| TOKEN_CHARS[rng.random_range(0..TOKEN_CHARS.len())] as char)
        .collect()
}
