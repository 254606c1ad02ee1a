//! In-process relay that speaks the PeerJS wire protocol.
//!
//! Implements both [`TransportFactory`] and [`HttpClient`] so a
//! [`SignalingClient`](crate::signaling::SignalingClient) can run against it
//! unchanged. Used by the `simulate` command and throughout the tests; the
//! knobs (`set_unresponsive`, `reserve`, `drop_connection`, ...) reproduce the
//! failure modes a real relay shows.

use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use async_trait::async_trait;
use log::{debug, trace, warn};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

const EVENT_CHANNEL_CAPACITY: usize = 100;

struct Registration {
    connection: u64,
    tx: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct RelayState {
    sessions: HashMap<String, Registration>,
    next_connection: u64,
    issued: u64,
    provision_queue: VecDeque<String>,
    provisioning_down: bool,
    unresponsive: HashSet<String>,
    unreachable: HashSet<String>,
    attempts: HashMap<String, usize>,
    /// `(sender, type)` of every frame a client wrote.
    frames: Vec<(String, String)>,
}

#[derive(Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
}

fn lock(state: &Mutex<RelayState>) -> MutexGuard<'_, RelayState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identities handed out by the provisioning endpoint, in order.
    /// Once drained, ids are generated as `peer-0001`, `peer-0002`, ...
    pub fn queue_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.state)
            .provision_queue
            .extend(ids.into_iter().map(Into::into));
    }

    pub fn set_provisioning_available(&self, available: bool) {
        lock(&self.state).provisioning_down = !available;
    }

    /// An unresponsive host accepts sockets but never sends OPEN.
    pub fn set_unresponsive(&self, host: &str, unresponsive: bool) {
        let mut state = lock(&self.state);
        if unresponsive {
            state.unresponsive.insert(host.to_string());
        } else {
            state.unresponsive.remove(host);
        }
    }

    /// An unreachable host refuses sockets outright.
    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut state = lock(&self.state);
        if unreachable {
            state.unreachable.insert(host.to_string());
        } else {
            state.unreachable.remove(host);
        }
    }

    /// Number of sockets dialed against `host`.
    pub fn attempts(&self, host: &str) -> usize {
        lock(&self.state).attempts.get(host).copied().unwrap_or(0)
    }

    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = lock(&self.state).sessions.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Marks `peer_id` as in use so the next socket claiming it gets ID-TAKEN.
    pub fn reserve(&self, peer_id: &str) {
        let (tx, _rx) = mpsc::channel(1);
        let mut state = lock(&self.state);
        state.next_connection += 1;
        let connection = state.next_connection;
        state
            .sessions
            .insert(peer_id.to_string(), Registration { connection, tx });
    }

    /// Drops the relay side of `peer_id`'s socket, as a network failure would.
    pub fn drop_connection(&self, peer_id: &str) {
        let registration = lock(&self.state).sessions.remove(peer_id);
        if let Some(registration) = registration {
            debug!(target: "Loopback", "Dropping connection of {peer_id}");
            let _ = registration.tx.try_send(TransportEvent::Disconnected);
        }
    }

    /// Delivers a raw frame to `peer_id`.
    pub fn inject(&self, peer_id: &str, frame: &str) {
        let state = lock(&self.state);
        if let Some(registration) = state.sessions.get(peer_id) {
            let _ = registration
                .tx
                .try_send(TransportEvent::TextReceived(frame.to_string()));
        }
    }

    /// Message types written by `peer_id`, in order.
    pub fn frames_from(&self, peer_id: &str) -> Vec<String> {
        lock(&self.state)
            .frames
            .iter()
            .filter(|(from, _)| from == peer_id)
            .map(|(_, kind)| kind.clone())
            .collect()
    }

    pub fn heartbeats_from(&self, peer_id: &str) -> usize {
        self.frames_from(peer_id)
            .iter()
            .filter(|kind| kind.as_str() == "HEARTBEAT")
            .count()
    }
}

#[async_trait]
impl TransportFactory for LoopbackRelay {
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let host = host_of(url);
        let peer_id = query_param(url, "id")
            .ok_or_else(|| anyhow::anyhow!("socket url has no id: {url}"))?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let mut state = lock(&self.state);
        *state.attempts.entry(host.clone()).or_default() += 1;
        if state.unreachable.contains(&host) {
            return Err(anyhow::anyhow!("connection refused by {host}"));
        }

        state.next_connection += 1;
        let connection = state.next_connection;
        let transport = Arc::new(LoopbackTransport {
            state: self.state.clone(),
            peer_id: peer_id.clone(),
            connection,
            tx: tx.clone(),
        });

        let _ = tx.try_send(TransportEvent::Connected);
        if state.unresponsive.contains(&host) {
            trace!(target: "Loopback", "{host} is unresponsive, holding {peer_id}");
        } else if state.sessions.contains_key(&peer_id) {
            let _ = tx.try_send(TransportEvent::TextReceived(
                json!({ "type": "ID-TAKEN", "payload": { "msg": "ID is taken" } }).to_string(),
            ));
        } else {
            state.sessions.insert(
                peer_id.clone(),
                Registration {
                    connection,
                    tx: tx.clone(),
                },
            );
            let _ = tx.try_send(TransportEvent::TextReceived(
                json!({ "type": "OPEN" }).to_string(),
            ));
        }

        Ok((transport, rx))
    }
}

#[async_trait]
impl HttpClient for LoopbackRelay {
    async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let host = host_of(&request.url);
        let mut state = lock(&self.state);
        if state.provisioning_down
            || state.unresponsive.contains(&host)
            || state.unreachable.contains(&host)
        {
            return Err(anyhow::anyhow!("{host} is not answering"));
        }
        if request.method != "GET" || !request.url.contains("/peerjs/id") {
            return Ok(HttpResponse {
                status_code: 404,
                body: Vec::new(),
            });
        }

        let peer_id = match state.provision_queue.pop_front() {
            Some(peer_id) => peer_id,
            None => {
                state.issued += 1;
                format!("peer-{:04}", state.issued)
            }
        };
        Ok(HttpResponse {
            status_code: 200,
            body: peer_id.into_bytes(),
        })
    }
}

struct LoopbackTransport {
    state: Arc<Mutex<RelayState>>,
    peer_id: String,
    connection: u64,
    tx: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, text: &str) -> Result<(), anyhow::Error> {
        let mut state = lock(&self.state);
        let registered = state
            .sessions
            .get(&self.peer_id)
            .is_some_and(|r| r.connection == self.connection);
        if !registered {
            // Frames on a socket the relay never acknowledged go nowhere.
            return Ok(());
        }

        let mut frame: Value = serde_json::from_str(text)?;
        let kind = frame
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        state.frames.push((self.peer_id.clone(), kind.clone()));
        if kind == "HEARTBEAT" {
            return Ok(());
        }

        let Some(dst) = frame.get("dst").and_then(Value::as_str).map(str::to_string) else {
            warn!(target: "Loopback", "{} sent {kind} without dst", self.peer_id);
            return Ok(());
        };
        frame["src"] = Value::String(self.peer_id.clone());

        match state.sessions.get(&dst) {
            Some(target) => {
                let _ = target
                    .tx
                    .try_send(TransportEvent::TextReceived(frame.to_string()));
            }
            None => {
                debug!(target: "Loopback", "{dst} is not connected, expiring {kind}");
                let _ = self.tx.try_send(TransportEvent::TextReceived(
                    json!({ "type": "EXPIRE", "src": dst }).to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = lock(&self.state);
        let owns = state
            .sessions
            .get(&self.peer_id)
            .is_some_and(|r| r.connection == self.connection);
        if owns {
            state.sessions.remove(&self.peer_id);
        }
        let _ = self.tx.try_send(TransportEvent::Disconnected);
    }
}

fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', ':', '?'])
        .next()
        .unwrap_or_default()
        .to_string()
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key != name {
            return None;
        }
        urlencoding::decode(value).ok().map(|v| v.into_owned())
    })
}
