use super::{Children, DirectoryError, DirectoryStore};
use crate::types::peer::{PeerIdentity, PeerRecord, RoomId};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

/// What a [`RoomWatch`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// The other participants, self excluded, sorted by peer id.
    Peers(Vec<PeerRecord>),
    /// The room went away after we had been in it. Delivered once; the watch
    /// ends afterwards.
    Cleared,
}

/// Room-scoped view over a [`DirectoryStore`].
#[derive(Clone)]
pub struct RendezvousDirectory {
    store: Arc<dyn DirectoryStore>,
}

impl RendezvousDirectory {
    pub fn new(store: Arc<dyn DirectoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DirectoryStore> {
        &self.store
    }

    pub fn room_path(room: &RoomId) -> String {
        format!("rooms/{room}")
    }

    pub fn peers_path(room: &RoomId) -> String {
        format!("rooms/{room}/peers")
    }

    pub fn peer_path(room: &RoomId, peer_id: &str) -> String {
        format!("rooms/{room}/peers/{peer_id}")
    }

    /// Publishes `record` in the room. Re-joining overwrites the previous record.
    pub async fn join(&self, room: &RoomId, record: &PeerRecord) -> Result<(), DirectoryError> {
        let value = serde_json::to_string(record)?;
        self.store
            .set(&Self::peer_path(room, &record.peer_id), value)
            .await?;
        info!(target: "Rendezvous", "Joined room {room} as {}", record.peer_id);
        Ok(())
    }

    /// Authoritative leave deletes the whole room, which every other
    /// participant observes as the end of the call. Otherwise only our own
    /// record goes.
    pub async fn leave(
        &self,
        room: &RoomId,
        self_id: &PeerIdentity,
        authoritative: bool,
    ) -> Result<(), DirectoryError> {
        if authoritative {
            self.store.remove(&Self::room_path(room)).await?;
            info!(target: "Rendezvous", "Removed room {room}");
        } else {
            self.store
                .remove(&Self::peer_path(room, self_id.as_str()))
                .await?;
            info!(target: "Rendezvous", "Left room {room} as {self_id}");
        }
        Ok(())
    }

    /// One-shot read of the other participants.
    pub async fn peers(
        &self,
        room: &RoomId,
        self_id: &PeerIdentity,
    ) -> Result<Vec<PeerRecord>, DirectoryError> {
        let raw = self.store.children(&Self::peers_path(room)).await?;
        let excluded = HashSet::from([self_id.to_string()]);
        Ok(decode_peers(&raw, &excluded))
    }

    /// Lazily subscribes on the first [`RoomWatch::next`] call.
    pub fn watch(&self, room: &RoomId, self_id: PeerIdentity) -> RoomWatch {
        RoomWatch {
            store: self.store.clone(),
            path: Self::peers_path(room),
            self_id,
            retired: HashSet::new(),
            rx: None,
            self_seen: false,
            peer_seen: false,
            last: None,
            finished: false,
        }
    }
}

fn decode_peers(raw: &Children, excluded: &HashSet<String>) -> Vec<PeerRecord> {
    raw.iter()
        .filter(|(key, _)| !excluded.contains(key.as_str()))
        .filter_map(|(key, value)| match serde_json::from_str::<PeerRecord>(value) {
            Ok(mut record) => {
                if record.peer_id.is_empty() {
                    record.peer_id = key.clone();
                }
                Some(record)
            }
            Err(e) => {
                warn!(target: "Rendezvous", "Ignoring unreadable peer record {key}: {e}");
                None
            }
        })
        .collect()
}

/// Sequence of peer-list snapshots for one room.
///
/// Room-empty detection: once our own record has been seen, an empty room,
/// or a peer list that empties after having held someone, yields
/// [`RoomEvent::Cleared`] exactly once. Repeated empty snapshots after that
/// are not reported.
pub struct RoomWatch {
    store: Arc<dyn DirectoryStore>,
    path: String,
    self_id: PeerIdentity,
    /// Identities we published earlier under this watch; never reported as peers.
    retired: HashSet<String>,
    rx: Option<watch::Receiver<Children>>,
    self_seen: bool,
    peer_seen: bool,
    last: Option<Vec<PeerRecord>>,
    finished: bool,
}

impl RoomWatch {
    pub fn self_id(&self) -> &PeerIdentity {
        &self.self_id
    }

    /// Switches to a reissued identity. The previous one is retired so its
    /// lingering record is not mistaken for a remote peer.
    pub fn set_self_id(&mut self, self_id: PeerIdentity) {
        if self_id != self.self_id {
            let previous = std::mem::replace(&mut self.self_id, self_id);
            self.retired.insert(previous.to_string());
        }
    }

    /// Drops the subscription; the next `next()` resubscribes. Detection
    /// state is kept.
    pub fn restart(&mut self) {
        self.rx = None;
        self.last = None;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Waits for the next change. `Ok(None)` once the watch has ended.
    pub async fn next(&mut self) -> Result<Option<RoomEvent>, DirectoryError> {
        loop {
            if self.finished {
                return Ok(None);
            }

            let raw = match self.rx.as_mut() {
                None => {
                    let mut rx = self.store.subscribe(&self.path).await?;
                    let raw = rx.borrow_and_update().clone();
                    self.rx = Some(rx);
                    raw
                }
                Some(rx) => {
                    if rx.changed().await.is_err() {
                        debug!(target: "Rendezvous", "Store dropped the watch on {}", self.path);
                        self.finished = true;
                        return Ok(None);
                    }
                    rx.borrow_and_update().clone()
                }
            };

            if let Some(event) = self.observe(&raw) {
                return Ok(Some(event));
            }
        }
    }

    fn observe(&mut self, raw: &Children) -> Option<RoomEvent> {
        if raw.contains_key(self.self_id.as_str()) {
            self.self_seen = true;
        }

        let mut excluded = self.retired.clone();
        excluded.insert(self.self_id.to_string());
        let peers = decode_peers(raw, &excluded);
        if !peers.is_empty() {
            self.peer_seen = true;
        }

        if self.self_seen && (raw.is_empty() || (self.peer_seen && peers.is_empty())) {
            info!(target: "Rendezvous", "Room at {} cleared", self.path);
            self.finished = true;
            return Some(RoomEvent::Cleared);
        }

        if self.last.as_ref() == Some(&peers) {
            return None;
        }
        self.last = Some(peers.clone());
        Some(RoomEvent::Peers(peers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::MemoryDirectory;
    use std::time::Duration;

    fn record(id: &str) -> PeerRecord {
        PeerRecord::new(&PeerIdentity::from(id), id.to_uppercase(), "")
    }

    async fn next(watch: &mut RoomWatch) -> Option<RoomEvent> {
        tokio::time::timeout(Duration::from_secs(5), watch.next())
            .await
            .expect("watch stalled")
            .unwrap()
    }

    fn setup() -> (Arc<MemoryDirectory>, RendezvousDirectory, RoomId) {
        let store = Arc::new(MemoryDirectory::new());
        let directory = RendezvousDirectory::new(store.clone());
        (store, directory, RoomId::from("1699999999000-4321"))
    }

    #[tokio::test]
    async fn test_join_writes_record_and_is_idempotent() {
        let (store, directory, room) = setup();
        directory.join(&room, &record("a")).await.unwrap();
        directory.join(&room, &record("a")).await.unwrap();

        assert_eq!(
            store.paths(),
            vec!["rooms/1699999999000-4321/peers/a".to_string()]
        );
        let stored: PeerRecord =
            serde_json::from_str(&store.get("rooms/1699999999000-4321/peers/a").unwrap())
                .unwrap();
        assert_eq!(stored, record("a"));
    }

    #[tokio::test]
    async fn test_leave_authoritative_vs_self_only() {
        let (store, directory, room) = setup();
        directory.join(&room, &record("a")).await.unwrap();
        directory.join(&room, &record("b")).await.unwrap();

        directory
            .leave(&room, &PeerIdentity::from("a"), false)
            .await
            .unwrap();
        assert_eq!(
            directory.peers(&room, &PeerIdentity::from("x")).await.unwrap(),
            vec![record("b")]
        );

        directory
            .leave(&room, &PeerIdentity::from("b"), true)
            .await
            .unwrap();
        assert!(store.paths().is_empty());
    }

    #[tokio::test]
    async fn test_watch_reports_peers_then_clears_once() {
        let (store, directory, room) = setup();
        directory.join(&room, &record("a")).await.unwrap();
        let mut watch = directory.watch(&room, PeerIdentity::from("a"));

        assert_eq!(next(&mut watch).await, Some(RoomEvent::Peers(vec![])));

        directory.join(&room, &record("b")).await.unwrap();
        assert_eq!(
            next(&mut watch).await,
            Some(RoomEvent::Peers(vec![record("b")]))
        );

        store.remove(&RendezvousDirectory::room_path(&room)).await.unwrap();
        assert_eq!(next(&mut watch).await, Some(RoomEvent::Cleared));

        // Further empty snapshots are not reported again.
        directory.join(&room, &record("c")).await.unwrap();
        store.remove(&RendezvousDirectory::room_path(&room)).await.unwrap();
        assert_eq!(next(&mut watch).await, None);
        assert!(watch.is_finished());
    }

    #[tokio::test]
    async fn test_remote_leaving_clears_room() {
        let (_store, directory, room) = setup();
        directory.join(&room, &record("a")).await.unwrap();
        directory.join(&room, &record("b")).await.unwrap();
        let mut watch = directory.watch(&room, PeerIdentity::from("a"));
        assert_eq!(
            next(&mut watch).await,
            Some(RoomEvent::Peers(vec![record("b")]))
        );

        directory
            .leave(&room, &PeerIdentity::from("b"), false)
            .await
            .unwrap();
        assert_eq!(next(&mut watch).await, Some(RoomEvent::Cleared));
    }

    #[tokio::test]
    async fn test_empty_room_before_join_is_not_cleared() {
        let (_store, directory, room) = setup();
        let mut watch = directory.watch(&room, PeerIdentity::from("a"));
        assert_eq!(next(&mut watch).await, Some(RoomEvent::Peers(vec![])));

        directory.join(&room, &record("a")).await.unwrap();
        directory.join(&room, &record("b")).await.unwrap();
        assert_eq!(
            next(&mut watch).await,
            Some(RoomEvent::Peers(vec![record("b")]))
        );
    }

    #[tokio::test]
    async fn test_reissued_identity_is_not_a_peer() {
        let (_store, directory, room) = setup();
        directory.join(&room, &record("a")).await.unwrap();
        directory.join(&room, &record("b")).await.unwrap();
        let mut watch = directory.watch(&room, PeerIdentity::from("a"));
        assert_eq!(
            next(&mut watch).await,
            Some(RoomEvent::Peers(vec![record("b")]))
        );

        watch.set_self_id(PeerIdentity::from("a2"));
        directory.join(&room, &record("a2")).await.unwrap();
        directory.join(&room, &record("b2")).await.unwrap();
        assert_eq!(
            next(&mut watch).await,
            Some(RoomEvent::Peers(vec![record("b"), record("b2")]))
        );
    }

    #[tokio::test]
    async fn test_unreadable_records_are_skipped() {
        let (store, directory, room) = setup();
        store
            .set(&RendezvousDirectory::peer_path(&room, "junk"), "{oops".into())
            .await
            .unwrap();
        directory.join(&room, &record("b")).await.unwrap();

        assert_eq!(
            directory.peers(&room, &PeerIdentity::from("a")).await.unwrap(),
            vec![record("b")]
        );
    }
}
