//! Call manager for orchestrating call lifecycle.

use super::error::CallError;
use super::session::{CallDependencies, CallSession, CallSetup};
use crate::config::CallManagerConfig;
use crate::signaling::SignalingClient;
use crate::types::call::CallMedia;
use crate::types::events::SessionEvent;
use crate::types::peer::{LocalProfile, RoomId};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

/// A started (or starting) call together with its event stream.
pub type CallHandle = (CallSession, mpsc::UnboundedReceiver<SessionEvent>);

/// Owns the calls of one local participant. All calls share one relay
/// connection; it stays open while at least one of them is running.
pub struct CallManager {
    config: CallManagerConfig,
    deps: CallDependencies,
    profile: LocalProfile,
    /// Calls indexed by room.
    calls: RwLock<HashMap<RoomId, CallSession>>,
}

impl CallManager {
    pub fn new(
        config: CallManagerConfig,
        deps: CallDependencies,
        profile: LocalProfile,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            deps,
            profile,
            calls: RwLock::new(HashMap::new()),
        })
    }

    pub fn signaling(&self) -> &Arc<SignalingClient> {
        &self.deps.signaling
    }

    pub fn profile(&self) -> &LocalProfile {
        &self.profile
    }

    /// Registers a session for `setup` without starting it.
    pub async fn create_call(&self, setup: CallSetup) -> Result<CallHandle, CallError> {
        // Clean up ended calls before checking limits
        self.cleanup_ended_calls().await;

        let mut calls = self.calls.write().await;
        if calls.contains_key(&setup.room) {
            return Err(CallError::AlreadyExists(setup.room));
        }
        if calls.len() >= self.config.max_concurrent_calls {
            return Err(CallError::TooManyCalls(self.config.max_concurrent_calls));
        }

        let room = setup.room.clone();
        let (session, events) =
            CallSession::new(setup, self.deps.clone(), self.config.session.clone());
        calls.insert(room.clone(), session.clone());
        debug!(target: "Call", "Registered call in room {room} ({} active)", calls.len());
        Ok((session, events))
    }

    /// Creates a fresh room and calls into it. `remote_user` is the callee's
    /// application user id, used to withdraw their notification if the call
    /// never connects.
    pub async fn place_call(
        &self,
        media: CallMedia,
        remote_user: Option<String>,
    ) -> Result<CallHandle, CallError> {
        let room = RoomId::generate();
        let mut setup = CallSetup::outgoing(room.clone(), media).with_profile(self.profile.clone());
        setup.remote_user = remote_user;
        info!(target: "Call", "Placing {media:?} call in room {room}");
        self.start(setup).await
    }

    /// Joins a room shared out-of-band by the caller.
    pub async fn join_call(&self, room: RoomId, media: CallMedia) -> Result<CallHandle, CallError> {
        info!(target: "Call", "Joining {media:?} call in room {room}");
        let setup = CallSetup::incoming(room, media).with_profile(self.profile.clone());
        self.start(setup).await
    }

    async fn start(&self, setup: CallSetup) -> Result<CallHandle, CallError> {
        let (session, events) = self.create_call(setup).await?;
        session.start().await?;
        Ok((session, events))
    }

    pub async fn get_call(&self, room: &RoomId) -> Option<CallSession> {
        self.calls.read().await.get(room).cloned()
    }

    /// Calls that have not ended yet.
    pub async fn active_calls(&self) -> Vec<CallSession> {
        self.calls
            .read()
            .await
            .values()
            .filter(|c| !c.is_ended())
            .cloned()
            .collect()
    }

    pub async fn has_active_call(&self) -> bool {
        self.calls.read().await.values().any(|c| !c.is_ended())
    }

    /// Hangs up the call in `room` for both sides.
    pub async fn end_call(&self, room: &RoomId) -> Result<(), CallError> {
        let session = self
            .get_call(room)
            .await
            .ok_or_else(|| CallError::NotFound(room.clone()))?;
        session.hangup().await;
        self.calls.write().await.remove(room);
        Ok(())
    }

    /// Stops the call in `room` locally, leaving the room to the remote side.
    pub async fn stop_call(&self, room: &RoomId) -> Result<(), CallError> {
        let session = self
            .get_call(room)
            .await
            .ok_or_else(|| CallError::NotFound(room.clone()))?;
        session.stop().await;
        self.calls.write().await.remove(room);
        Ok(())
    }

    /// Remove ended calls from memory.
    pub async fn cleanup_ended_calls(&self) {
        let mut calls = self.calls.write().await;
        calls.retain(|_, session| !session.is_ended());
    }

    /// Stops every call. The relay connection closes with the last one.
    pub async fn shutdown(&self) {
        let sessions: Vec<CallSession> = self.calls.write().await.drain().map(|(_, s)| s).collect();
        if !sessions.is_empty() {
            info!(target: "Call", "Stopping {} call(s)", sessions.len());
        }
        for session in sessions {
            session.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RelayEndpoint, SignalingConfig};
    use crate::loopback::LoopbackRelay;
    use crate::media::LoopbackMediaEngine;
    use crate::rendezvous::{MemoryDirectory, RendezvousDirectory};
    use crate::types::call::EndReason;
    use std::time::Duration;

    fn deps(relay: &Arc<LoopbackRelay>, directory: &RendezvousDirectory) -> CallDependencies {
        let config = SignalingConfig {
            primary: RelayEndpoint::new("primary.test"),
            fallback: Some(RelayEndpoint::new("fallback.test")),
            ..Default::default()
        };
        CallDependencies {
            signaling: SignalingClient::new(config, relay.clone(), relay.clone()),
            directory: directory.clone(),
            media: Arc::new(LoopbackMediaEngine::new()),
            notifications: None,
        }
    }

    fn manager(max_calls: usize) -> (Arc<CallManager>, Arc<LoopbackRelay>, RendezvousDirectory) {
        let relay = Arc::new(LoopbackRelay::new());
        let directory = RendezvousDirectory::new(Arc::new(MemoryDirectory::new()));
        let config = CallManagerConfig {
            max_concurrent_calls: max_calls,
            ..Default::default()
        };
        let manager = CallManager::new(
            config,
            deps(&relay, &directory),
            LocalProfile::new("Ann", ""),
        );
        (manager, relay, directory)
    }

    async fn wait_connected(events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while let Some(event) = events.recv().await {
                if event == SessionEvent::Connected {
                    return;
                }
            }
            panic!("session ended without connecting");
        })
        .await
        .expect("not connected in time");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_call_limit() {
        let (manager, _relay, _directory) = manager(1);
        manager
            .create_call(CallSetup::outgoing(RoomId::from("r1"), CallMedia::Audio))
            .await
            .unwrap();

        let err = manager
            .create_call(CallSetup::outgoing(RoomId::from("r2"), CallMedia::Audio))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::TooManyCalls(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_room_rejected() {
        let (manager, _relay, _directory) = manager(2);
        let room = RoomId::from("r1");
        manager
            .create_call(CallSetup::outgoing(room.clone(), CallMedia::Audio))
            .await
            .unwrap();

        let err = manager
            .create_call(CallSetup::incoming(room.clone(), CallMedia::Audio))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::AlreadyExists(r) if r == room));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_calls_free_their_slot() {
        let (manager, _relay, _directory) = manager(1);
        let (first, _events) = manager.place_call(CallMedia::Audio, None).await.unwrap();
        assert_eq!(manager.active_calls().await.len(), 1);

        first.stop().await;
        assert!(!manager.has_active_call().await);
        manager.place_call(CallMedia::Video, None).await.unwrap();
        assert_eq!(manager.active_calls().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_unknown_call() {
        let (manager, _relay, _directory) = manager(1);
        let err = manager.end_call(&RoomId::from("nope")).await.unwrap_err();
        assert!(matches!(err, CallError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_place_and_join_across_managers() {
        let (caller, relay, directory) = manager(1);
        let callee = CallManager::new(
            CallManagerConfig::default(),
            deps(&relay, &directory),
            LocalProfile::new("Bo", "bo.png"),
        );

        let (outgoing, mut caller_events) = caller
            .place_call(CallMedia::Video, Some("bo".into()))
            .await
            .unwrap();
        let (incoming, mut callee_events) = callee
            .join_call(outgoing.room().clone(), CallMedia::Video)
            .await
            .unwrap();

        wait_connected(&mut caller_events).await;
        wait_connected(&mut callee_events).await;
        assert_eq!(
            outgoing.snapshot().remote.map(|r| r.display_name),
            Some("Bo".to_string())
        );

        caller.end_call(outgoing.room()).await.unwrap();
        let reason = incoming.ended().await;
        assert!(matches!(reason, EndReason::RemoteLeft | EndReason::RoomCleared));
        assert!(caller.get_call(outgoing.room()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_shared_until_last_call_stops() {
        let (manager, relay, _directory) = manager(2);
        let (first, _e1) = manager.place_call(CallMedia::Audio, None).await.unwrap();
        let (second, _e2) = manager.place_call(CallMedia::Audio, None).await.unwrap();
        assert_eq!(relay.connected_peers().len(), 1);
        assert_eq!(manager.signaling().active_leases(), 2);

        manager.stop_call(first.room()).await.unwrap();
        assert!(manager.signaling().is_open());

        manager.shutdown().await;
        assert!(second.is_ended());
        assert!(!manager.signaling().is_open());
        assert!(manager.active_calls().await.is_empty());
    }
}
