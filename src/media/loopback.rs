use super::{IceConnectionState, MediaEngine, MediaError, MediaEvent, PeerConnection};
use crate::types::call::CallMedia;
use crate::types::message::{IceCandidateRecord, SdpType, SessionDescriptor};
use async_trait::async_trait;
use log::{debug, trace};
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

const LOCAL_CANDIDATES: u16 = 2;

#[derive(Default)]
struct EngineState {
    capture_failure: Option<String>,
    manual_ice: bool,
    prepared: Option<CallMedia>,
    releases: usize,
    microphone_muted: bool,
    camera_enabled: bool,
    front_camera: bool,
    peer_connections: usize,
    rollbacks: usize,
    remote_candidates: Vec<IceCandidateRecord>,
    controllers: Vec<IceController>,
}

/// In-process media engine.
///
/// Peer connections generate syntactically plausible SDP and a couple of host
/// candidates, and by default walk ICE through `checking` to `connected` as
/// soon as both descriptions are applied. With [`manual_ice`](Self::manual_ice)
/// the ICE state is driven from the outside through [`IceController`].
#[derive(Clone, Default)]
pub struct LoopbackMediaEngine {
    state: Arc<Mutex<EngineState>>,
}

impl LoopbackMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn manual_ice(self) -> Self {
        self.state().manual_ice = true;
        self
    }

    /// Makes the next `prepare_local_media` fail, as if the user denied access.
    pub fn fail_capture(&self, reason: impl Into<String>) {
        self.state().capture_failure = Some(reason.into());
    }

    pub fn prepared_media(&self) -> Option<CallMedia> {
        self.state().prepared
    }

    pub fn releases(&self) -> usize {
        self.state().releases
    }

    pub fn peer_connections(&self) -> usize {
        self.state().peer_connections
    }

    /// Number of local offers discarded in favor of a remote one.
    pub fn rollbacks(&self) -> usize {
        self.state().rollbacks
    }

    /// Remote candidates in the order they were applied.
    pub fn remote_candidates(&self) -> Vec<IceCandidateRecord> {
        self.state().remote_candidates.clone()
    }

    pub fn microphone_muted(&self) -> bool {
        self.state().microphone_muted
    }

    pub fn camera_enabled(&self) -> bool {
        self.state().camera_enabled
    }

    pub fn front_camera(&self) -> bool {
        self.state().front_camera
    }

    /// ICE handle of the most recently created peer connection.
    pub fn ice(&self) -> Option<IceController> {
        self.state().controllers.last().cloned()
    }
}

#[async_trait]
impl MediaEngine for LoopbackMediaEngine {
    async fn prepare_local_media(&self, media: CallMedia) -> Result<(), MediaError> {
        let mut state = self.state();
        if let Some(reason) = state.capture_failure.take() {
            return Err(MediaError::CaptureUnavailable(reason));
        }
        state.prepared = Some(media);
        state.microphone_muted = false;
        state.camera_enabled = media.has_video();
        state.front_camera = true;
        debug!(target: "Media/Loopback", "Prepared {media:?} capture");
        Ok(())
    }

    async fn create_peer_connection(
        &self,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Box<dyn PeerConnection>, MediaError> {
        let controller = IceController {
            events: events.clone(),
        };
        let auto_ice = {
            let mut state = self.state();
            if state.prepared.is_none() {
                return Err(MediaError::CaptureUnavailable(
                    "local media not prepared".into(),
                ));
            }
            state.peer_connections += 1;
            state.controllers.push(controller);
            !state.manual_ice
        };

        Ok(Box::new(LoopbackPeerConnection {
            engine: self.clone(),
            events,
            session_id: rand::rng().random_range(1_000_000..10_000_000),
            local: None,
            remote: None,
            gathered: false,
            auto_ice,
            closed: false,
        }))
    }

    fn set_microphone_muted(&self, muted: bool) {
        self.state().microphone_muted = muted;
    }

    fn set_camera_enabled(&self, enabled: bool) {
        self.state().camera_enabled = enabled;
    }

    fn switch_camera(&self) {
        let mut state = self.state();
        state.front_camera = !state.front_camera;
    }

    async fn release_local_media(&self) {
        let mut state = self.state();
        state.prepared = None;
        state.releases += 1;
    }
}

/// Pushes ICE state changes into a loopback peer connection's event stream.
#[derive(Clone)]
pub struct IceController {
    events: mpsc::UnboundedSender<MediaEvent>,
}

impl IceController {
    pub fn set_state(&self, state: IceConnectionState) {
        let _ = self.events.send(MediaEvent::IceStateChanged(state));
    }

    pub fn fail_negotiation(&self, detail: impl Into<String>) {
        let _ = self.events.send(MediaEvent::NegotiationFailed(detail.into()));
    }
}

struct LoopbackPeerConnection {
    engine: LoopbackMediaEngine,
    events: mpsc::UnboundedSender<MediaEvent>,
    session_id: u32,
    local: Option<SessionDescriptor>,
    remote: Option<SessionDescriptor>,
    gathered: bool,
    auto_ice: bool,
    closed: bool,
}

impl LoopbackPeerConnection {
    fn sdp(&self, sdp_type: SdpType) -> String {
        let media = self.engine.state().prepared.unwrap_or_default();
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=rtpmap:111 opus/48000/2\r\n",
            self.session_id
        );
        if media.has_video() {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\na=rtpmap:96 VP8/90000\r\n");
        }
        let setup = match sdp_type {
            SdpType::Offer => "actpass",
            SdpType::Answer => "active",
        };
        sdp.push_str(&format!("a=setup:{setup}\r\n"));
        sdp
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed {
            return Err(MediaError::Closed);
        }
        Ok(())
    }

    fn validate(description: &SessionDescriptor, expected: SdpType) -> Result<(), MediaError> {
        if description.sdp_type != expected {
            return Err(MediaError::Negotiation(format!(
                "expected {} but got {}",
                expected.as_str(),
                description.sdp_type.as_str()
            )));
        }
        if !description.sdp.starts_with("v=0") {
            return Err(MediaError::Negotiation("malformed session description".into()));
        }
        Ok(())
    }

    fn gather(&mut self) {
        if self.gathered {
            return;
        }
        self.gathered = true;
        let base_port = 50_000 + (self.session_id % 10_000) as u16;
        for n in 0..LOCAL_CANDIDATES {
            let candidate = IceCandidateRecord {
                candidate: format!(
                    "candidate:{} 1 udp {} 127.0.0.1 {} typ host",
                    n + 1,
                    2_122_260_223u32 - u32::from(n),
                    base_port + n
                ),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            };
            let _ = self.events.send(MediaEvent::LocalCandidate(candidate));
        }
    }

    fn maybe_connect(&self) {
        if self.auto_ice && self.local.is_some() && self.remote.is_some() {
            let _ = self
                .events
                .send(MediaEvent::IceStateChanged(IceConnectionState::Checking));
            let _ = self
                .events
                .send(MediaEvent::IceStateChanged(IceConnectionState::Connected));
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeerConnection {
    async fn create_offer(&mut self) -> Result<SessionDescriptor, MediaError> {
        self.ensure_open()?;
        let offer = SessionDescriptor::offer(self.sdp(SdpType::Offer));
        self.local = Some(offer.clone());
        self.gather();
        Ok(offer)
    }

    async fn accept_offer(
        &mut self,
        offer: SessionDescriptor,
    ) -> Result<SessionDescriptor, MediaError> {
        self.ensure_open()?;
        Self::validate(&offer, SdpType::Offer)?;
        if matches!(&self.local, Some(local) if local.sdp_type == SdpType::Offer) {
            trace!(target: "Media/Loopback", "Rolling back local offer");
            self.engine.state().rollbacks += 1;
        }
        self.remote = Some(offer);
        let answer = SessionDescriptor::answer(self.sdp(SdpType::Answer));
        self.local = Some(answer.clone());
        self.gather();
        self.maybe_connect();
        Ok(answer)
    }

    async fn apply_answer(&mut self, answer: SessionDescriptor) -> Result<(), MediaError> {
        self.ensure_open()?;
        Self::validate(&answer, SdpType::Answer)?;
        if !matches!(&self.local, Some(local) if local.sdp_type == SdpType::Offer) {
            return Err(MediaError::Negotiation("no local offer to answer".into()));
        }
        self.remote = Some(answer);
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidateRecord,
    ) -> Result<(), MediaError> {
        self.ensure_open()?;
        if self.remote.is_none() {
            return Err(MediaError::Negotiation(
                "remote candidate before remote description".into(),
            ));
        }
        self.engine.state().remote_candidates.push(candidate);
        Ok(())
    }

    async fn close(&mut self) {
        if !std::mem::replace(&mut self.closed, true) {
            let _ = self
                .events
                .send(MediaEvent::IceStateChanged(IceConnectionState::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connection(
        engine: &LoopbackMediaEngine,
    ) -> (Box<dyn PeerConnection>, mpsc::UnboundedReceiver<MediaEvent>) {
        engine.prepare_local_media(CallMedia::Video).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (engine.create_peer_connection(tx).await.unwrap(), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MediaEvent>) -> Vec<MediaEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_offer_answer_connects() {
        let caller_engine = LoopbackMediaEngine::new();
        let callee_engine = LoopbackMediaEngine::new();
        let (mut caller, mut caller_rx) = connection(&caller_engine).await;
        let (mut callee, mut callee_rx) = connection(&callee_engine).await;

        let offer = caller.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=video"));
        let answer = callee.accept_offer(offer).await.unwrap();
        caller.apply_answer(answer).await.unwrap();

        let caller_events = drain(&mut caller_rx);
        assert_eq!(
            caller_events
                .iter()
                .filter(|e| matches!(e, MediaEvent::LocalCandidate(_)))
                .count(),
            2
        );
        assert_eq!(
            caller_events.last(),
            Some(&MediaEvent::IceStateChanged(IceConnectionState::Connected))
        );
        assert!(
            drain(&mut callee_rx)
                .contains(&MediaEvent::IceStateChanged(IceConnectionState::Connected))
        );
    }

    #[tokio::test]
    async fn test_accepting_offer_rolls_back_local_offer() {
        let engine = LoopbackMediaEngine::new();
        let (mut pc, _rx) = connection(&engine).await;
        let remote = LoopbackMediaEngine::new();
        let (mut other, _other_rx) = connection(&remote).await;

        pc.create_offer().await.unwrap();
        let remote_offer = other.create_offer().await.unwrap();
        let answer = pc.accept_offer(remote_offer).await.unwrap();

        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert_eq!(engine.rollbacks(), 1);
        assert_eq!(engine.peer_connections(), 1);
    }

    #[tokio::test]
    async fn test_candidates_need_remote_description() {
        let engine = LoopbackMediaEngine::new();
        let (mut pc, _rx) = connection(&engine).await;
        let candidate = IceCandidateRecord {
            candidate: "candidate:1 1 udp 1 10.0.0.1 4000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };

        assert!(pc.add_remote_candidate(candidate.clone()).await.is_err());

        pc.create_offer().await.unwrap();
        pc.apply_answer(SessionDescriptor::answer("v=0\r\n"))
            .await
            .unwrap();
        pc.add_remote_candidate(candidate.clone()).await.unwrap();
        assert_eq!(engine.remote_candidates(), vec![candidate]);
    }

    #[tokio::test]
    async fn test_malformed_answer_is_rejected() {
        let engine = LoopbackMediaEngine::new();
        let (mut pc, _rx) = connection(&engine).await;
        pc.create_offer().await.unwrap();

        let err = pc
            .apply_answer(SessionDescriptor::answer("garbage"))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Negotiation(_)));
    }

    #[tokio::test]
    async fn test_capture_failure_and_toggles() {
        let engine = LoopbackMediaEngine::new();
        engine.fail_capture("permission denied");
        assert_eq!(
            engine.prepare_local_media(CallMedia::Audio).await,
            Err(MediaError::CaptureUnavailable("permission denied".into()))
        );

        engine.prepare_local_media(CallMedia::Video).await.unwrap();
        assert!(engine.camera_enabled());
        engine.set_microphone_muted(true);
        engine.switch_camera();
        assert!(engine.microphone_muted());
        assert!(!engine.front_camera());

        engine.release_local_media().await;
        assert_eq!(engine.releases(), 1);
        assert_eq!(engine.prepared_media(), None);
    }
}
