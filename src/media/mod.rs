//! Seam between call negotiation and the platform WebRTC stack.
//!
//! The session only ever drives one [`PeerConnection`] per call. Rendering and
//! capture live behind [`MediaEngine`]; the crate ships an in-process
//! [`loopback`] engine for simulation and tests.

pub mod loopback;

use crate::types::call::CallMedia;
use crate::types::message::{IceCandidateRecord, SessionDescriptor};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

pub use loopback::{IceController, LoopbackMediaEngine};

/// ICE connection state as reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Media can flow.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    /// Connectivity was lost or never established; may still recover.
    pub fn is_interrupted(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// Asynchronous notifications from a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LocalCandidate(IceCandidateRecord),
    IceStateChanged(IceConnectionState),
    NegotiationFailed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("local media unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("peer connection is closed")]
    Closed,
}

/// Local capture plus peer connection factory.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Acquires microphone (and camera for video calls).
    async fn prepare_local_media(&self, media: CallMedia) -> Result<(), MediaError>;

    /// Creates the single peer connection of a call. Local candidates, ICE
    /// state changes and asynchronous failures are reported on `events`.
    async fn create_peer_connection(
        &self,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Box<dyn PeerConnection>, MediaError>;

    fn set_microphone_muted(&self, muted: bool);

    fn set_camera_enabled(&self, enabled: bool);

    /// Flips between front and back camera.
    fn switch_camera(&self);

    async fn release_local_media(&self);
}

#[async_trait]
pub trait PeerConnection: Send {
    /// Creates and applies a local offer.
    async fn create_offer(&mut self) -> Result<SessionDescriptor, MediaError>;

    /// Applies a remote offer and returns the local answer. A pending local
    /// offer is rolled back first.
    async fn accept_offer(
        &mut self,
        offer: SessionDescriptor,
    ) -> Result<SessionDescriptor, MediaError>;

    async fn apply_answer(&mut self, answer: SessionDescriptor) -> Result<(), MediaError>;

    /// Only valid once a remote description is set.
    async fn add_remote_candidate(&mut self, candidate: IceCandidateRecord)
    -> Result<(), MediaError>;

    async fn close(&mut self);
}
