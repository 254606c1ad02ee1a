use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side placed the call.
///
/// The outgoing side is the designated initiator: it creates the offer as soon
/// as the remote peer shows up in the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

impl CallDirection {
    pub fn is_initiator(self) -> bool {
        self == Self::Outgoing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMedia {
    Audio,
    #[default]
    Video,
}

impl CallMedia {
    pub fn has_video(self) -> bool {
        self == Self::Video
    }
}

/// Why a call session ended. Carried by the terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// `hangup()` was called locally.
    LocalHangup,
    /// `stop()` was called locally. The only non-authoritative end: the room is left intact.
    LocalStop,
    /// The remote peer sent LEAVE.
    RemoteLeft,
    /// The room was deleted or the remote record vanished after being observed.
    RoomCleared,
    /// ICE went to disconnected/failed and did not recover within the grace period.
    IceDisconnected,
    /// ICE never reached connected within the connect timeout.
    IceTimeout,
    /// Neither relay acknowledged the connection in time.
    RelayTimeout,
    /// The relay connection was lost and could not be restored.
    SignalingLost,
    /// The rendezvous directory could not be written.
    DirectoryUnavailable(String),
    NegotiationFailed(String),
    MediaUnavailable(String),
}

impl EndReason {
    /// Authoritative ends tear the whole room down and notify the remote.
    pub fn is_authoritative(&self) -> bool {
        !matches!(self, Self::LocalStop)
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangup => write!(f, "local hangup"),
            Self::LocalStop => write!(f, "local stop"),
            Self::RemoteLeft => write!(f, "remote left"),
            Self::RoomCleared => write!(f, "room cleared"),
            Self::IceDisconnected => write!(f, "ice disconnected"),
            Self::IceTimeout => write!(f, "ice connect timeout"),
            Self::RelayTimeout => write!(f, "relay open timeout"),
            Self::SignalingLost => write!(f, "signaling lost"),
            Self::DirectoryUnavailable(detail) => write!(f, "directory unavailable: {detail}"),
            Self::NegotiationFailed(detail) => write!(f, "negotiation failed: {detail}"),
            Self::MediaUnavailable(detail) => write!(f, "media unavailable: {detail}"),
        }
    }
}
