pub mod call;
pub mod events;
pub mod message;
pub mod peer;

pub use call::{CallDirection, CallMedia, EndReason};
pub use events::{SessionEvent, SignalingEvent};
pub use message::{IceCandidateRecord, ProtocolError, SdpType, SessionDescriptor, SignalingMessage};
pub use peer::{LocalProfile, PeerIdentity, PeerRecord, RoomId};
