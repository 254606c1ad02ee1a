use crate::calls::state::CallSessionState;
use crate::signaling::error::SignalingError;
use crate::types::call::EndReason;
use crate::types::message::SignalingMessage;
use crate::types::peer::{PeerIdentity, PeerRecord};

/// Events broadcast by the signaling client to every subscriber.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// The relay acknowledged the connection. Emitted again with a new
    /// identity after an ID-TAKEN reissue or a reconnect.
    Open { peer_id: PeerIdentity },
    Message(SignalingMessage),
    /// A non-fatal failure, such as a send that could not be written.
    Error(SignalingError),
    /// The connection is gone for good. `expected` is true when it was
    /// closed through `disconnect()`.
    Closed { expected: bool },
}

/// Lifecycle events of one call session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(CallSessionState),
    PeerJoined(PeerRecord),
    Connected,
    /// Terminal. Emitted exactly once per session.
    Ended(EndReason),
}
