//! Call-related error types.

use crate::media::MediaError;
use crate::rendezvous::DirectoryError;
use crate::signaling::SignalingError;
use crate::types::call::EndReason;
use crate::types::peer::RoomId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no call in room {0}")]
    NotFound(RoomId),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("a call is already active in room {0}")]
    AlreadyExists(RoomId),

    #[error("call already started")]
    AlreadyStarted,

    #[error("max concurrent calls reached ({0})")]
    TooManyCalls(usize),

    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalingError),

    #[error("directory failed: {0}")]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("call ended: {0}")]
    Ended(EndReason),
}
