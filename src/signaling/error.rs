use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("relay did not acknowledge the connection within {0:?}")]
    OpenTimeout(Duration),
    #[error("identity {0} is already taken")]
    IdTaken(String),
    #[error("relay rejected the connection: {0}")]
    Server(String),
    #[error("could not encode message: {0}")]
    Encode(String),
    #[error("connection attempt was cancelled")]
    Cancelled,
    #[error("not connected")]
    NotConnected,
    #[error("gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
}

impl SignalingError {
    /// Failures that justify trying the fallback relay.
    pub fn is_relay_failure(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::OpenTimeout(_))
    }
}

impl From<anyhow::Error> for SignalingError {
    fn from(value: anyhow::Error) -> Self {
        Self::Transport(value.to_string())
    }
}
