//! Peer-to-peer audio/video calls brokered by a PeerJS-compatible relay and
//! a shared key-value rendezvous directory.

pub mod calls;
pub mod config;
pub mod http;
pub mod loopback;
pub mod media;
pub mod notify;
pub mod rendezvous;
pub mod signaling;
pub mod transport;
pub mod types;

pub use calls::{CallDependencies, CallError, CallManager, CallSession, CallSetup};
pub use config::{CallManagerConfig, CallSessionConfig, RelayEndpoint, SignalingConfig};
pub use signaling::{SignalingClient, SignalingError};
