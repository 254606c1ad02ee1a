//! Connection to the signaling relay.
//!
//! [`SignalingClient`] allocates an identity, keeps the relay socket alive
//! with heartbeats, recovers from ID-TAKEN and dropped sockets, and falls back
//! to a secondary relay once when the primary does not acknowledge in time.

pub mod client;
pub mod error;
mod keepalive;

pub use client::{SignalingClient, SignalingLease};
pub use error::SignalingError;
