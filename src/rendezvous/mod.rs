//! Peer discovery through a shared key-value directory.
//!
//! Layout: `rooms/{roomId}/peers/{peerId}` holds the JSON-encoded
//! [`PeerRecord`](crate::types::PeerRecord) of every participant. Deleting
//! `rooms/{roomId}` is the authoritative "call ended" signal.

pub mod directory;
pub mod error;
pub mod memory;
pub mod rest;

pub use directory::{RendezvousDirectory, RoomEvent, RoomWatch};
pub use error::DirectoryError;
pub use memory::MemoryDirectory;
pub use rest::{RestDirectory, RestDirectoryConfig};

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Direct leaf children of a node, keyed by child name.
pub type Children = BTreeMap<String, String>;

/// Backing store of the directory. Paths are `/`-separated without a leading slash.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Writes a leaf, replacing whatever was at `path` before.
    async fn set(&self, path: &str, value: String) -> Result<(), DirectoryError>;

    /// Removes `path` and everything below it.
    async fn remove(&self, path: &str) -> Result<(), DirectoryError>;

    async fn children(&self, path: &str) -> Result<Children, DirectoryError>;

    /// Latest-value subscription to the children of `path`. The receiver
    /// starts out holding the current snapshot.
    async fn subscribe(&self, path: &str) -> Result<watch::Receiver<Children>, DirectoryError>;
}
