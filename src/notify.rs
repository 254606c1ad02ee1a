//! Hooks into the out-of-band call notification channel.

use crate::rendezvous::DirectoryStore;
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use rand::Rng;
use std::sync::Arc;

pub const DEFAULT_NOTIFICATION_NODE: &str = "removeVideoCallNotification";

/// Tells the rest of the application that a ringing call went away.
#[async_trait]
pub trait NotificationBridge: Send + Sync {
    /// Withdraws the incoming-call notification shown on the receiver's side.
    async fn notify_remove_call(&self, receiver_id: &str) -> anyhow::Result<()>;

    /// Removes any removal markers addressed to the local user.
    async fn cleanup_self_notifications(&self, uid: &str) -> anyhow::Result<()>;
}

/// Bridge that writes removal markers into a [`DirectoryStore`] under
/// `{node}/{receiverId}/{autoId}`.
#[derive(Clone)]
pub struct DirectoryNotificationBridge {
    store: Arc<dyn DirectoryStore>,
    node: String,
}

impl DirectoryNotificationBridge {
    pub fn new(store: Arc<dyn DirectoryStore>) -> Self {
        Self::with_node(store, DEFAULT_NOTIFICATION_NODE)
    }

    pub fn with_node(store: Arc<dyn DirectoryStore>, node: impl Into<String>) -> Self {
        Self {
            store,
            node: node.into(),
        }
    }

    fn auto_id() -> String {
        let suffix: u32 = rand::rng().random_range(0..1_000_000);
        format!("{}{suffix:06}", Utc::now().timestamp_millis())
    }
}

#[async_trait]
impl NotificationBridge for DirectoryNotificationBridge {
    async fn notify_remove_call(&self, receiver_id: &str) -> anyhow::Result<()> {
        let auto_id = Self::auto_id();
        self.store
            .set(&format!("{}/{receiver_id}/{auto_id}", self.node), auto_id.clone())
            .await?;
        debug!(target: "Notify", "Posted call removal for {receiver_id}");
        Ok(())
    }

    async fn cleanup_self_notifications(&self, uid: &str) -> anyhow::Result<()> {
        self.store.remove(&format!("{}/{uid}", self.node)).await?;
        debug!(target: "Notify", "Cleared removal markers for {uid}");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Records every bridge call.
    #[derive(Default)]
    pub struct RecordingBridge {
        pub removed: Mutex<Vec<String>>,
        pub cleaned: Mutex<Vec<String>>,
    }

    impl RecordingBridge {
        pub fn removed(&self) -> Vec<String> {
            self.removed.lock().unwrap().clone()
        }

        pub fn cleaned(&self) -> Vec<String> {
            self.cleaned.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationBridge for RecordingBridge {
        async fn notify_remove_call(&self, receiver_id: &str) -> anyhow::Result<()> {
            self.removed.lock().unwrap().push(receiver_id.to_string());
            Ok(())
        }

        async fn cleanup_self_notifications(&self, uid: &str) -> anyhow::Result<()> {
            self.cleaned.lock().unwrap().push(uid.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::MemoryDirectory;

    #[tokio::test]
    async fn test_remove_call_writes_marker() {
        let store = Arc::new(MemoryDirectory::new());
        let bridge = DirectoryNotificationBridge::new(store.clone());

        bridge.notify_remove_call("bob").await.unwrap();

        let children = store
            .children("removeVideoCallNotification/bob")
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        let (key, value) = children.iter().next().unwrap();
        assert_eq!(key, value);
    }

    #[tokio::test]
    async fn test_cleanup_removes_own_markers_only() {
        let store = Arc::new(MemoryDirectory::new());
        let bridge = DirectoryNotificationBridge::with_node(store.clone(), "notes");

        bridge.notify_remove_call("alice").await.unwrap();
        bridge.notify_remove_call("bob").await.unwrap();
        bridge.cleanup_self_notifications("alice").await.unwrap();

        assert!(store.children("notes/alice").await.unwrap().is_empty());
        assert_eq!(store.children("notes/bob").await.unwrap().len(), 1);
    }
}
