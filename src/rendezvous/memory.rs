use super::{Children, DirectoryError, DirectoryStore};
use async_trait::async_trait;
use dashmap::DashMap;
use log::trace;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Process-local directory. Several sessions sharing one instance behave like
/// clients of the same hosted database.
#[derive(Default)]
pub struct MemoryDirectory {
    entries: Mutex<BTreeMap<String, String>>,
    watchers: DashMap<String, watch::Sender<Children>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.entries().get(path).cloned()
    }

    /// Every leaf path currently stored, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    fn publish(&self, entries: &BTreeMap<String, String>) {
        for watcher in self.watchers.iter() {
            let snapshot = children_of(entries, watcher.key());
            watcher.value().send_if_modified(|current| {
                if *current == snapshot {
                    return false;
                }
                *current = snapshot;
                true
            });
        }
        self.watchers.retain(|_, tx| !tx.is_closed());
    }
}

fn subtree_prefix(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

fn children_of(entries: &BTreeMap<String, String>, path: &str) -> Children {
    let prefix = subtree_prefix(path);
    entries
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter_map(|(key, value)| {
            let child = &key[prefix.len()..];
            (!child.contains('/')).then(|| (child.to_string(), value.clone()))
        })
        .collect()
}

fn remove_subtree(entries: &mut BTreeMap<String, String>, path: &str) -> usize {
    let prefix = subtree_prefix(path);
    let before = entries.len();
    entries.retain(|key, _| key != path && !key.starts_with(&prefix));
    before - entries.len()
}

#[async_trait]
impl DirectoryStore for MemoryDirectory {
    async fn set(&self, path: &str, value: String) -> Result<(), DirectoryError> {
        let mut entries = self.entries();
        remove_subtree(&mut entries, path);
        entries.insert(path.to_string(), value);
        trace!(target: "Directory/Memory", "set {path}");
        self.publish(&entries);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), DirectoryError> {
        let mut entries = self.entries();
        let removed = remove_subtree(&mut entries, path);
        trace!(target: "Directory/Memory", "remove {path} ({removed} leaves)");
        if removed > 0 {
            self.publish(&entries);
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Children, DirectoryError> {
        Ok(children_of(&self.entries(), path))
    }

    async fn subscribe(&self, path: &str) -> Result<watch::Receiver<Children>, DirectoryError> {
        let entries = self.entries();
        let watcher = self
            .watchers
            .entry(path.to_string())
            .or_insert_with(|| watch::channel(children_of(&entries, path)).0);
        Ok(watcher.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_children_are_direct_leaves() {
        let dir = MemoryDirectory::new();
        dir.set("rooms/r1/peers/a", "A".into()).await.unwrap();
        dir.set("rooms/r1/peers/b", "B".into()).await.unwrap();
        dir.set("rooms/r10/peers/c", "C".into()).await.unwrap();
        dir.set("rooms/r1/peers/b/nested", "N".into()).await.unwrap();

        let children = dir.children("rooms/r1/peers").await.unwrap();
        assert_eq!(children.keys().collect::<Vec<_>>(), vec!["a"]);
        assert!(dir.children("rooms/none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_deletes_subtree() {
        let dir = MemoryDirectory::new();
        dir.set("rooms/r1/peers/a", "A".into()).await.unwrap();
        dir.set("rooms/r1/peers/b", "B".into()).await.unwrap();
        dir.set("rooms/r2/peers/c", "C".into()).await.unwrap();

        dir.remove("rooms/r1").await.unwrap();
        assert_eq!(dir.paths(), vec!["rooms/r2/peers/c".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribe_sees_latest_value() {
        let dir = MemoryDirectory::new();
        dir.set("rooms/r1/peers/a", "A".into()).await.unwrap();

        let mut rx = dir.subscribe("rooms/r1/peers").await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);

        dir.set("rooms/r1/peers/b", "B".into()).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 2);

        // Writes elsewhere do not wake the watcher.
        dir.set("rooms/other/peers/x", "X".into()).await.unwrap();
        assert!(!rx.has_changed().unwrap());

        dir.remove("rooms/r1").await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_empty());
    }
}
