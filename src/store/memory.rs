//! In-memory [`DocumentStore`] used by tests and local development.

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{DocEvent, DocumentStore, StoreResult, Subscription};

#[derive(Default)]
struct Inner {
    documents: DashMap<String, Value>,
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<DocEvent>>>,
}

impl Inner {
    /// Fan an event out to every live subscriber of `key`, dropping the
    /// senders whose receiving side has gone away.
    fn publish(&self, key: &str, event: DocEvent) {
        let Some(mut entry) = self.subscribers.get_mut(key) else {
            return;
        };
        entry.retain(|sender| sender.send(event.clone()).is_ok());
    }
}

/// DashMap-backed store delivering subscription events in write order.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently held. Test helper.
    pub fn len(&self) -> usize {
        self.inner.documents.len()
    }

    /// Whether the store holds no documents. Test helper.
    pub fn is_empty(&self) -> bool {
        self.inner.documents.is_empty()
    }

    /// Synchronous read used by test assertions.
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.inner.documents.get(key).map(|entry| entry.clone())
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'static, StoreResult<Option<Value>>> {
        let inner = self.inner.clone();
        let key = key.to_string();
        Box::pin(async move { Ok(inner.documents.get(&key).map(|entry| entry.clone())) })
    }

    fn set(&self, key: &str, value: Value) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let key = key.to_string();
        Box::pin(async move {
            inner.documents.insert(key.clone(), value.clone());
            inner.publish(&key, DocEvent::Updated(value));
            Ok(())
        })
    }

    fn update(&self, key: &str, partial: Value) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let key = key.to_string();
        Box::pin(async move {
            let merged = {
                let mut entry = inner
                    .documents
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Default::default()));
                merge_shallow(entry.value_mut(), partial);
                entry.clone()
            };
            inner.publish(&key, DocEvent::Updated(merged));
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let key = key.to_string();
        Box::pin(async move {
            if inner.documents.remove(&key).is_some() {
                inner.publish(&key, DocEvent::Deleted);
            }
            Ok(())
        })
    }

    fn subscribe(&self, key: &str) -> BoxFuture<'static, StoreResult<Subscription>> {
        let inner = self.inner.clone();
        let key = key.to_string();
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Some(current) = inner.documents.get(&key) {
                // Existing content is the first event a subscriber sees.
                let _ = tx.send(DocEvent::Updated(current.clone()));
            }
            inner.subscribers.entry(key.clone()).or_default().push(tx);
            debug!(%key, "memory store subscription registered");
            Ok(Subscription::new(rx))
        })
    }
}

/// Merge the top-level fields of `partial` into `target`, replacing `target`
/// entirely when either side is not a JSON object.
fn merge_shallow(target: &mut Value, partial: Value) {
    match (target.as_object_mut(), partial) {
        (Some(target_map), Value::Object(partial_map)) => {
            for (field, value) in partial_map {
                target_map.insert(field, value);
            }
        }
        (_, other) => *target = other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryStore::new();
        store.set("a", json!({"x": 1})).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn update_merges_top_level_fields() {
        let store = MemoryStore::new();
        store.set("a", json!({"x": 1, "y": 2})).await.unwrap();
        store.update("a", json!({"y": 3, "z": 4})).await.unwrap();
        assert_eq!(
            store.get("a").await.unwrap(),
            Some(json!({"x": 1, "y": 3, "z": 4}))
        );
    }

    #[tokio::test]
    async fn subscriber_sees_existing_content_first_then_changes() {
        let store = MemoryStore::new();
        store.set("a", json!({"v": 1})).await.unwrap();

        let mut sub = store.subscribe("a").await.unwrap();
        assert_eq!(sub.next_event().await, Some(DocEvent::Updated(json!({"v": 1}))));

        store.set("a", json!({"v": 2})).await.unwrap();
        assert_eq!(sub.next_event().await, Some(DocEvent::Updated(json!({"v": 2}))));
    }

    #[tokio::test]
    async fn delete_notifies_subscribers_once_and_only_when_present() {
        let store = MemoryStore::new();
        store.set("a", json!({})).await.unwrap();
        let mut sub = store.subscribe("a").await.unwrap();
        assert!(matches!(sub.next_event().await, Some(DocEvent::Updated(_))));

        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert_eq!(sub.try_next(), Some(DocEvent::Deleted));
        assert_eq!(sub.try_next(), None);
    }

    #[tokio::test]
    async fn subscribing_to_missing_document_is_silent_until_first_write() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("a").await.unwrap();
        assert_eq!(sub.try_next(), None);

        store.set("a", json!({"v": 1})).await.unwrap();
        assert_eq!(sub.try_next(), Some(DocEvent::Updated(json!({"v": 1}))));
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned_on_next_publish() {
        let store = MemoryStore::new();
        store.set("a", json!({})).await.unwrap();
        let sub = store.subscribe("a").await.unwrap();
        drop(sub);

        store.set("a", json!({"v": 2})).await.unwrap();
        let remaining = store
            .inner
            .subscribers
            .get("a")
            .map(|subs| subs.len())
            .unwrap_or(0);
        assert_eq!(remaining, 0);
    }
}
