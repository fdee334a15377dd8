//! Subscription-based detection of removal and external termination.
//!
//! The monitor watches two documents: the participant's own record (whose
//! deletion means the presenter kicked them) and the session record (whose
//! timer fields feed the follower and whose `completed` status forces the
//! local game into its terminal state). Both subscriptions are forwarder
//! tasks torn down together through one handle.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::documents::{SessionDoc, SessionStatus};
use crate::store::{DocEvent, DocumentStore, StoreResult};

/// Notification delivered to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// The session document changed; carries the parsed content.
    SessionUpdated(SessionDoc),
    /// The presenter completed the session externally.
    SessionCompleted,
    /// The participant's record was deleted: kicked. Emitted at most once
    /// per monitor, and never for the initial existence notification.
    Kicked,
}

/// Live monitor over the participant and session documents.
pub struct PresenceMonitor {
    events: mpsc::UnboundedReceiver<PresenceEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl PresenceMonitor {
    /// Subscribe to both documents and start the forwarder tasks.
    pub async fn spawn(
        store: Arc<dyn DocumentStore>,
        session_key: &str,
        participant_key: &str,
    ) -> StoreResult<Self> {
        let (tx, events) = mpsc::unbounded_channel();

        let mut session_events = store.subscribe(session_key).await?.into_stream();
        let mut participant_events = store.subscribe(participant_key).await?.into_stream();

        let session_tx = tx.clone();
        let session_task = tokio::spawn(async move {
            while let Some(event) = session_events.next().await {
                match event {
                    DocEvent::Updated(value) => {
                        let doc: SessionDoc = match serde_json::from_value(value) {
                            Ok(doc) => doc,
                            Err(err) => {
                                warn!(error = %err, "ignoring unreadable session document");
                                continue;
                            }
                        };
                        let completed = doc.status == SessionStatus::Completed;
                        if session_tx.send(PresenceEvent::SessionUpdated(doc)).is_err() {
                            break;
                        }
                        if completed
                            && session_tx.send(PresenceEvent::SessionCompleted).is_err()
                        {
                            break;
                        }
                    }
                    // A deleted session is treated like an ended one.
                    DocEvent::Deleted => {
                        let _ = session_tx.send(PresenceEvent::SessionCompleted);
                        break;
                    }
                }
            }
            debug!("session subscription forwarder stopped");
        });

        let participant_task = tokio::spawn(async move {
            while let Some(event) = participant_events.next().await {
                match event {
                    // Initial existence and subsequent self-writes: nothing
                    // to signal, the participant is the single writer.
                    DocEvent::Updated(_) => continue,
                    DocEvent::Deleted => {
                        let _ = tx.send(PresenceEvent::Kicked);
                        break;
                    }
                }
            }
            debug!("participant subscription forwarder stopped");
        });

        Ok(Self {
            events,
            tasks: vec![session_task, participant_task],
        })
    }

    /// Wait for the next presence notification; `None` after teardown of
    /// both forwarders.
    pub async fn next_event(&mut self) -> Option<PresenceEvent> {
        self.events.recv().await
    }

    /// Non-blocking poll used by synchronous drains.
    pub fn try_next(&mut self) -> Option<PresenceEvent> {
        self.events.try_recv().ok()
    }

    /// Abort both forwarder tasks. Dropping the monitor does the same.
    pub fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for PresenceMonitor {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{participant_key, session_key};
    use crate::store::MemoryStore;
    use serde_json::json;
    use uuid::Uuid;

    async fn setup() -> (Arc<MemoryStore>, String, String, PresenceMonitor) {
        let store = Arc::new(MemoryStore::new());
        let session = session_key(Uuid::new_v4());
        let participant = participant_key(Uuid::new_v4(), Uuid::new_v4());

        store
            .set(&session, serde_json::to_value(SessionDoc::waiting()).unwrap())
            .await
            .unwrap();
        store.set(&participant, json!({ "joined": true })).await.unwrap();

        let monitor = PresenceMonitor::spawn(store.clone(), &session, &participant)
            .await
            .unwrap();
        (store, session, participant, monitor)
    }

    #[tokio::test]
    async fn initial_existence_is_not_a_kick() {
        let (_store, _session, _participant, mut monitor) = setup().await;

        // The session's initial content arrives; no Kicked event ever does.
        let first = monitor.next_event().await;
        assert!(matches!(first, Some(PresenceEvent::SessionUpdated(_))));
        assert_eq!(monitor.try_next(), None);
    }

    #[tokio::test]
    async fn participant_deletion_emits_kicked_exactly_once() {
        let (store, _session, participant, mut monitor) = setup().await;
        let _ = monitor.next_event().await; // drain initial session update

        store.delete(&participant).await.unwrap();
        assert_eq!(monitor.next_event().await, Some(PresenceEvent::Kicked));

        // Recreating and re-deleting the record cannot re-trigger it: the
        // forwarder stopped after the first kick.
        store.set(&participant, json!({})).await.unwrap();
        store.delete(&participant).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(monitor.try_next(), None);
    }

    #[tokio::test]
    async fn external_completion_is_forwarded() {
        let (store, session, _participant, mut monitor) = setup().await;
        let _ = monitor.next_event().await;

        store
            .update(&session, json!({ "status": "completed" }))
            .await
            .unwrap();

        assert!(matches!(
            monitor.next_event().await,
            Some(PresenceEvent::SessionUpdated(doc)) if doc.status == SessionStatus::Completed
        ));
        assert_eq!(monitor.next_event().await, Some(PresenceEvent::SessionCompleted));
    }

    #[tokio::test]
    async fn timer_updates_flow_through_session_events() {
        let (store, session, _participant, mut monitor) = setup().await;
        let _ = monitor.next_event().await;

        store
            .update(
                &session,
                json!({ "status": "active", "timerStartedAt": 10_000, "sessionTimeLimit": 90 }),
            )
            .await
            .unwrap();

        match monitor.next_event().await {
            Some(PresenceEvent::SessionUpdated(doc)) => {
                assert_eq!(doc.status, SessionStatus::Active);
                assert_eq!(doc.timer_started_at, Some(10_000));
                assert_eq!(doc.session_time_limit, Some(90));
            }
            other => panic!("expected session update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn teardown_stops_event_delivery() {
        let (store, _session, participant, mut monitor) = setup().await;
        let _ = monitor.next_event().await;

        monitor.teardown();
        store.delete(&participant).await.unwrap();
        assert_eq!(monitor.next_event().await, None);
    }
}
