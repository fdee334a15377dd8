//! Debounced persistence of fast-changing participant state.
//!
//! Marking bursts mutate local state far faster than the shared store should
//! be written. The queue records only the latest state and arms a single
//! flush timer per window, so N rapid mutations collapse into one write of
//! the Nth state. Terminal events bypass the window entirely: the final
//! state is flushed synchronously with the finalize transition.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::store::{DocumentStore, StoreResult};

/// Default coalescing window.
pub const FLUSH_DEBOUNCE: Duration = Duration::from_millis(2_000);

/// Owner of `{pending_state, timer_handle}` with unambiguous cancellation.
///
/// At most one flush task is outstanding per window. Intermediate write
/// failures are logged and absorbed — the next coalesced write supersedes
/// them — while [`PersistQueue::flush_now`] returns its error so terminal
/// failures reach the caller.
pub struct PersistQueue<T> {
    store: Arc<dyn DocumentStore>,
    key: String,
    window: Duration,
    pending: Arc<Mutex<Slot<T>>>,
    timer: Option<JoinHandle<()>>,
}

/// Latest pending state plus whether a flush task currently owns it. Both
/// fields live under one mutex so an enqueue racing the flush task's last
/// look at the slot cannot strand a state with no task to write it.
struct Slot<T> {
    state: Option<T>,
    armed: bool,
}

impl<T> PersistQueue<T>
where
    T: Serialize + Send + 'static,
{
    /// Build a queue writing to the document at `key`.
    pub fn new(store: Arc<dyn DocumentStore>, key: String) -> Self {
        Self::with_window(store, key, FLUSH_DEBOUNCE)
    }

    /// Build a queue with a custom coalescing window.
    pub fn with_window(store: Arc<dyn DocumentStore>, key: String, window: Duration) -> Self {
        Self {
            store,
            key,
            window,
            pending: Arc::new(Mutex::new(Slot {
                state: None,
                armed: false,
            })),
            timer: None,
        }
    }

    /// Record `state` as the latest pending value and arm the flush timer
    /// if no window is currently open.
    pub fn enqueue(&mut self, state: T) {
        {
            let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            slot.state = Some(state);
            if slot.armed {
                return;
            }
            slot.armed = true;
        }

        let store = self.store.clone();
        let pending = self.pending.clone();
        let key = self.key.clone();
        let window = self.window;
        self.timer = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(window).await;
                let state = pending.lock().unwrap_or_else(|e| e.into_inner()).state.take();
                let Some(state) = state else { return };
                match serde_json::to_value(&state) {
                    Ok(value) => {
                        if let Err(err) = store.set(&key, value).await {
                            // Self-healing: the next coalesced write supersedes it.
                            warn!(%key, error = %err, "coalesced write failed; awaiting next flush");
                        }
                    }
                    Err(err) => warn!(%key, error = %err, "failed to serialize pending state"),
                }
                // An enqueue that landed while the write was in flight found
                // the slot still armed and did not open a new window; either
                // pick that state up here or disarm before returning.
                let mut slot = pending.lock().unwrap_or_else(|e| e.into_inner());
                if slot.state.is_none() {
                    slot.armed = false;
                    return;
                }
            }
        }));
    }

    /// Write `state` immediately, cancelling any pending window.
    ///
    /// Used for terminal events; no further write follows, so the error is
    /// returned instead of absorbed.
    pub async fn flush_now(&mut self, state: &T) -> StoreResult<()> {
        self.cancel_pending();
        let value = serde_json::to_value(state)?;
        self.store.set(&self.key, value).await
    }

    /// Cancel any pending flush without writing. Used on unmount so no write
    /// lands against a torn-down context.
    pub fn dispose(&mut self) {
        self.cancel_pending();
    }

    fn cancel_pending(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        slot.state = None;
        slot.armed = false;
    }
}

impl<T> Drop for PersistQueue<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
