//! Local recovery snapshots for reload/reconnect survival.
//!
//! Each participant keeps a device-local copy of their full game state,
//! keyed by `"{session_id}_{participant_id}"`. On mount the engine restores
//! from it instead of generating a fresh card — but only while the snapshot
//! is young enough and was taken for the same card size. Saves are debounced
//! so rapid marking bursts do not hammer the local store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::grid::{Grid, MarkedSet};

/// Snapshots older than this are discarded on load.
pub const SNAPSHOT_TTL_MS: u64 = 2 * 60 * 60 * 1000;
/// Quiet period before a debounced save hits the local store.
pub const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Device-local durable key-value storage (browser storage analog).
///
/// Synchronous by design: local storage APIs are, and nothing here is worth
/// a suspension point.
pub trait LocalStore: Send + Sync {
    /// Read the raw value stored under `key`.
    fn get(&self, key: &str) -> Option<String>;
    /// Create or replace the value under `key`.
    fn put(&self, key: &str, value: String);
    /// Remove the value under `key`, if present.
    fn remove(&self, key: &str);
}

/// In-memory [`LocalStore`] used by tests.
#[derive(Default)]
pub struct MemoryLocalStore {
    entries: dashmap::DashMap<String, String>,
}

impl MemoryLocalStore {
    /// Create an empty local store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    fn put(&self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Full game state captured for resume-after-reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySnapshot {
    /// The generated card, exactly as first laid out.
    pub grid: Grid,
    /// Marked cell positions.
    pub marked_cells: MarkedSet,
    /// Score at capture time.
    pub score: i64,
    /// Streak at capture time.
    pub streak: u32,
    /// Best streak at capture time.
    pub best_streak: u32,
    /// Seconds to the first win, if one had occurred.
    pub first_win_time: Option<u64>,
    /// Epoch-ms instant the attempt started.
    pub start_time_ms: u64,
    /// Remaining seconds last observed from the timer.
    pub time_remaining: u64,
    /// Lines completed at capture time.
    pub completed_lines: usize,
    /// Whether the win latch had fired.
    pub game_won: bool,
    /// Card dimension the snapshot was taken for.
    pub card_size: usize,
    /// Epoch-ms instant the snapshot was captured.
    pub captured_at_ms: u64,
}

/// Storage key for one participant's snapshot within a session.
pub fn recovery_key(session_id: Uuid, participant_id: Uuid) -> String {
    format!("{session_id}_{participant_id}")
}

/// Debounced writer/reader of recovery snapshots.
pub struct RecoveryStore {
    local: Arc<dyn LocalStore>,
    clock: SharedClock,
    key: String,
    latest: Arc<Mutex<Option<RecoverySnapshot>>>,
    timer: Option<JoinHandle<()>>,
}

impl RecoveryStore {
    /// Build a store writing under `key` (see [`recovery_key`]).
    pub fn new(local: Arc<dyn LocalStore>, clock: SharedClock, key: String) -> Self {
        Self {
            local,
            clock,
            key,
            latest: Arc::new(Mutex::new(None)),
            timer: None,
        }
    }

    /// Record the latest snapshot and arm the debounce window if idle.
    ///
    /// Bursts of saves inside one window collapse to a single write holding
    /// the last snapshot.
    pub fn save(&mut self, snapshot: RecoverySnapshot) {
        {
            let mut slot = self.latest.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(snapshot);
        }

        if self.timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let local = self.local.clone();
        let latest = self.latest.clone();
        let key = self.key.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            let snapshot = latest.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(snapshot) = snapshot {
                write_snapshot(local.as_ref(), &key, &snapshot);
            }
        }));
    }

    /// Write the snapshot immediately, cancelling any pending window.
    pub fn save_now(&mut self, snapshot: &RecoverySnapshot) {
        self.cancel_pending();
        write_snapshot(self.local.as_ref(), &self.key, snapshot);
    }

    /// Load the stored snapshot if it is still valid for `card_size`.
    ///
    /// Stale entries (past TTL, size mismatch, or unreadable) are deleted,
    /// never repaired: the caller generates a fresh grid instead.
    pub fn load(&self, card_size: usize) -> Option<RecoverySnapshot> {
        let raw = self.local.get(&self.key)?;
        let snapshot: RecoverySnapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(key = %self.key, error = %err, "discarding unreadable recovery snapshot");
                self.local.remove(&self.key);
                return None;
            }
        };

        let age = self.clock.now_ms().saturating_sub(snapshot.captured_at_ms);
        if age >= SNAPSHOT_TTL_MS || snapshot.card_size != card_size {
            debug!(
                key = %self.key,
                age_ms = age,
                snapshot_size = snapshot.card_size,
                requested_size = card_size,
                "discarding stale recovery snapshot"
            );
            self.local.remove(&self.key);
            return None;
        }

        Some(snapshot)
    }

    /// Drop the stored snapshot and any pending save. Called on terminal
    /// completion so a finished game can never be resumed.
    pub fn clear(&mut self) {
        self.cancel_pending();
        self.local.remove(&self.key);
    }

    /// Cancel any pending save without flushing. Used on teardown.
    pub fn dispose(&mut self) {
        self.cancel_pending();
    }

    fn cancel_pending(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let mut slot = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        slot.take();
    }
}

impl Drop for RecoveryStore {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn write_snapshot(local: &dyn LocalStore, key: &str, snapshot: &RecoverySnapshot) {
    match serde_json::to_string(snapshot) {
        Ok(raw) => local.put(key, raw),
        Err(err) => warn!(%key, error = %err, "failed to serialize recovery snapshot"),
    }
}
