//! Anchor-based timer synchronization.
//!
//! One authoritative writer (the presenter) publishes a small tuple —
//! anchor timestamp, total duration, paused flag, paused remaining — into
//! the session document. Every reader recomputes remaining time from that
//! tuple and its own wall clock on each tick instead of counting ticks, so
//! drift never accumulates and clients that join late or reconnect converge
//! immediately.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::clock::SharedClock;
use crate::documents::{SessionDoc, SessionStatus};
use crate::store::{DocumentStore, StoreResult};

/// Authoritative timer tuple as published in the session document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTuple {
    /// Epoch-ms instant the timer started or resumed. Meaningful only while
    /// `paused` is false.
    pub anchor_ms: u64,
    /// Total duration of the current run, in seconds.
    pub total_seconds: u64,
    /// Whether the presenter paused the timer.
    pub paused: bool,
    /// Remaining seconds captured at pause time; authoritative while paused.
    pub paused_remaining: u64,
}

impl TimerTuple {
    /// Remaining seconds at wall-clock instant `now_ms`.
    ///
    /// Exactly one side of the tuple is authoritative at a time: the paused
    /// snapshot while paused, the anchor computation otherwise.
    pub fn remaining(&self, now_ms: u64) -> u64 {
        if self.paused {
            return self.paused_remaining;
        }
        let elapsed = now_ms.saturating_sub(self.anchor_ms) / 1000;
        self.total_seconds.saturating_sub(elapsed)
    }

    /// Extract a tuple from a session document, if its timer fields are set.
    pub fn from_session(doc: &SessionDoc) -> Option<Self> {
        let paused = doc.timer_paused.unwrap_or(false);
        if paused {
            return Some(Self {
                anchor_ms: doc.timer_started_at.unwrap_or(0),
                total_seconds: doc.session_time_limit.unwrap_or(0),
                paused: true,
                paused_remaining: doc.paused_time_remaining?,
            });
        }
        Some(Self {
            anchor_ms: doc.timer_started_at?,
            total_seconds: doc.session_time_limit?,
            paused: false,
            paused_remaining: 0,
        })
    }
}

/// Presenter-side timer writer.
///
/// Holds the current tuple locally (single authoritative writer, so the
/// local copy is never stale) and mirrors every change into the session
/// document through the store.
pub struct TimerAuthority {
    store: Arc<dyn DocumentStore>,
    clock: SharedClock,
    session_key: String,
    current: Option<TimerTuple>,
}

impl TimerAuthority {
    /// Build an authority writing to the session document at `session_key`.
    pub fn new(store: Arc<dyn DocumentStore>, clock: SharedClock, session_key: String) -> Self {
        Self {
            store,
            clock,
            session_key,
            current: None,
        }
    }

    /// Tuple as last published, if the timer has been started.
    pub fn current(&self) -> Option<TimerTuple> {
        self.current
    }

    /// Start the timer for `duration_seconds` and mark the session active.
    pub async fn start(&mut self, duration_seconds: u64) -> StoreResult<()> {
        let tuple = TimerTuple {
            anchor_ms: self.clock.now_ms(),
            total_seconds: duration_seconds,
            paused: false,
            paused_remaining: 0,
        };
        self.publish(tuple, Some(SessionStatus::Active)).await
    }

    /// Pause the timer, capturing the remaining seconds.
    pub async fn pause(&mut self) -> StoreResult<()> {
        let Some(current) = self.current else {
            return Ok(());
        };
        let remaining = current.remaining(self.clock.now_ms());
        let tuple = TimerTuple {
            anchor_ms: current.anchor_ms,
            total_seconds: current.total_seconds,
            paused: true,
            paused_remaining: remaining,
        };
        self.publish(tuple, None).await
    }

    /// Resume from a pause: the captured remainder becomes a fresh run.
    pub async fn resume(&mut self) -> StoreResult<()> {
        let Some(current) = self.current else {
            return Ok(());
        };
        if !current.paused {
            return Ok(());
        }
        let tuple = TimerTuple {
            anchor_ms: self.clock.now_ms(),
            total_seconds: current.paused_remaining,
            paused: false,
            paused_remaining: 0,
        };
        self.publish(tuple, None).await
    }

    /// Restart with a fresh duration, identical to a new start.
    pub async fn restart(&mut self, duration_seconds: u64) -> StoreResult<()> {
        self.start(duration_seconds).await
    }

    async fn publish(
        &mut self,
        tuple: TimerTuple,
        status: Option<SessionStatus>,
    ) -> StoreResult<()> {
        let mut partial = json!({
            "timerStartedAt": tuple.anchor_ms,
            "sessionTimeLimit": tuple.total_seconds,
            "timerPaused": tuple.paused,
            "pausedTimeRemaining": tuple.paused_remaining,
        });
        if let Some(status) = status {
            partial["status"] = serde_json::to_value(status)?;
        }
        self.store.update(&self.session_key, partial).await?;
        debug!(key = %self.session_key, ?tuple, "timer tuple published");
        self.current = Some(tuple);
        Ok(())
    }
}

/// What a follower tick observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// Remaining seconds after this tick.
    pub remaining: u64,
    /// True exactly once, on the tick that first reached zero.
    pub expired: bool,
}

/// Participant-side timer reader.
///
/// Recomputes remaining time from the latest authority tuple on every tick.
/// Until the first tuple arrives it falls back to decrementing a locally
/// seeded countdown; the first tuple entirely supersedes that fallback.
#[derive(Debug)]
pub struct TimerFollower {
    clock: SharedClock,
    authority: Option<TimerTuple>,
    fallback_remaining: Option<u64>,
    expired: bool,
}

impl TimerFollower {
    /// Build a follower; `seed_remaining` primes the pre-authority fallback
    /// (e.g. the configured time limit or a recovered snapshot value).
    pub fn new(clock: SharedClock, seed_remaining: Option<u64>) -> Self {
        Self {
            clock,
            authority: None,
            fallback_remaining: seed_remaining,
            expired: false,
        }
    }

    /// Adopt a freshly received authority tuple, superseding the fallback.
    pub fn apply_authority(&mut self, tuple: TimerTuple) {
        self.authority = Some(tuple);
        self.fallback_remaining = None;
    }

    /// Whether an authority tuple has been received yet.
    pub fn has_authority(&self) -> bool {
        self.authority.is_some()
    }

    /// Remaining seconds right now, without consuming a fallback tick.
    pub fn remaining(&self) -> u64 {
        match (&self.authority, self.fallback_remaining) {
            (Some(tuple), _) => tuple.remaining(self.clock.now_ms()),
            (None, Some(seconds)) => seconds,
            (None, None) => 0,
        }
    }

    /// Advance one ≈1 s tick.
    ///
    /// With an authority tuple this is a pure recomputation; the fallback
    /// decrements by one per tick. `expired` latches: it is reported true on
    /// the first tick at zero and never again.
    pub fn tick(&mut self) -> TickOutcome {
        let remaining = match (&self.authority, &mut self.fallback_remaining) {
            (Some(tuple), _) => tuple.remaining(self.clock.now_ms()),
            (None, Some(seconds)) => {
                *seconds = seconds.saturating_sub(1);
                *seconds
            }
            (None, None) => return TickOutcome { remaining: 0, expired: false },
        };

        let paused = self.authority.map(|t| t.paused).unwrap_or(false);
        let expired = remaining == 0 && !paused && !self.expired;
        if expired {
            self.expired = true;
        }
        TickOutcome { remaining, expired }
    }
}
