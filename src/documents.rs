//! Serde models for the documents shared through the real-time store.
//!
//! Field names follow the camelCase wire convention because the store is
//! shared with non-Rust presenter and display clients. The session document
//! has a single authoritative writer (the presenter); the participant
//! document's single writer is the owning participant client.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::grid::{CellKey, MarkedSet, WinPolicy};

/// Lifecycle status of a session, driven by the presenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Lobby: participants are joining, no timer yet.
    Waiting,
    /// Pre-game countdown on the presenter screen.
    Countdown,
    /// Game running; the timer tuple is live.
    Active,
    /// Presenter ended the session; participants must finalize.
    Completed,
}

/// Session document: presenter-written, read/subscribed by everyone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDoc {
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Wall-clock instant (epoch ms) the timer was started or resumed.
    /// Meaningful only while `timer_paused` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer_started_at: Option<u64>,
    /// Total duration of the current timer run, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_time_limit: Option<u64>,
    /// Whether the presenter has paused the timer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer_paused: Option<bool>,
    /// Remaining seconds captured at pause time; authoritative while paused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_time_remaining: Option<u64>,
}

impl SessionDoc {
    /// Fresh session in the lobby state with no timer fields.
    pub fn waiting() -> Self {
        Self {
            status: SessionStatus::Waiting,
            timer_started_at: None,
            session_time_limit: None,
            timer_paused: None,
            paused_time_remaining: None,
        }
    }
}

/// Participant document: owned and written by one participant client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDoc {
    /// Marked cells in `"row-col"` wire form.
    pub marked_cell_keys: Vec<String>,
    /// Current score.
    pub score: i64,
    /// Current consecutive-mark streak.
    pub streak: u32,
    /// Best streak reached during the attempt.
    pub best_streak: u32,
    /// Completed rows + columns + diagonals.
    pub lines_completed: usize,
    /// Whether the whole card has been marked.
    pub full_card_achieved: bool,
    /// Latched true on the first win; never unset.
    pub game_won: bool,
    /// Seconds from game start to the first win, if one occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_first_win: Option<u64>,
    /// Whether the attempt reached a terminal state.
    pub completed: bool,
    /// Active win policy, recorded for reporting.
    pub win_condition: WinPolicy,
}

impl ParticipantDoc {
    /// Decode the wire-form cell keys into a [`MarkedSet`], skipping any
    /// entry that fails to parse.
    pub fn marked_set(&self) -> MarkedSet {
        self.marked_cell_keys
            .iter()
            .filter_map(|key| CellKey::parse(key))
            .collect()
    }

    /// Encode a [`MarkedSet`] into the wire form.
    pub fn encode_marks(marked: &MarkedSet) -> Vec<String> {
        marked.iter().map(CellKey::to_string).collect()
    }
}

/// Store key of a session document.
pub fn session_key(session_id: Uuid) -> String {
    format!("sessions/{session_id}")
}

/// Store key of a participant document within a session.
pub fn participant_key(session_id: Uuid, participant_id: Uuid) -> String {
    format!("sessions/{session_id}/participants/{participant_id}")
}
